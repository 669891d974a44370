//! Multi-platform manifests pushed with `manifest-tool`.

use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tempfile::TempDir;
use tracing::info;

use super::DockerConfigDir;
use crate::{
    error::{KrakenError, Result},
    property::{AnyProperty, Property},
    task::{Project, Task, TaskContext, TaskStatus},
    util::{Credentials, ToolCommand},
};

pub const MANIFEST_TOOL_VERSION: &str = "2.0.4";
const PLATFORM_PLACEHOLDERS: [&str; 3] = ["OS", "ARCH", "VARIANT"];

pub fn release_url(version: &str) -> String {
    format!(
        "https://github.com/estesp/manifest-tool/releases/download/v{0}/binaries-manifest-tool-{0}.tar.gz",
        version
    )
}

/// File name of the binary for this host inside a release archive.
pub fn release_binary_name() -> Result<String> {
    let os = match env::consts::OS {
        "macos" => "darwin",
        os @ ("linux" | "windows" | "freebsd") => os,
        other => {
            return Err(KrakenError::Config(format!("no manifest-tool release for OS '{}'", other)));
        }
    };
    let arch = match env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "armv7",
        "powerpc64" => "ppc64le",
        "s390x" => "s390x",
        other => {
            return Err(KrakenError::Config(format!(
                "no manifest-tool release for architecture '{}'",
                other
            )));
        }
    };
    let suffix = if os == "windows" { ".exe" } else { "" };
    Ok(format!("manifest-tool-{}-{}{}", os, arch, suffix))
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Combines per-platform images into one manifest list with `manifest-tool push from-args`.
pub struct ManifestToolPushTask {
    /// E.g. `linux/amd64`, `linux/arm64/v8`.
    pub platforms: Property<Vec<String>>,
    /// Image reference with `OS`, `ARCH` and `VARIANT` placeholders, e.g. `acme/app:1.0-ARCH`.
    pub template: Property<String>,
    /// Image reference the manifest list is pushed to.
    pub target: Property<String>,
    pub auth: Property<BTreeMap<String, Credentials>>,
    /// Use `manifest-tool` from `PATH` when present instead of downloading a release.
    pub prefer_local: Property<bool>,
    pub version: Property<String>,
}

impl ManifestToolPushTask {
    pub fn new(name: &str) -> Self {
        Self {
            platforms: Property::config(name, "platforms"),
            template: Property::config(name, "template"),
            target: Property::config(name, "target"),
            auth: Property::config(name, "auth").with_default(BTreeMap::new()),
            prefer_local: Property::config(name, "prefer_local").with_default(true),
            version: Property::config(name, "version").with_default(MANIFEST_TOOL_VERSION.to_string()),
        }
    }

    pub fn command(&self, binary: &Path, docker_cfg: Option<&Path>) -> Result<ToolCommand> {
        let mut command = ToolCommand::new(binary.to_string_lossy());
        if let Some(dir) = docker_cfg {
            command = command.arg("--docker-cfg").arg(dir.to_string_lossy());
        }
        Ok(command
            .args(["push", "from-args", "--platforms"])
            .arg(self.platforms.get()?.join(","))
            .arg("--template")
            .arg(self.template.get()?)
            .arg("--target")
            .arg(self.target.get()?))
    }

    /// `manifest-tool` from `PATH`, or the release binary, downloaded into the build directory
    /// on first use.
    pub async fn fetch_manifest_tool(&self, ctx: &TaskContext) -> Result<PathBuf> {
        if self.prefer_local.get()? {
            if let Some(path) = find_on_path("manifest-tool") {
                info!("Using {}", path.display());
                return Ok(path);
            }
        }

        let version = self.version.get()?;
        let dir = ctx
            .build_dir
            .join(".downloads")
            .join(format!("manifest-tool-{}", version));
        if !dir.is_dir() {
            download_release(&release_url(&version), &dir).await?;
        }
        let binary = dir.join(release_binary_name()?);
        if !binary.is_file() {
            return Err(KrakenError::task(
                &ctx.task_name,
                format!("manifest-tool release {} has no {}", version, binary.display()),
            ));
        }
        info!("Using {}", binary.display());
        Ok(binary)
    }
}

/// Download a `.tar.gz` release and unpack it into `dir`. The archive is unpacked next to `dir`
/// first, so an interrupted download never leaves a partial `dir` behind.
async fn download_release(url: &str, dir: &Path) -> Result<()> {
    info!("Downloading {}", url);
    let bytes = reqwest::get(url).await?.error_for_status()?.bytes().await?;
    let parent = dir.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;
    let staging = TempDir::new_in(parent)?;
    tar::Archive::new(GzDecoder::new(bytes.as_ref())).unpack(staging.path())?;
    fs::rename(staging.keep(), dir)?;
    Ok(())
}

#[async_trait]
impl Task for ManifestToolPushTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        vec![
            &self.platforms,
            &self.template,
            &self.target,
            &self.auth,
            &self.prefer_local,
            &self.version,
        ]
    }

    fn description(&self) -> Option<String> {
        Some(format!(
            "Push a manifest list for {} to {}.",
            self.platforms.get().ok()?.join(", "),
            self.target.get().ok()?
        ))
    }

    fn finalize(&self, _ctx: &TaskContext) -> Result<()> {
        if self.platforms.get()?.is_empty() {
            return Err(KrakenError::Config("manifest-tool: platforms cannot be empty".to_string()));
        }
        let template = self.template.get()?;
        if !PLATFORM_PLACEHOLDERS.iter().any(|placeholder| template.contains(placeholder)) {
            return Err(KrakenError::Config(format!(
                "manifest-tool: template '{}' contains none of OS, ARCH or VARIANT",
                template
            )));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        let binary = self.fetch_manifest_tool(ctx).await?;
        let config_dir = DockerConfigDir::for_auth(&self.auth.get()?)?;
        let command = self.command(&binary, config_dir.as_ref().map(DockerConfigDir::path))?;
        ctx.run(&command).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManifestToolOptions {
    pub auth: BTreeMap<String, Credentials>,
    /// Defaults to `true`.
    pub prefer_local: Option<bool>,
    pub version: Option<String>,
}

pub fn manifest_tool(
    project: &mut Project,
    name: &str,
    platforms: Vec<String>,
    template: &str,
    target: &str,
    options: ManifestToolOptions,
) -> Result<Arc<ManifestToolPushTask>> {
    let task = project.register(name, Some("publish"), false, ManifestToolPushTask::new)?;
    task.platforms.set(platforms)?;
    task.template.set(template.to_string())?;
    task.target.set(target.to_string())?;
    task.auth.set(options.auth)?;
    if let Some(prefer_local) = options.prefer_local {
        task.prefer_local.set(prefer_local)?;
    }
    if let Some(version) = options.version {
        task.version.set(version)?;
    }
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> ManifestToolPushTask {
        let task = ManifestToolPushTask::new("manifestTool");
        task.platforms
            .set(vec!["linux/amd64".to_string(), "linux/arm64/v8".to_string()])
            .unwrap();
        task.template
            .set("registry.example.test/app:1.0-ARCHVARIANT".to_string())
            .unwrap();
        task.target.set("registry.example.test/app:1.0".to_string()).unwrap();
        task
    }

    #[test]
    fn push_from_args() {
        let command = task()
            .command(Path::new("/opt/manifest-tool"), Some(Path::new("/tmp/docker-cfg")))
            .unwrap();
        assert_eq!(command.program(), "/opt/manifest-tool");
        assert_eq!(
            command.get_args(),
            [
                "--docker-cfg",
                "/tmp/docker-cfg",
                "push",
                "from-args",
                "--platforms",
                "linux/amd64,linux/arm64/v8",
                "--template",
                "registry.example.test/app:1.0-ARCHVARIANT",
                "--target",
                "registry.example.test/app:1.0",
            ]
        );
    }

    #[test]
    fn template_needs_a_placeholder() {
        let project = Project::new("demo", "/tmp/demo");
        let ctx = project.context("manifestTool", Default::default(), None);
        let task = task();
        assert!(task.finalize(&ctx).is_ok());

        task.template.set("registry.example.test/app:1.0".to_string()).unwrap();
        assert!(matches!(task.finalize(&ctx), Err(KrakenError::Config(_))));

        let empty = ManifestToolPushTask::new("manifestTool");
        empty.platforms.set(Vec::new()).unwrap();
        empty.template.set("app:ARCH".to_string()).unwrap();
        empty.target.set("app".to_string()).unwrap();
        assert!(empty.finalize(&ctx).is_err());
    }

    #[test]
    fn release_names_match_the_published_binaries() {
        assert_eq!(
            release_url("2.0.4"),
            "https://github.com/estesp/manifest-tool/releases/download/v2.0.4/binaries-manifest-tool-2.0.4.tar.gz"
        );
        if cfg!(all(target_os = "linux", target_arch = "x86_64")) {
            assert_eq!(release_binary_name().unwrap(), "manifest-tool-linux-amd64");
        }
    }

    #[tokio::test]
    async fn downloaded_release_is_reused() {
        let dir = TempDir::new().unwrap();
        let project = Project::new("demo", dir.path());
        let ctx = project.context("manifestTool", Default::default(), None);
        let task = task();
        task.prefer_local.set(false).unwrap();
        task.version.set("0.0.0-test".to_string()).unwrap();

        let release_dir = ctx.build_dir.join(".downloads/manifest-tool-0.0.0-test");
        fs::create_dir_all(&release_dir).unwrap();
        let binary = release_dir.join(release_binary_name().unwrap());
        fs::write(&binary, "").unwrap();
        assert_eq!(task.fetch_manifest_tool(&ctx).await.unwrap(), binary);

        fs::remove_file(&binary).unwrap();
        let err = task.fetch_manifest_tool(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("manifest-tool release 0.0.0-test has no"));
    }
}
