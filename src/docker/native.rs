use std::{fs, path::Path};

use async_trait::async_trait;
use serde::Deserialize;
use tempfile::TempDir;
use tracing::warn;

use super::{BuildBackend, DockerBuildConfig, DockerConfigDir, prepend_secret_mounts};
use crate::{
    error::Result,
    task::{TaskContext, TaskStatus},
    util::ToolCommand,
};

/// Plain `docker build`. The image always ends up in the local daemon; pushing is a separate
/// `docker push` per tag.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NativeBackend {
    pub use_buildkit: bool,
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self { use_buildkit: true }
    }
}

impl NativeBackend {
    /// `secrets_dir` holds one file per secret, referenced with `--secret id=X,src=FILE`.
    pub fn command(&self, config: &DockerBuildConfig, secrets_dir: &Path) -> ToolCommand {
        let mut command = ToolCommand::new("docker")
            .arg("build")
            .arg(config.build_context.to_string_lossy());
        if let Some(dockerfile) = &config.dockerfile {
            command = command.arg("-f").arg(dockerfile.to_string_lossy());
        }
        if let Some(platform) = &config.platform {
            command = command.args(["--platform", platform.as_str()]);
        }
        for (key, value) in &config.build_args {
            command = command.arg("--build-arg").arg(format!("{}={}", key, value));
        }
        if !config.cache {
            command = command.arg("--no-cache");
        }
        for tag in &config.tags {
            command = command.args(["--tag", tag.as_str()]);
        }
        if let Some(target) = &config.target {
            command = command.args(["--target", target.as_str()]);
        }
        if let Some(file) = &config.image_output_file {
            command = command
                .arg("--output")
                .arg(format!("type=tar,dest={}", file.display()));
        }
        for key in config.secrets.keys() {
            let src = secrets_dir.join(key);
            command = command
                .arg("--secret")
                .arg(format!("id={},src={}", key, src.display()));
        }
        command.env("DOCKER_BUILDKIT", if self.use_buildkit { "1" } else { "0" })
    }
}

#[async_trait]
impl BuildBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn adjust(&self, config: &mut DockerBuildConfig) {
        if config.cache_repo.take().is_some() {
            warn!("cache_repo is not supported by the native docker backend");
        }
        if config.squash {
            warn!("squash is not supported by the native docker backend");
            config.squash = false;
        }
        if !config.load {
            warn!("load is not supported by the native docker backend, the image is always loaded");
            config.load = true;
        }
    }

    fn preprocess_dockerfile(&self, content: &str, config: &DockerBuildConfig) -> String {
        let ids: Vec<&str> = config.secrets.keys().map(String::as_str).collect();
        prepend_secret_mounts(content, &ids)
    }

    fn preprocess_by_default(&self, config: &DockerBuildConfig) -> bool {
        self.use_buildkit && !config.secrets.is_empty()
    }

    async fn build(&self, config: &DockerBuildConfig, ctx: &TaskContext) -> Result<TaskStatus> {
        let secrets_dir = TempDir::new()?;
        for (key, value) in &config.secrets {
            fs::write(secrets_dir.path().join(key), value)?;
        }
        let config_dir = DockerConfigDir::for_auth(&config.auth)?;
        let with_auth = |command: ToolCommand| match &config_dir {
            Some(dir) => command.env("DOCKER_CONFIG", dir.path().to_string_lossy()),
            None => command,
        };

        let status = ctx.run(&with_auth(self.command(config, secrets_dir.path()))).await?;
        drop(secrets_dir);
        if status.is_failed() || !config.push {
            return Ok(status);
        }
        for tag in &config.tags {
            let push = with_auth(ToolCommand::new("docker").args(["push", tag.as_str()]));
            let status = ctx.run(&push).await?;
            if status.is_failed() {
                return Ok(status);
            }
        }
        Ok(TaskStatus::succeeded(format!("pushed {}", config.tags.join(", "))))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, path::PathBuf};

    use super::*;

    #[test]
    fn unsupported_options_are_dropped_with_a_warning() {
        let mut config = DockerBuildConfig {
            cache_repo: Some("registry.example.test/cache".into()),
            squash: true,
            ..Default::default()
        };
        NativeBackend::default().adjust(&mut config);
        assert_eq!(config.cache_repo, None);
        assert!(!config.squash);
        assert!(config.load);
    }

    #[test]
    fn secrets_are_passed_as_files() {
        let mut secrets = BTreeMap::new();
        secrets.insert("npmrc".to_string(), "//registry/:_authToken=abc".to_string());
        let config = DockerBuildConfig {
            build_context: PathBuf::from("/src/app"),
            secrets,
            cache: false,
            tags: vec!["app:1".into()],
            ..Default::default()
        };
        let command = NativeBackend { use_buildkit: false }.command(&config, Path::new("/tmp/s"));
        assert_eq!(
            command.get_args(),
            [
                "build",
                "/src/app",
                "--no-cache",
                "--tag",
                "app:1",
                "--secret",
                "id=npmrc,src=/tmp/s/npmrc",
            ]
        );
        assert_eq!(command.get_env("DOCKER_BUILDKIT"), Some("0"));
    }
}
