use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tempfile::TempDir;
use tracing::warn;

use super::{BuildBackend, DockerBuildConfig, render_docker_auth};
use crate::{
    error::{KrakenError, Result},
    task::{TaskContext, TaskStatus},
    util::{ToolCommand, shell_quote},
};

const IN_CONTAINER_DOCKERFILE: &str = "/kaniko/Dockerfile";
const IN_CONTAINER_OUTPUT_DIR: &str = "/kaniko/out";
const DOCKER_CONFIG_VAR: &str = "KRAKEN_KANIKO_DOCKER_CONFIG";
const SECRET_VAR_PREFIX: &str = "KRAKEN_KANIKO_SECRET_";

/// What to do when caching is requested but Kaniko has nowhere to write the cache to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KanikoCachePolicy {
    #[default]
    WarnAndDisable,
    Fail,
}

/// Builds inside the Kaniko executor image. The executor only accepts one command, so writing
/// the auth config, writing the secrets and the executor call are combined into a single `sh -c`
/// script. The values themselves reach the container through `docker run -e NAME`, never argv.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KanikoBackend {
    pub image: String,
    /// Where the build context is mounted in the container.
    pub context: String,
    pub cache_copy_layers: bool,
    pub snapshot_mode: String,
    pub secrets_mount_dir: String,
    pub cache_policy: KanikoCachePolicy,
}

impl Default for KanikoBackend {
    fn default() -> Self {
        Self {
            image: "gcr.io/kaniko-project/executor:debug".to_string(),
            context: "/workspace".to_string(),
            cache_copy_layers: true,
            snapshot_mode: "redo".to_string(),
            secrets_mount_dir: "/run/secrets".to_string(),
            cache_policy: KanikoCachePolicy::default(),
        }
    }
}

/// The `docker run` invocation for one Kaniko build, plus the tarball to `docker load` afterwards.
pub struct KanikoInvocation {
    pub command: ToolCommand,
    pub load_file: Option<PathBuf>,
    /// Holds the synthesized output file until the image is loaded.
    _tempdir: Option<TempDir>,
}

impl KanikoBackend {
    fn cache_without_target(config: &DockerBuildConfig) -> bool {
        config.cache && !config.push && config.cache_repo.is_none()
    }

    pub fn executor_command(
        &self,
        config: &DockerBuildConfig,
        dockerfile: Option<&str>,
        tar_path: Option<&str>,
    ) -> Result<Vec<String>> {
        if tar_path.is_some() && config.tags.is_empty() {
            return Err(KrakenError::Config(
                "Need at least one destination (tag) when exporting to an image tarball".to_string(),
            ));
        }
        let mut command = vec!["/kaniko/executor".to_string()];
        for (key, value) in &config.build_args {
            command.push("--build-arg".to_string());
            command.push(format!("{}={}", key, value));
        }
        if let Some(cache_repo) = &config.cache_repo {
            command.push("--cache-repo".to_string());
            command.push(cache_repo.clone());
        }
        if config.cache {
            command.push("--cache=true".to_string());
        }
        for tag in &config.tags {
            command.push("--destination".to_string());
            command.push(tag.clone());
        }
        if let Some(dockerfile) = dockerfile {
            command.push("--dockerfile".to_string());
            command.push(dockerfile.to_string());
        }
        if !config.push {
            command.push("--no-push".to_string());
        }
        command.push("--snapshotMode".to_string());
        command.push(self.snapshot_mode.clone());
        if config.squash {
            command.push("--single-snapshot".to_string());
        }
        if self.cache_copy_layers {
            command.push("--cache-copy-layers".to_string());
        }
        if let Some(target) = &config.target {
            command.push("--target".to_string());
            command.push(target.clone());
        }
        if let Some(tar_path) = tar_path {
            command.push("--tarPath".to_string());
            command.push(tar_path.to_string());
        }
        command.push("--context".to_string());
        command.push(self.context.clone());
        Ok(command)
    }

    /// Variables carrying the auth config and the secrets into the container. Secret `i` (in
    /// name order) travels as `KRAKEN_KANIKO_SECRET_<i>`, so secret names need not be valid
    /// variable names.
    pub fn secret_env(&self, config: &DockerBuildConfig) -> Result<Vec<(String, String)>> {
        let mut env = vec![(DOCKER_CONFIG_VAR.to_string(), render_docker_auth(&config.auth, true)?)];
        env.extend(
            config
                .secrets
                .values()
                .enumerate()
                .map(|(index, value)| (format!("{}{}", SECRET_VAR_PREFIX, index), value.clone())),
        );
        Ok(env)
    }

    /// Script run in the executor container: write the auth config, write the secrets, build.
    pub fn script(&self, config: &DockerBuildConfig, executor_command: &[String]) -> String {
        let mut script = vec![
            "mkdir -p /kaniko/.docker".to_string(),
            format!("printf '%s' \"${}\" > /kaniko/.docker/config.json", DOCKER_CONFIG_VAR),
        ];
        let mut vars = vec![DOCKER_CONFIG_VAR.to_string()];
        if !config.secrets.is_empty() {
            script.push(format!("mkdir -p {}", shell_quote(&self.secrets_mount_dir)));
            for (index, name) in config.secrets.keys().enumerate() {
                let var = format!("{}{}", SECRET_VAR_PREFIX, index);
                let path = format!("{}/{}", self.secrets_mount_dir, name);
                script.push(format!("printf '%s' \"${}\" > {}", var, shell_quote(&path)));
                vars.push(var);
            }
        }
        script.push(format!("unset {}", vars.join(" ")));
        script.push(
            executor_command
                .iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" "),
        );
        script.join("\n")
    }

    /// Mounts the context, plus the Dockerfile when it lives outside the context and the output
    /// directory when a tarball is produced. `load` always produces a tarball.
    pub fn invocation(&self, config: &DockerBuildConfig) -> Result<KanikoInvocation> {
        let context = std::path::absolute(&config.build_context)?;
        let mut volumes = vec![format!("{}:{}", context.display(), self.context)];

        let dockerfile = match &config.dockerfile {
            Some(path) => {
                let path = std::path::absolute(path)?;
                match path.strip_prefix(&context) {
                    Ok(relative) => Some(relative.to_string_lossy().into_owned()),
                    Err(_) => {
                        volumes.push(format!("{}:{}", path.display(), IN_CONTAINER_DOCKERFILE));
                        Some(IN_CONTAINER_DOCKERFILE.to_string())
                    }
                }
            }
            None => None,
        };

        let mut tempdir = None;
        let image_output_file = match &config.image_output_file {
            Some(path) => Some(std::path::absolute(path)?),
            None if config.load => {
                let dir = TempDir::new()?;
                let path = dir.path().join("image.tgz");
                tempdir = Some(dir);
                Some(path)
            }
            None => None,
        };

        let tar_path = match &image_output_file {
            Some(file) => {
                let parent = file.parent().unwrap_or(Path::new("/"));
                let file_name = file
                    .file_name()
                    .ok_or_else(|| KrakenError::Config(format!("invalid image output file {}", file.display())))?;
                volumes.push(format!("{}:{}", parent.display(), IN_CONTAINER_OUTPUT_DIR));
                Some(format!("{}/{}", IN_CONTAINER_OUTPUT_DIR, file_name.to_string_lossy()))
            }
            None => None,
        };

        let executor = self.executor_command(config, dockerfile.as_deref(), tar_path.as_deref())?;
        let script = self.script(config, &executor);

        let mut command = ToolCommand::new("docker").args(["run", "--rm", "--entrypoint", ""]);
        for volume in &volumes {
            command = command.args(["-v", volume.as_str()]);
        }
        for (key, value) in self.secret_env(config)? {
            command = command.args(["-e", key.as_str()]).env(key, value);
        }
        command = command.args(["-w", self.context.as_str()]);
        if let Some(platform) = &config.platform {
            command = command.args(["--platform", platform.as_str()]);
        }
        command = command.arg(&self.image).args(["sh", "-c"]).arg(script);
        for secret in config.secret_values() {
            command = command.secret(secret);
        }

        Ok(KanikoInvocation {
            command,
            load_file: if config.load { image_output_file } else { None },
            _tempdir: tempdir,
        })
    }
}

#[async_trait]
impl BuildBackend for KanikoBackend {
    fn name(&self) -> &'static str {
        "kaniko"
    }

    fn validate(&self, config: &DockerBuildConfig) -> Result<()> {
        if let Some(cache_repo) = &config.cache_repo {
            if cache_repo.contains(':') {
                return Err(KrakenError::Config(format!(
                    "Kaniko --cache-repo argument cannot contain `:` (got: '{}')",
                    cache_repo
                )));
            }
        }
        if self.cache_policy == KanikoCachePolicy::Fail && Self::cache_without_target(config) {
            return Err(KrakenError::Config(
                "Kaniko cannot cache without push or cache_repo".to_string(),
            ));
        }
        Ok(())
    }

    fn adjust(&self, config: &mut DockerBuildConfig) {
        if Self::cache_without_target(config) {
            warn!("Disabling cache in Kaniko build because it must be combined with push or cache_repo");
            config.cache = false;
        }
    }

    async fn build(&self, config: &DockerBuildConfig, ctx: &TaskContext) -> Result<TaskStatus> {
        let invocation = self.invocation(config)?;
        let status = ctx.run(&invocation.command).await?;
        if status.is_failed() {
            return Ok(status);
        }
        match &invocation.load_file {
            Some(file) => {
                let load = ToolCommand::new("docker").args(["load", "-i"]).arg(file.to_string_lossy());
                ctx.run(&load).await
            }
            None => Ok(status),
        }
    }
}
