use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use super::{BuildBackend, DockerBuildConfig, DockerConfigDir, prepend_secret_mounts};
use crate::{
    error::Result,
    task::{TaskContext, TaskStatus},
    util::ToolCommand,
};

fn docker_driver_regex() -> &'static Regex {
    static DRIVER: OnceLock<Regex> = OnceLock::new();
    DRIVER.get_or_init(|| Regex::new(r"Driver:\s*docker\n").unwrap())
}

/// `docker buildx build`. Secrets are passed by environment variable and mounted into `RUN`
/// steps, so the Dockerfile is preprocessed whenever there are secrets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildxBackend;

impl BuildxBackend {
    pub fn command(&self, config: &DockerBuildConfig) -> ToolCommand {
        let mut command = ToolCommand::new("docker")
            .args(["buildx", "build"])
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
        for key in config.secrets.keys() {
            command = command.arg("--secret").arg(format!("id={}", key));
        }
        if let Some(cache_repo) = &config.cache_repo {
            command = command
                .arg("--cache-to")
                .arg(format!("type=registry,ref={}", cache_repo))
                .arg("--cache-from")
                .arg(format!("type=registry,ref={}", cache_repo));
        }
        if !config.cache {
            command = command.arg("--no-cache");
        }
        for tag in &config.tags {
            command = command.args(["--tag", tag.as_str()]);
        }
        if config.push {
            command = command.arg("--push");
        }
        if config.squash {
            command = command.arg("--squash");
        }
        if let Some(target) = &config.target {
            command = command.args(["--target", target.as_str()]);
        }
        if let Some(file) = &config.image_output_file {
            command = command
                .arg("--output")
                .arg(format!("type=tar,dest={}", file.display()));
        }
        if config.load {
            command = command.arg("--load");
        }
        // `--secret id=X` reads the value from the environment variable X.
        for (key, value) in &config.secrets {
            command = command.env(key.as_str(), value.as_str()).secret(value.as_str());
        }
        command
    }

    /// The default `docker` driver cannot export caches; switch to a container driver if needed.
    async fn ensure_cache_driver(&self, config: &DockerBuildConfig, ctx: &TaskContext) -> Result<()> {
        if config.cache_repo.is_none() {
            return Ok(());
        }
        let output = ToolCommand::new("docker")
            .args(["buildx", "inspect"])
            .cwd(&ctx.project_dir)
            .output()
            .await?;
        let inspect = String::from_utf8_lossy(&output.stdout);
        if docker_driver_regex().is_match(&inspect) {
            info!("Creating a new Buildx builder, the docker driver does not support cache exports");
            let create = ToolCommand::new("docker").args(["buildx", "create", "--use"]);
            let status = ctx.run(&create).await?;
            if status.is_failed() {
                warn!("Could not create a Buildx builder: {}", status);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BuildBackend for BuildxBackend {
    fn name(&self) -> &'static str {
        "buildx"
    }

    fn adjust(&self, config: &mut DockerBuildConfig) {
        if !config.load && !config.push {
            warn!("Activating --load because one of --load or --push is necessary with Buildx");
            config.load = true;
        }
    }

    fn preprocess_dockerfile(&self, content: &str, config: &DockerBuildConfig) -> String {
        let ids: Vec<&str> = config.secrets.keys().map(String::as_str).collect();
        prepend_secret_mounts(content, &ids)
    }

    fn preprocess_by_default(&self, config: &DockerBuildConfig) -> bool {
        !config.secrets.is_empty()
    }

    async fn build(&self, config: &DockerBuildConfig, ctx: &TaskContext) -> Result<TaskStatus> {
        self.ensure_cache_driver(config, ctx).await?;
        let mut command = self.command(config);
        let config_dir = DockerConfigDir::for_auth(&config.auth)?;
        if let Some(dir) = &config_dir {
            command = command.env("DOCKER_CONFIG", dir.path().to_string_lossy());
        }
        ctx.run(&command).await
    }
}
