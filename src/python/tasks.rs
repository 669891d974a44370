use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tempfile::TempDir;
use tracing::{info, warn};

use super::{
    PYTHON_INSTALL_TASK, PythonBuildSystem, PythonConfig,
    buildsystem::activate, poetry_toml_with_credentials,
};
use crate::{
    error::{KrakenError, Result},
    fs::AtomicFileSwap,
    property::{AnyProperty, Property},
    task::{ExitCodeMap, Relationship, Task, TaskContext, TaskStatus},
    util::{Credentials, ToolCommand},
};

/// Exit code of pytest when it collected no tests.
const PYTEST_NO_TESTS_COLLECTED: i32 = 5;

/// Properties shared by tools that run inside the project's managed environment.
pub struct PythonTool {
    pub settings: Property<PythonConfig>,
    pub config_file: Property<Option<PathBuf>>,
    pub additional_args: Property<Vec<String>>,
    pub additional_files: Property<Vec<PathBuf>>,
}

impl PythonTool {
    pub fn new(owner: &str) -> Self {
        Self {
            settings: Property::new(owner, "settings").with_default(PythonConfig::default()),
            config_file: Property::config(owner, "config_file").with_default(None),
            additional_args: Property::config(owner, "additional_args").with_default(Vec::new()),
            additional_files: Property::config(owner, "additional_files").with_default(Vec::new()),
        }
    }

    fn properties(&self) -> [&dyn AnyProperty; 4] {
        [
            &self.settings,
            &self.config_file,
            &self.additional_args,
            &self.additional_files,
        ]
    }

    fn relationships() -> Vec<Relationship> {
        vec![Relationship::after(format!(":{}?", PYTHON_INSTALL_TASK))]
    }

    /// `program` followed by the source and tests directories and any additional files.
    fn command(&self, program: &str, ctx: &TaskContext) -> Result<ToolCommand> {
        let settings = self.settings.get()?;
        Ok(ToolCommand::new(program)
            .arg(settings.source_directory.to_string_lossy())
            .args(settings.tests_directory_args(&ctx.project_dir))
            .args(
                self.additional_files
                    .get()?
                    .iter()
                    .map(|file| file.to_string_lossy().into_owned()),
            ))
    }

    async fn run(&self, command: ToolCommand, ctx: &TaskContext, codes: &ExitCodeMap) -> Result<TaskStatus> {
        let command = command.args(self.additional_args.get()?);
        let command = match self.settings.get()?.build_system {
            Some(build_system) => match build_system.environment_path(&ctx.project_dir).await? {
                Some(env_path) => activate(command, &env_path)?,
                None => {
                    warn!("Managed {} environment does not exist", build_system);
                    command
                }
            },
            None => command,
        };
        ctx.run_with(&command, codes).await
    }
}

/// `black`, either formatting or only checking.
pub struct BlackTask {
    pub tool: PythonTool,
    pub check_only: Property<bool>,
}

impl BlackTask {
    pub fn new(name: &str) -> Self {
        Self {
            tool: PythonTool::new(name),
            check_only: Property::config(name, "check_only").with_default(false),
        }
    }

    pub fn command(&self, ctx: &TaskContext) -> Result<ToolCommand> {
        let mut command = self.tool.command("black", ctx)?;
        if self.check_only.get()? {
            command = command.arg("--check");
        }
        if let Some(config) = self.tool.config_file.get()? {
            command = command.arg("--config").arg(config.to_string_lossy());
        }
        Ok(command)
    }
}

#[async_trait]
impl Task for BlackTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        let mut properties: Vec<&dyn AnyProperty> = vec![&self.check_only];
        properties.extend(self.tool.properties());
        properties
    }

    fn description(&self) -> Option<String> {
        Some(if self.check_only.get_or(false) {
            "Check Python formatting with black.".to_string()
        } else {
            "Format Python code with black.".to_string()
        })
    }

    fn relationships(&self) -> Vec<Relationship> {
        PythonTool::relationships()
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        self.tool.run(self.command(ctx)?, ctx, &ExitCodeMap::default()).await
    }
}

/// `isort`, either sorting imports or only checking.
pub struct IsortTask {
    pub tool: PythonTool,
    pub check_only: Property<bool>,
}

impl IsortTask {
    pub fn new(name: &str) -> Self {
        Self {
            tool: PythonTool::new(name),
            check_only: Property::config(name, "check_only").with_default(false),
        }
    }

    pub fn command(&self, ctx: &TaskContext) -> Result<ToolCommand> {
        let mut command = self.tool.command("isort", ctx)?;
        if self.check_only.get()? {
            command = command.arg("--check-only");
        }
        if let Some(config) = self.tool.config_file.get()? {
            command = command.arg("--settings-file").arg(config.to_string_lossy());
        }
        Ok(command)
    }
}

#[async_trait]
impl Task for IsortTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        let mut properties: Vec<&dyn AnyProperty> = vec![&self.check_only];
        properties.extend(self.tool.properties());
        properties
    }

    fn relationships(&self) -> Vec<Relationship> {
        PythonTool::relationships()
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        self.tool.run(self.command(ctx)?, ctx, &ExitCodeMap::default()).await
    }
}

pub struct Flake8Task {
    pub tool: PythonTool,
}

impl Flake8Task {
    pub fn new(name: &str) -> Self {
        Self {
            tool: PythonTool::new(name),
        }
    }

    pub fn command(&self, ctx: &TaskContext) -> Result<ToolCommand> {
        let mut command = self.tool.command("flake8", ctx)?;
        if let Some(config) = self.tool.config_file.get()? {
            command = command.arg("--config").arg(config.to_string_lossy());
        }
        Ok(command)
    }
}

#[async_trait]
impl Task for Flake8Task {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        self.tool.properties().to_vec()
    }

    fn relationships(&self) -> Vec<Relationship> {
        PythonTool::relationships()
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        self.tool.run(self.command(ctx)?, ctx, &ExitCodeMap::default()).await
    }
}

pub struct MypyTask {
    pub tool: PythonTool,
}

impl MypyTask {
    pub fn new(name: &str) -> Self {
        Self {
            tool: PythonTool::new(name),
        }
    }

    pub fn command(&self, ctx: &TaskContext) -> Result<ToolCommand> {
        let mut command = self.tool.command("mypy", ctx)?;
        if let Some(config) = self.tool.config_file.get()? {
            command = command.arg("--config-file").arg(config.to_string_lossy());
        }
        Ok(command)
    }
}

#[async_trait]
impl Task for MypyTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        self.tool.properties().to_vec()
    }

    fn relationships(&self) -> Vec<Relationship> {
        PythonTool::relationships()
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        self.tool.run(self.command(ctx)?, ctx, &ExitCodeMap::default()).await
    }
}

pub struct PytestTask {
    pub tool: PythonTool,
    /// Detected from the project settings when unset.
    pub tests_dir: Property<Option<PathBuf>>,
    pub ignore_dirs: Property<Vec<PathBuf>>,
    pub allow_no_tests: Property<bool>,
}

impl PytestTask {
    pub fn new(name: &str) -> Self {
        Self {
            tool: PythonTool::new(name),
            tests_dir: Property::config(name, "tests_dir").with_default(None),
            ignore_dirs: Property::config(name, "ignore_dirs").with_default(Vec::new()),
            allow_no_tests: Property::config(name, "allow_no_tests").with_default(false),
        }
    }

    fn tests_dir(&self, ctx: &TaskContext) -> Result<Option<PathBuf>> {
        Ok(match self.tests_dir.get()? {
            Some(dir) => Some(dir),
            None => self.tool.settings.get()?.tests_directory(&ctx.project_dir),
        })
    }

    pub fn command(&self, tests_dir: &Path, ctx: &TaskContext) -> Result<ToolCommand> {
        let mut command = ToolCommand::new("pytest")
            .arg("-vv")
            .arg(ctx.resolve(tests_dir).to_string_lossy());
        for dir in self.ignore_dirs.get()? {
            command = command.arg("--ignore").arg(ctx.resolve(&dir).to_string_lossy());
        }
        Ok(command)
    }

    fn exit_codes(&self) -> Result<ExitCodeMap> {
        let codes = ExitCodeMap::default();
        Ok(if self.allow_no_tests.get()? {
            codes.accept(PYTEST_NO_TESTS_COLLECTED, "no tests collected")
        } else {
            codes
        })
    }
}

#[async_trait]
impl Task for PytestTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        let mut properties: Vec<&dyn AnyProperty> =
            vec![&self.tests_dir, &self.ignore_dirs, &self.allow_no_tests];
        properties.extend(self.tool.properties());
        properties
    }

    fn description(&self) -> Option<String> {
        Some("Run the Python test suite with pytest.".to_string())
    }

    fn relationships(&self) -> Vec<Relationship> {
        PythonTool::relationships()
    }

    async fn prepare(&self, ctx: &TaskContext) -> Result<Option<TaskStatus>> {
        if self.allow_no_tests.get()? && self.tests_dir(ctx)?.is_none() {
            return Ok(Some(TaskStatus::Skipped("no tests directory".to_string())));
        }
        Ok(None)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        let Some(tests_dir) = self.tests_dir(ctx)? else {
            return Ok(TaskStatus::failed(
                "no test directory configured and none could be detected",
            ));
        };
        let command = self.command(&tests_dir, ctx)?;
        self.tool.run(command, ctx, &self.exit_codes()?).await
    }
}

/// Creates the managed environment and installs the project into it.
pub struct PythonInstallTask {
    pub settings: Property<PythonConfig>,
}

impl PythonInstallTask {
    pub fn new(name: &str) -> Self {
        Self {
            settings: Property::new(name, "settings").with_default(PythonConfig::default()),
        }
    }
}

#[async_trait]
impl Task for PythonInstallTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        vec![&self.settings]
    }

    fn description(&self) -> Option<String> {
        Some("Install the Python project into its managed environment.".to_string())
    }

    async fn prepare(&self, ctx: &TaskContext) -> Result<Option<TaskStatus>> {
        let Some(build_system) = self.settings.get()?.build_system else {
            return Ok(Some(TaskStatus::Skipped("no Python build system".to_string())));
        };
        Ok(match build_system.environment_path(&ctx.project_dir).await? {
            Some(path) => Some(TaskStatus::UpToDate(Some(format!(
                "environment exists at {}",
                path.display()
            )))),
            None => None,
        })
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        let settings = self.settings.get()?;
        let build_system = settings
            .build_system
            .ok_or_else(|| KrakenError::task(&ctx.task_name, "no Python build system configured"))?;

        // Poetry reads index credentials from poetry.toml, which must not keep them afterwards.
        let poetry_toml = ctx.project_dir.join("poetry.toml");
        let existing = match fs::read_to_string(&poetry_toml) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let swap = match build_system {
            PythonBuildSystem::Poetry => {
                match poetry_toml_with_credentials(existing.as_deref(), &settings.indexes)? {
                    Some(content) => Some(AtomicFileSwap::replace(&poetry_toml, content.as_bytes(), true, false)?),
                    None => None,
                }
            }
            PythonBuildSystem::Slap => None,
        };

        let mut status = TaskStatus::Succeeded(None);
        for command in build_system.install_commands() {
            status = ctx.run(&command).await?;
            if status.is_failed() {
                break;
            }
        }
        if let Some(swap) = swap {
            swap.restore()?;
        }
        Ok(status)
    }
}

/// Move `src` to `dst`, falling back to copy and delete across file systems.
fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if fs::rename(src, dst).is_err() {
        fs::copy(src, dst)?;
        fs::remove_file(src)?;
    }
    Ok(())
}

/// Builds sdist and wheel with the project's build system. The produced files are published
/// through `output_files`.
pub struct PythonBuildTask {
    pub settings: Property<PythonConfig>,
    pub as_version: Property<Option<String>>,
    /// Defaults to the task's build directory.
    pub output_directory: Property<Option<PathBuf>>,
    pub output_files: Property<Vec<PathBuf>>,
}

impl PythonBuildTask {
    pub fn new(name: &str) -> Self {
        Self {
            settings: Property::new(name, "settings").with_default(PythonConfig::default()),
            as_version: Property::config(name, "as_version").with_default(None),
            output_directory: Property::config(name, "output_directory").with_default(None),
            output_files: Property::output(name, "output_files"),
        }
    }
}

#[async_trait]
impl Task for PythonBuildTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        vec![
            &self.settings,
            &self.as_version,
            &self.output_directory,
            &self.output_files,
        ]
    }

    fn description(&self) -> Option<String> {
        Some("Build Python distributions.".to_string())
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        let build_system = self
            .settings
            .get()?
            .build_system
            .ok_or_else(|| KrakenError::task(&ctx.task_name, "no Python build system configured"))?;

        if let Some(version) = self.as_version.get()? {
            let status = ctx.run(&build_system.version_command(&version)).await?;
            if status.is_failed() {
                return Ok(status);
            }
        }

        let staging = TempDir::new()?;
        let produced_dir = build_system.build_output_dir(&ctx.project_dir, staging.path());
        let output_dir = match self.output_directory.get()? {
            Some(dir) => ctx.resolve(&dir),
            None => ctx.task_build_dir(),
        };
        // Start from an empty dist/ so that everything in it afterwards is ours.
        if produced_dir.is_dir() && !produced_dir.starts_with(staging.path()) {
            fs::remove_dir_all(&produced_dir)?;
        }

        let status = ctx.run(&build_system.build_command(staging.path())).await?;
        if status.is_failed() {
            return Ok(status);
        }

        fs::create_dir_all(&output_dir)?;
        let mut files = Vec::new();
        for entry in fs::read_dir(&produced_dir)? {
            let src = entry?.path();
            let dst = output_dir.join(src.file_name().unwrap_or_default());
            move_file(&src, &dst)?;
            files.push(dst);
        }
        files.sort();
        if !produced_dir.starts_with(staging.path()) && !output_dir.starts_with(&produced_dir) {
            fs::remove_dir_all(&produced_dir)?;
        }

        info!("Built {} distribution(s) into {}", files.len(), output_dir.display());
        let message = format!("{} distribution(s)", files.len());
        self.output_files.set(files)?;
        Ok(TaskStatus::succeeded(message))
    }
}

/// `twine upload` to one package index. The password travels in `TWINE_PASSWORD`.
#[derive(Debug)]
pub struct PythonPublishTask {
    pub repository_url: Property<String>,
    pub credentials: Property<Option<Credentials>>,
    pub distributions: Property<Vec<PathBuf>>,
    pub skip_existing: Property<bool>,
}

impl PythonPublishTask {
    pub fn new(name: &str) -> Self {
        Self {
            repository_url: Property::config(name, "repository_url"),
            credentials: Property::config(name, "credentials").with_default(None),
            distributions: Property::new(name, "distributions"),
            skip_existing: Property::config(name, "skip_existing").with_default(false),
        }
    }

    pub fn command(&self, ctx: &TaskContext) -> Result<ToolCommand> {
        let mut command = ToolCommand::new("twine")
            .arg("upload")
            .arg("--non-interactive")
            .arg("--repository-url")
            .arg(self.repository_url.get()?);
        if let Some(credentials) = self.credentials.get()? {
            command = command
                .args(["--username", credentials.username.as_str()])
                .env("TWINE_PASSWORD", credentials.password.as_str())
                .secret(credentials.password.as_str());
        }
        if self.skip_existing.get()? {
            command = command.arg("--skip-existing");
        }
        Ok(command.args(
            self.distributions
                .get()?
                .iter()
                .map(|file| ctx.resolve(file).to_string_lossy().into_owned()),
        ))
    }
}

#[async_trait]
impl Task for PythonPublishTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        vec![
            &self.repository_url,
            &self.credentials,
            &self.distributions,
            &self.skip_existing,
        ]
    }

    fn description(&self) -> Option<String> {
        Some(format!(
            "Upload Python distributions to {}.",
            self.repository_url.get().ok()?
        ))
    }

    async fn prepare(&self, _ctx: &TaskContext) -> Result<Option<TaskStatus>> {
        if self.distributions.get()?.is_empty() {
            return Ok(Some(TaskStatus::Skipped("no distributions to upload".to_string())));
        }
        Ok(None)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        ctx.run(&self.command(ctx)?).await
    }
}
