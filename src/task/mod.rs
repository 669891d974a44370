pub mod analysis;
pub mod config;
pub mod dependency;
pub mod project;

pub use analysis::{list_tasks, show_task_relationships};
pub use config::load_project;
pub use dependency::{Edge, TaskGraph};
pub use project::Project;

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use tracing::info;

use crate::{
    error::Result,
    output::OutputMode,
    property::AnyProperty,
    util::ToolCommand,
};

/// Outcome of one task lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded(Option<String>),
    Failed {
        message: String,
        exit_code: Option<i32>,
    },
    UpToDate(Option<String>),
    Skipped(String),
    /// A background task that keeps running until the runner tears it down.
    Started(Option<String>),
}

impl TaskStatus {
    pub fn succeeded(message: impl Into<String>) -> Self {
        TaskStatus::Succeeded(Some(message.into()))
    }

    pub fn failed(message: impl Into<String>) -> Self {
        TaskStatus::Failed {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskStatus::Failed { .. })
    }

    pub fn is_started(&self) -> bool {
        matches!(self, TaskStatus::Started(_))
    }

    fn label(&self) -> &'static str {
        match self {
            TaskStatus::Succeeded(_) => "SUCCEEDED",
            TaskStatus::Failed { .. } => "FAILED",
            TaskStatus::UpToDate(_) => "UP TO DATE",
            TaskStatus::Skipped(_) => "SKIPPED",
            TaskStatus::Started(_) => "STARTED",
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            TaskStatus::Succeeded(msg) | TaskStatus::UpToDate(msg) | TaskStatus::Started(msg) => {
                msg.as_deref()
            }
            TaskStatus::Failed { message, .. } => Some(message),
            TaskStatus::Skipped(msg) => Some(msg),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{} ({})", self.label(), msg),
            None => f.write_str(self.label()),
        }
    }
}

/// Per-tool mapping of exit codes to task status. Zero always succeeds; codes registered with
/// [`ExitCodeMap::accept`] succeed with the registered message; everything else fails.
#[derive(Debug, Clone, Default)]
pub struct ExitCodeMap {
    accepted: BTreeMap<i32, String>,
}

impl ExitCodeMap {
    pub fn accept(mut self, code: i32, message: impl Into<String>) -> Self {
        self.accepted.insert(code, message.into());
        self
    }

    pub fn status(&self, command: &str, code: Option<i32>) -> TaskStatus {
        match code {
            Some(0) => TaskStatus::Succeeded(None),
            Some(code) => match self.accepted.get(&code) {
                Some(message) => TaskStatus::Succeeded(Some(message.clone())),
                None => TaskStatus::Failed {
                    message: format!("command exited with code {}: {}", code, command),
                    exit_code: Some(code),
                },
            },
            None => TaskStatus::Failed {
                message: format!("command terminated by signal: {}", command),
                exit_code: None,
            },
        }
    }
}

/// An edge declared by a task. `selector` names a task (`name` or `:name`) or a group, and a
/// trailing `?` makes it a no-op when nothing matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub selector: String,
    /// The selected tasks run before this one. When false, this task runs before them.
    pub dependency: bool,
    /// Strict relationships pull the other task into the build; non-strict ones only order.
    pub strict: bool,
}

impl Relationship {
    pub fn depends_on(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            dependency: true,
            strict: true,
        }
    }

    pub fn after(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            dependency: true,
            strict: false,
        }
    }

    pub fn before(selector: impl Into<String>, strict: bool) -> Self {
        Self {
            selector: selector.into(),
            dependency: false,
            strict,
        }
    }
}

/// What a task sees of the build it runs in.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_name: String,
    pub project_name: String,
    pub project_dir: PathBuf,
    pub build_dir: PathBuf,
    pub output: OutputMode,
    pub timeout: Option<Duration>,
}

impl TaskContext {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    /// Scratch directory reserved for this task inside the build directory.
    pub fn task_build_dir(&self) -> PathBuf {
        self.build_dir.join(self.task_name.replace('/', "-"))
    }

    pub async fn run(&self, command: &ToolCommand) -> Result<TaskStatus> {
        self.run_with(command, &ExitCodeMap::default()).await
    }

    /// Run `command` in the project directory (unless it sets its own) and map its exit code.
    pub async fn run_with(&self, command: &ToolCommand, codes: &ExitCodeMap) -> Result<TaskStatus> {
        let command = match command.get_cwd() {
            Some(_) => command.clone(),
            None => command.clone().cwd(&self.project_dir),
        };
        let command_line = command.display();
        info!(task = %self.task_name, "$ {}", command_line);
        let output = command.run(self.output, self.timeout).await?;
        Ok(codes.status(&command_line, output.status.code()))
    }
}

/// A unit of build work.
///
/// The runner calls [`Task::finalize`] once per build before the task graph is assembled, freezes
/// config properties, then calls [`Task::prepare`] and, unless that short-circuits, [`Task::execute`].
/// A task returning [`TaskStatus::Started`] is torn down with [`Task::teardown`] once nothing needs
/// it any more.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    fn properties(&self) -> Vec<&dyn AnyProperty>;

    fn description(&self) -> Option<String> {
        None
    }

    fn relationships(&self) -> Vec<Relationship> {
        Vec::new()
    }

    fn finalize(&self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }

    async fn prepare(&self, _ctx: &TaskContext) -> Result<Option<TaskStatus>> {
        Ok(None)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus>;

    async fn teardown(&self, _ctx: &TaskContext) -> Result<TaskStatus> {
        Ok(TaskStatus::Succeeded(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_map_to_status() {
        let codes = ExitCodeMap::default().accept(5, "no tests collected");
        assert_eq!(codes.status("pytest", Some(0)), TaskStatus::Succeeded(None));
        assert_eq!(
            codes.status("pytest", Some(5)),
            TaskStatus::succeeded("no tests collected")
        );
        match codes.status("pytest -vv", Some(2)) {
            TaskStatus::Failed { message, exit_code } => {
                assert_eq!(exit_code, Some(2));
                assert!(message.contains("pytest -vv"));
            }
            other => panic!("unexpected: {other}"),
        }
        assert!(ExitCodeMap::default().status("pytest", Some(5)).is_failed());
        assert!(codes.status("pytest", None).is_failed());
    }

    #[test]
    fn status_display() {
        assert_eq!(TaskStatus::UpToDate(None).to_string(), "UP TO DATE");
        assert_eq!(
            TaskStatus::Skipped("upstream task 'a' failed".into()).to_string(),
            "SKIPPED (upstream task 'a' failed)"
        );
    }
}
