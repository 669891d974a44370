use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use regex::Regex;
use tracing::debug;

use super::{Relationship, Task, TaskContext};
use crate::{
    error::{KrakenError, Result},
    output::OutputMode,
};

pub struct TaskEntry {
    pub name: String,
    pub group: Option<String>,
    pub default: bool,
    pub task: Arc<dyn Task>,
    relationships: Vec<Relationship>,
    finalized: AtomicBool,
}

impl TaskEntry {
    /// Relationships declared by the task itself followed by those added through the project.
    pub fn relationships(&self) -> Vec<Relationship> {
        let mut all = self.task.relationships();
        all.extend(self.relationships.iter().cloned());
        all
    }
}

/// The set of tasks of one build plus per-project settings that task factories share.
///
/// Settings are stored by type: `project.metadata_mut::<CargoSettings>()` returns the one
/// `CargoSettings` value of this project, creating it on first access.
pub struct Project {
    name: String,
    directory: PathBuf,
    build_directory: PathBuf,
    entries: Vec<TaskEntry>,
    default_tasks: Vec<String>,
    metadata: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

fn task_name_regex() -> &'static Regex {
    static TASK_NAME: OnceLock<Regex> = OnceLock::new();
    TASK_NAME.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_./-]*$").unwrap())
}

impl Project {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        let build_directory = directory.join("build");
        Self {
            name: name.into(),
            directory,
            build_directory,
            entries: Vec::new(),
            default_tasks: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_build_directory(mut self, dir: impl AsRef<Path>) -> Self {
        self.build_directory = self.directory.join(dir);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn build_directory(&self) -> &Path {
        &self.build_directory
    }

    /// Add a task. `build` receives the task name so the task can own its properties.
    pub fn register<T, F>(
        &mut self,
        name: &str,
        group: Option<&str>,
        default: bool,
        build: F,
    ) -> Result<Arc<T>>
    where
        T: Task,
        F: FnOnce(&str) -> T,
    {
        if !task_name_regex().is_match(name) {
            return Err(KrakenError::Config(format!("invalid task name '{}'", name)));
        }
        if self.entry(name).is_some() {
            return Err(KrakenError::Config(format!(
                "task '{}' already exists in project '{}'",
                name, self.name
            )));
        }
        let task = Arc::new(build(name));
        debug!("Registered task '{}' (group: {:?})", name, group);
        self.entries.push(TaskEntry {
            name: name.to_string(),
            group: group.map(str::to_string),
            default,
            task: task.clone(),
            relationships: Vec::new(),
            finalized: AtomicBool::new(false),
        });
        Ok(task)
    }

    pub fn entries(&self) -> &[TaskEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&TaskEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    pub fn task(&self, name: &str) -> Option<&Arc<dyn Task>> {
        self.entry(name).map(|e| &e.task)
    }

    /// Make `task` depend on whatever `selector` resolves to.
    pub fn add_relationship(&mut self, task: &str, selector: &str, strict: bool) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.name == task)
            .ok_or_else(|| KrakenError::task(task, "not found"))?;
        entry.relationships.push(Relationship {
            selector: selector.to_string(),
            dependency: true,
            strict,
        });
        Ok(())
    }

    pub fn set_default_tasks(&mut self, names: Vec<String>) {
        self.default_tasks = names;
    }

    /// Explicitly configured default selectors, or every task registered as default.
    pub fn default_tasks(&self) -> Vec<String> {
        if !self.default_tasks.is_empty() {
            return self.default_tasks.clone();
        }
        self.entries
            .iter()
            .filter(|e| e.default)
            .map(|e| e.name.clone())
            .collect()
    }

    /// Resolve a selector to task names in declaration order. Accepts `name`, `:name` and group
    /// names; a trailing `?` yields an empty list instead of an error when nothing matches.
    pub fn resolve(&self, selector: &str) -> Result<Vec<String>> {
        let (selector, optional) = match selector.strip_suffix('?') {
            Some(stripped) => (stripped, true),
            None => (selector, false),
        };
        let name = selector.strip_prefix(':').unwrap_or(selector);

        if self.contains(name) {
            return Ok(vec![name.to_string()]);
        }

        let members: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.group.as_deref() == Some(name))
            .map(|e| e.name.clone())
            .collect();

        if members.is_empty() && !optional {
            return Err(KrakenError::Dependency(format!(
                "no task or group matches '{}'",
                selector
            )));
        }
        Ok(members)
    }

    pub fn metadata<M: Any + Send + Sync>(&self) -> Option<&M> {
        self.metadata
            .get(&TypeId::of::<M>())
            .and_then(|m| m.downcast_ref::<M>())
    }

    pub fn metadata_mut<M: Any + Send + Sync + Default>(&mut self) -> &mut M {
        let slot = self
            .metadata
            .entry(TypeId::of::<M>())
            .or_insert_with(|| Box::new(M::default()));
        match slot.downcast_mut::<M>() {
            Some(m) => m,
            None => unreachable!("metadata slot for {} holds another type", type_name::<M>()),
        }
    }

    pub fn context(&self, task_name: &str, output: OutputMode, timeout: Option<Duration>) -> TaskContext {
        TaskContext {
            task_name: task_name.to_string(),
            project_name: self.name.clone(),
            project_dir: self.directory.clone(),
            build_dir: self.build_directory.clone(),
            output,
            timeout,
        }
    }

    /// Run every task's finalize hook. Tasks already finalized are not finalized again.
    pub fn finalize(&self) -> Result<()> {
        for entry in &self.entries {
            if entry.finalized.swap(true, Ordering::SeqCst) {
                continue;
            }
            let ctx = self.context(&entry.name, OutputMode::default(), None);
            entry.task.finalize(&ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        property::AnyProperty,
        task::{TaskContext, TaskStatus},
    };

    struct Noop;

    #[async_trait]
    impl Task for Noop {
        fn properties(&self) -> Vec<&dyn AnyProperty> {
            Vec::new()
        }

        async fn execute(&self, _ctx: &TaskContext) -> Result<TaskStatus> {
            Ok(TaskStatus::Succeeded(None))
        }
    }

    fn project() -> Project {
        let mut project = Project::new("demo", "/tmp/demo");
        project.register("cargoBuildDebug", Some("build"), false, |_| Noop).unwrap();
        project.register("cargoBuildRelease", Some("build"), false, |_| Noop).unwrap();
        project.register("cargoFmtCheck", Some("lint"), true, |_| Noop).unwrap();
        project
    }

    #[test]
    fn selectors_resolve_names_and_groups() {
        let project = project();
        assert_eq!(project.resolve("cargoFmtCheck").unwrap(), vec!["cargoFmtCheck"]);
        assert_eq!(project.resolve(":cargoFmtCheck").unwrap(), vec!["cargoFmtCheck"]);
        assert_eq!(
            project.resolve("build").unwrap(),
            vec!["cargoBuildDebug", "cargoBuildRelease"]
        );
        assert!(project.resolve(":cargoBuildSupport?").unwrap().is_empty());
        assert!(matches!(
            project.resolve(":cargoBuildSupport"),
            Err(KrakenError::Dependency(_))
        ));
    }

    #[test]
    fn duplicate_and_invalid_names_are_rejected() {
        let mut project = project();
        assert!(project.register("cargoFmtCheck", None, false, |_| Noop).is_err());
        assert!(project.register("bad name", None, false, |_| Noop).is_err());
        assert!(project.register("cargoPublish/bump", None, false, |_| Noop).is_ok());
    }

    #[test]
    fn defaults_come_from_registration_unless_configured() {
        let mut project = project();
        assert_eq!(project.default_tasks(), vec!["cargoFmtCheck"]);
        project.set_default_tasks(vec!["build".into()]);
        assert_eq!(project.default_tasks(), vec!["build"]);
    }

    #[derive(Default)]
    struct Settings {
        registries: Vec<String>,
    }

    #[test]
    fn metadata_is_keyed_by_type() {
        let mut project = project();
        assert!(project.metadata::<Settings>().is_none());
        project.metadata_mut::<Settings>().registries.push("priv".into());
        project.metadata_mut::<Settings>().registries.push("pub".into());
        assert_eq!(project.metadata::<Settings>().unwrap().registries.len(), 2);
    }
}
