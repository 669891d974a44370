//! Tasks for Python projects managed with Poetry or Slap.

mod buildsystem;
mod tasks;

pub use buildsystem::{PythonBuildSystem, activate, poetry_toml_with_credentials};
pub use tasks::{
    BlackTask, Flake8Task, IsortTask, MypyTask, PytestTask, PythonBuildTask, PythonInstallTask,
    PythonPublishTask, PythonTool,
};

use std::{
    path::{Path, PathBuf},
    sync::{Arc, OnceLock, PoisonError, RwLock},
};

use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    error::{KrakenError, Result},
    property::Supplier,
    task::Project,
    util::Credentials,
};

pub const PYTHON_INSTALL_TASK: &str = "pythonInstall";

fn alias_regex() -> &'static Regex {
    static ALIAS: OnceLock<Regex> = OnceLock::new();
    ALIAS.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap())
}

/// A Python package index.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PythonIndex {
    pub alias: String,
    pub index_url: String,
    /// Where distributions are uploaded to. Defaults to `index_url`.
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Whether packages are installed from this index.
    #[serde(default = "default_true")]
    pub is_package_source: bool,
    #[serde(default)]
    pub default: bool,
}

fn default_true() -> bool {
    true
}

impl PythonIndex {
    pub fn new(alias: &str, index_url: &str) -> Result<Self> {
        let index = Self {
            alias: alias.to_string(),
            index_url: index_url.to_string(),
            upload_url: None,
            credentials: None,
            is_package_source: true,
            default: false,
        };
        index.validate()?;
        Ok(index)
    }

    pub fn validate(&self) -> Result<()> {
        if !alias_regex().is_match(&self.alias) {
            return Err(KrakenError::Config(format!(
                "invalid python index alias '{}'",
                self.alias
            )));
        }
        Ok(())
    }

    pub fn upload_url(&self) -> &str {
        self.upload_url.as_deref().unwrap_or(&self.index_url)
    }
}

/// A snapshot of the project's Python settings, as read by the tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct PythonConfig {
    pub build_system: Option<PythonBuildSystem>,
    pub source_directory: PathBuf,
    /// When unset, the first existing of `test`, `tests`, `src/test` and `src/tests` is used.
    pub tests_directory: Option<PathBuf>,
    pub indexes: Vec<PythonIndex>,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            build_system: None,
            source_directory: PathBuf::from("src"),
            tests_directory: None,
            indexes: Vec::new(),
        }
    }
}

impl PythonConfig {
    /// Relative to `project_dir`.
    pub fn tests_directory(&self, project_dir: &Path) -> Option<PathBuf> {
        if let Some(dir) = &self.tests_directory {
            return Some(dir.clone());
        }
        ["test", "tests", "src/test", "src/tests"]
            .into_iter()
            .map(PathBuf::from)
            .find(|dir| project_dir.join(dir).is_dir())
    }

    pub fn tests_directory_args(&self, project_dir: &Path) -> Vec<String> {
        self.tests_directory(project_dir)
            .map(|dir| dir.to_string_lossy().into_owned())
            .into_iter()
            .collect()
    }

    pub fn index(&self, alias: &str) -> Option<&PythonIndex> {
        self.indexes.iter().find(|index| index.alias == alias)
    }
}

/// Python settings shared by the tasks of one project. Tasks read them lazily, so settings
/// changed after a task was created are still visible to it.
#[derive(Debug, Default)]
pub struct PythonSettings {
    config: Arc<RwLock<PythonConfig>>,
    detected: bool,
}

impl PythonSettings {
    pub fn config(&self) -> PythonConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update(&self, func: impl FnOnce(&mut PythonConfig)) {
        func(&mut self.config.write().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn set_build_system(&self, build_system: Option<PythonBuildSystem>) {
        self.update(|config| {
            if let (Some(old), Some(new)) = (config.build_system, build_system) {
                if old != new {
                    warn!("Overwriting Python build system {} with {}", old, new);
                }
            }
            config.build_system = build_system;
        });
    }

    pub fn set_source_directory(&self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        self.update(|config| config.source_directory = dir);
    }

    pub fn set_tests_directory(&self, dir: Option<PathBuf>) {
        self.update(|config| config.tests_directory = dir);
    }

    /// Add an index, replacing one with the same alias.
    pub fn add_index(&self, index: PythonIndex) {
        self.update(|config| match config.indexes.iter_mut().find(|i| i.alias == index.alias) {
            Some(existing) => *existing = index,
            None => config.indexes.push(index),
        });
    }

    pub fn index(&self, alias: &str) -> Option<PythonIndex> {
        self.config().index(alias).cloned()
    }

    fn supplier(&self) -> Supplier<PythonConfig> {
        let config = Arc::clone(&self.config);
        Supplier::of_callable(
            move || Ok(config.read().unwrap_or_else(PoisonError::into_inner).clone()),
            vec![],
        )
    }
}

/// The project's Python settings. On first access without an explicit build system, the build
/// system is detected from `pyproject.toml`.
pub fn python_settings(
    project: &mut Project,
    build_system: Option<PythonBuildSystem>,
) -> Result<&mut PythonSettings> {
    let directory = project.directory().to_path_buf();
    let name = project.name().to_string();
    let settings = project.metadata_mut::<PythonSettings>();
    if build_system.is_some() {
        settings.set_build_system(build_system);
        settings.detected = true;
    } else if !settings.detected {
        settings.detected = true;
        if let Some(detected) = PythonBuildSystem::detect(&directory)? {
            info!("Detected Python build system for project '{}': {}", name, detected);
            settings.set_build_system(Some(detected));
        }
    }
    Ok(settings)
}

pub fn python_index(project: &mut Project, index: PythonIndex) -> Result<()> {
    index.validate()?;
    python_settings(project, None)?.add_index(index);
    Ok(())
}

fn settings_supplier(project: &mut Project) -> Result<Supplier<PythonConfig>> {
    Ok(python_settings(project, None)?.supplier())
}

/// Registers `pythonInstall`. Tool tasks run after it when it is part of the build.
pub fn python_install(project: &mut Project) -> Result<Arc<PythonInstallTask>> {
    let settings = settings_supplier(project)?;
    let task = project.register(PYTHON_INSTALL_TASK, None, false, PythonInstallTask::new)?;
    task.settings.set(settings)?;
    Ok(task)
}

/// Options shared by the formatter and linter factories.
#[derive(Debug, Clone, Default)]
pub struct PythonToolOptions {
    pub config_file: Option<PathBuf>,
    pub additional_args: Vec<String>,
    pub additional_files: Vec<PathBuf>,
}

fn configure_tool(tool: &PythonTool, settings: Supplier<PythonConfig>, options: &PythonToolOptions) -> Result<()> {
    tool.settings.set(settings)?;
    tool.config_file.set(options.config_file.clone())?;
    tool.additional_args.set(options.additional_args.clone())?;
    tool.additional_files.set(options.additional_files.clone())?;
    Ok(())
}

/// Registers `blackCheck` (group `lint`) and `blackFormat` (group `fmt`).
pub fn black(
    project: &mut Project,
    options: PythonToolOptions,
) -> Result<(Arc<BlackTask>, Arc<BlackTask>)> {
    let settings = settings_supplier(project)?;
    let check = project.register("blackCheck", Some("lint"), true, BlackTask::new)?;
    configure_tool(&check.tool, settings.clone(), &options)?;
    check.check_only.set(true)?;
    let format = project.register("blackFormat", Some("fmt"), false, BlackTask::new)?;
    configure_tool(&format.tool, settings, &options)?;
    Ok((check, format))
}

/// Registers `isortCheck` (group `lint`) and `isortFormat` (group `fmt`).
pub fn isort(
    project: &mut Project,
    options: PythonToolOptions,
) -> Result<(Arc<IsortTask>, Arc<IsortTask>)> {
    let settings = settings_supplier(project)?;
    let check = project.register("isortCheck", Some("lint"), true, IsortTask::new)?;
    configure_tool(&check.tool, settings.clone(), &options)?;
    check.check_only.set(true)?;
    let format = project.register("isortFormat", Some("fmt"), false, IsortTask::new)?;
    configure_tool(&format.tool, settings, &options)?;
    Ok((check, format))
}

pub fn flake8(project: &mut Project, options: PythonToolOptions) -> Result<Arc<Flake8Task>> {
    let settings = settings_supplier(project)?;
    let task = project.register("flake8", Some("lint"), true, Flake8Task::new)?;
    configure_tool(&task.tool, settings, &options)?;
    Ok(task)
}

pub fn mypy(project: &mut Project, options: PythonToolOptions) -> Result<Arc<MypyTask>> {
    let settings = settings_supplier(project)?;
    let task = project.register("mypy", Some("lint"), true, MypyTask::new)?;
    configure_tool(&task.tool, settings, &options)?;
    Ok(task)
}

#[derive(Debug, Clone)]
pub struct PytestOptions {
    pub name: String,
    pub tests_dir: Option<PathBuf>,
    pub ignore_dirs: Vec<PathBuf>,
    /// Treat pytest's "no tests collected" exit code as success, and skip the task when there is
    /// no tests directory at all.
    pub allow_no_tests: bool,
    pub additional_args: Vec<String>,
}

impl Default for PytestOptions {
    fn default() -> Self {
        Self {
            name: "pytest".to_string(),
            tests_dir: None,
            ignore_dirs: Vec::new(),
            allow_no_tests: false,
            additional_args: Vec::new(),
        }
    }
}

pub fn pytest(project: &mut Project, options: PytestOptions) -> Result<Arc<PytestTask>> {
    let settings = settings_supplier(project)?;
    let task = project.register(&options.name, Some("test"), false, PytestTask::new)?;
    task.tool.settings.set(settings)?;
    task.tool.additional_args.set(options.additional_args)?;
    task.tests_dir.set(options.tests_dir)?;
    task.ignore_dirs.set(options.ignore_dirs)?;
    task.allow_no_tests.set(options.allow_no_tests)?;
    Ok(task)
}

/// Build distributions into the task's build directory, optionally rewriting the project version
/// to `as_version` first.
pub fn python_build(project: &mut Project, as_version: Option<String>) -> Result<Arc<PythonBuildTask>> {
    let settings = settings_supplier(project)?;
    let task = project.register("pythonBuild", Some("build"), false, PythonBuildTask::new)?;
    task.settings.set(settings)?;
    task.as_version.set(as_version)?;
    Ok(task)
}

/// Upload `distributions` to the index `index` with twine. Pass `build.output_files.supplier()`
/// to publish what a [`PythonBuildTask`] produced.
pub fn python_publish(
    project: &mut Project,
    name: &str,
    index: &str,
    distributions: impl Into<Supplier<Vec<PathBuf>>>,
) -> Result<Arc<PythonPublishTask>> {
    let distributions = distributions.into();
    let index = python_settings(project, None)?
        .index(index)
        .ok_or_else(|| KrakenError::Config(format!("package index '{}' is not defined", index)))?;
    let task = project.register(name, Some("publish"), false, PythonPublishTask::new)?;
    task.repository_url.set(index.upload_url().to_string())?;
    task.credentials.set(index.credentials)?;
    task.distributions.set(distributions)?;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::task::TaskGraph;

    fn poetry_project(dir: &Path) -> Project {
        fs::write(
            dir.join("pyproject.toml"),
            "[build-system]\nrequires = [\"poetry-core\"]\n",
        )
        .unwrap();
        Project::new("demo", dir)
    }

    #[test]
    fn build_system_is_detected_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut project = poetry_project(dir.path());
        let settings = python_settings(&mut project, None).unwrap();
        assert_eq!(settings.config().build_system, Some(PythonBuildSystem::Poetry));

        python_settings(&mut project, Some(PythonBuildSystem::Slap)).unwrap();
        let settings = python_settings(&mut project, None).unwrap();
        assert_eq!(settings.config().build_system, Some(PythonBuildSystem::Slap));
    }

    #[test]
    fn tests_directory_is_detected() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = PythonConfig::default();
        assert_eq!(config.tests_directory(dir.path()), None);
        fs::create_dir_all(dir.path().join("src/tests")).unwrap();
        assert_eq!(config.tests_directory(dir.path()), Some(PathBuf::from("src/tests")));
        fs::create_dir_all(dir.path().join("tests")).unwrap();
        assert_eq!(config.tests_directory_args(dir.path()), vec!["tests"]);
    }

    #[test]
    fn index_aliases_are_validated() {
        assert!(PythonIndex::new("private-pypi", "https://pypi.example.test/simple").is_ok());
        assert!(matches!(
            PythonIndex::new("private pypi", "https://pypi.example.test/simple"),
            Err(KrakenError::Config(_))
        ));
    }

    #[test]
    fn publish_needs_a_known_index() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut project = poetry_project(dir.path());
        let err = python_publish(&mut project, "publishPython", "pypi", Vec::<PathBuf>::new()).unwrap_err();
        assert!(err.to_string().contains("package index 'pypi' is not defined"));

        let mut index = PythonIndex::new("pypi", "https://pypi.org/simple").unwrap();
        index.upload_url = Some("https://upload.pypi.org/legacy/".into());
        python_index(&mut project, index).unwrap();
        let task = python_publish(&mut project, "publishPython", "pypi", Vec::<PathBuf>::new()).unwrap();
        assert_eq!(task.repository_url.get().unwrap(), "https://upload.pypi.org/legacy/");
    }

    #[test]
    fn publish_depends_on_build_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut project = poetry_project(dir.path());
        python_index(&mut project, PythonIndex::new("pypi", "https://pypi.org/simple").unwrap()).unwrap();
        let build = python_build(&mut project, None).unwrap();
        python_publish(&mut project, "publishPython", "pypi", build.output_files.supplier()).unwrap();

        let graph = TaskGraph::build(&project).unwrap();
        let selected = graph.select(&["publishPython".to_string()]).unwrap();
        assert_eq!(graph.execution_order(&selected), vec!["pythonBuild", "publishPython"]);
    }

    #[test]
    fn tools_run_after_install_without_pulling_it_in() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut project = poetry_project(dir.path());
        python_install(&mut project).unwrap();
        black(&mut project, PythonToolOptions::default()).unwrap();

        let graph = TaskGraph::build(&project).unwrap();
        let selected = graph.select(&["blackCheck".to_string()]).unwrap();
        assert_eq!(selected, vec!["blackCheck"]);
        let selected = graph
            .select(&["blackCheck".to_string(), PYTHON_INSTALL_TASK.to_string()])
            .unwrap();
        assert_eq!(graph.execution_order(&selected), vec!["pythonInstall", "blackCheck"]);
    }
}
