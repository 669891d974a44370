//! Loading a project from `kraken.toml`.
//!
//! String values may reference variables as `${NAME}` or `$NAME`. Besides the `[variables]` table
//! there are `ENV_<VAR>` for every environment variable, `PWD`, and, when referenced, the
//! `GIT_VERSION`, `GIT_VERSION_PYTHON` and `GIT_VERSION_CARGO` of the project repository.

use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::Project;
use crate::{
    cargo::{
        CargoBuildMode, CargoBuildOptions, CargoClippyAllow, CargoPublishOptions, CargoSettings, cargo_auth_proxy,
        cargo_build, cargo_clippy, cargo_fmt, cargo_publish, cargo_registry, cargo_sync_config,
        cargo_test,
    },
    dist::{ArchiveType, DistInput, DistOptions, dist},
    docker::{
        BackendKind, DockerBuildConfig, DockerBuildOptions, KanikoBackend, ManifestToolOptions, NativeBackend,
        build_docker_image, manifest_tool,
    },
    error::{KrakenError, Result},
    git::{GitVersion, ci_tag, git_describe},
    helm::{HelmPackageOptions, helm_package, helm_push},
    python::{
        PytestOptions, PythonBuildSystem, PythonIndex, PythonToolOptions, black, flake8, isort, mypy,
        pytest, python_build, python_index, python_install, python_publish, python_settings,
    },
    util::Credentials,
};

/// `true` enables a feature with default options, a table enables it with those options.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Toggle<T> {
    Flag(bool),
    Options(T),
}

impl<T: Default> Toggle<T> {
    fn options(self) -> Option<T> {
        match self {
            Toggle::Flag(true) => Some(T::default()),
            Toggle::Flag(false) => None,
            Toggle::Options(options) => Some(options),
        }
    }
}

fn enabled<T: Default>(toggle: Option<Toggle<T>>) -> Option<T> {
    toggle.and_then(Toggle::options)
}

#[derive(Debug, Deserialize)]
struct ProjectFile {
    #[serde(default)]
    project: ProjectSection,
    cargo: Option<CargoSection>,
    #[serde(default)]
    docker: Vec<DockerSection>,
    #[serde(default)]
    docker_manifest: Vec<DockerManifestSection>,
    #[serde(default)]
    helm: Vec<HelmSection>,
    python: Option<PythonSection>,
    #[serde(default)]
    dist: Vec<DistSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ProjectSection {
    name: Option<String>,
    build_directory: Option<String>,
    default_timeout: Option<String>,
    default: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct CargoRegistrySection {
    alias: String,
    index: String,
    read_credentials: Option<Credentials>,
    publish_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SyncConfigSection {
    #[serde(default = "default_true")]
    replace: bool,
}

impl Default for SyncConfigSection {
    fn default() -> Self {
        Self { replace: true }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ClippySection {
    #[serde(default)]
    fix: bool,
    allow: Option<CargoClippyAllow>,
}

#[derive(Debug, Default, Deserialize)]
struct CargoBuildSection {
    name: Option<String>,
    group: Option<String>,
    incremental: Option<bool>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

impl CargoBuildSection {
    fn options(self) -> CargoBuildOptions {
        CargoBuildOptions {
            incremental: self.incremental,
            env: self.env,
            name: self.name,
            group: self.group,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CargoBuildModeSection {
    mode: CargoBuildMode,
    #[serde(flatten)]
    build: CargoBuildSection,
}

#[derive(Debug, Deserialize)]
struct CargoPublishSection {
    registry: String,
    name: Option<String>,
    version: Option<String>,
    allow_dirty: Option<bool>,
    verify: Option<bool>,
    #[serde(default)]
    additional_args: Vec<String>,
    incremental: Option<bool>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CargoSection {
    #[serde(default)]
    registries: Vec<CargoRegistrySection>,
    /// Environment for every cargo invocation.
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    auth_proxy: bool,
    sync_config: Option<Toggle<SyncConfigSection>>,
    #[serde(default)]
    fmt: bool,
    clippy: Option<Toggle<ClippySection>>,
    #[serde(default)]
    build: Vec<CargoBuildModeSection>,
    test: Option<Toggle<CargoBuildSection>>,
    #[serde(default)]
    publish: Vec<CargoPublishSection>,
}

#[derive(Debug, Deserialize)]
struct DockerSection {
    name: Option<String>,
    backend: Option<String>,
    kaniko: Option<KanikoBackend>,
    native: Option<NativeBackend>,
    preprocess_dockerfile: Option<bool>,
    #[serde(default)]
    default: bool,
    group: Option<String>,
    #[serde(flatten)]
    config: DockerBuildConfig,
}

impl DockerSection {
    fn backend(&self) -> Result<BackendKind> {
        let name = self.backend.as_deref().unwrap_or(BackendKind::DEFAULT);
        Ok(match BackendKind::from_name(name)? {
            BackendKind::Kaniko(default) => BackendKind::Kaniko(self.kaniko.clone().unwrap_or(default)),
            BackendKind::Native(default) => BackendKind::Native(self.native.clone().unwrap_or(default)),
            other => other,
        })
    }
}

#[derive(Debug, Deserialize)]
struct DockerManifestSection {
    name: Option<String>,
    platforms: Vec<String>,
    template: String,
    target: String,
    #[serde(default)]
    auth: BTreeMap<String, Credentials>,
    prefer_local: Option<bool>,
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DistIncludeSection {
    path: PathBuf,
    arcname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DistSection {
    name: Option<String>,
    output_file: PathBuf,
    archive_type: Option<ArchiveType>,
    prefix: Option<String>,
    group: Option<String>,
    /// Tasks producing the included files.
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    include: Vec<DistIncludeSection>,
}

#[derive(Debug, Deserialize)]
struct HelmPushSection {
    name: Option<String>,
    registry: String,
    credentials: Option<Credentials>,
    #[serde(default)]
    insecure: bool,
}

#[derive(Debug, Deserialize)]
struct HelmSection {
    name: Option<String>,
    chart_directory: PathBuf,
    version: Option<String>,
    app_version: Option<String>,
    output_file: Option<PathBuf>,
    push: Option<HelmPushSection>,
}

#[derive(Debug, Default, Deserialize)]
struct PythonToolSection {
    config_file: Option<PathBuf>,
    #[serde(default)]
    additional_args: Vec<String>,
    #[serde(default)]
    additional_files: Vec<PathBuf>,
}

impl From<PythonToolSection> for PythonToolOptions {
    fn from(section: PythonToolSection) -> Self {
        PythonToolOptions {
            config_file: section.config_file,
            additional_args: section.additional_args,
            additional_files: section.additional_files,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PytestSection {
    name: Option<String>,
    tests_dir: Option<PathBuf>,
    #[serde(default)]
    ignore_dirs: Vec<PathBuf>,
    #[serde(default)]
    allow_no_tests: bool,
    #[serde(default)]
    additional_args: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PythonBuildSection {
    as_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PythonPublishSection {
    index: String,
    name: Option<String>,
    #[serde(default)]
    skip_existing: bool,
}

#[derive(Debug, Deserialize)]
struct PythonSection {
    build_system: Option<PythonBuildSystem>,
    source_directory: Option<PathBuf>,
    tests_directory: Option<PathBuf>,
    #[serde(default)]
    indexes: Vec<PythonIndex>,
    #[serde(default)]
    install: bool,
    black: Option<Toggle<PythonToolSection>>,
    isort: Option<Toggle<PythonToolSection>>,
    flake8: Option<Toggle<PythonToolSection>>,
    mypy: Option<Toggle<PythonToolSection>>,
    pytest: Option<Toggle<PytestSection>>,
    build: Option<Toggle<PythonBuildSection>>,
    #[serde(default)]
    publish: Vec<PythonPublishSection>,
}

fn default_true() -> bool {
    true
}

/// A project built from a project file, plus the settings that belong to the runner.
pub struct LoadedProject {
    pub project: Project,
    pub default_timeout: Option<String>,
}

pub async fn load_project(config_path: &Path) -> Result<LoadedProject> {
    let contents = fs::read_to_string(config_path)?;
    let directory = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => env::current_dir()?,
    };
    load_project_from_str(&contents, &directory).await
}

/// Parse `contents` as a project file for a project rooted at `directory`.
pub async fn load_project_from_str(contents: &str, directory: &Path) -> Result<LoadedProject> {
    let mut document: toml::Value = toml::from_str(contents)?;

    let mut variables = HashMap::new();
    if let Some(table) = document.get("variables").and_then(toml::Value::as_table) {
        for (key, value) in table {
            let value = match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            variables.insert(key.clone(), value);
        }
    }
    add_builtin_variables(&mut variables);
    if contents.contains("GIT_VERSION") {
        add_git_variables(directory, &mut variables).await?;
    }
    substitute_variables_in_value(&mut document, &variables);

    let file: ProjectFile = document.try_into()?;
    let name = file.project.name.clone().unwrap_or_else(|| {
        directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string())
    });
    let mut project = Project::new(name, directory);
    if let Some(build_directory) = &file.project.build_directory {
        project = project.with_build_directory(build_directory);
    }

    let default_timeout = file.project.default_timeout.clone();
    let defaults = file.project.default.clone();
    apply(&mut project, file)?;
    if let Some(defaults) = defaults {
        project.set_default_tasks(defaults);
    }
    debug!("Loaded project '{}' with {} tasks", project.name(), project.entries().len());

    Ok(LoadedProject {
        project,
        default_timeout,
    })
}

fn apply(project: &mut Project, file: ProjectFile) -> Result<()> {
    if let Some(cargo) = file.cargo {
        apply_cargo(project, cargo)?;
    }
    for docker in file.docker {
        let backend = docker.backend()?;
        build_docker_image(
            project,
            DockerBuildOptions {
                name: docker.name,
                backend,
                config: docker.config,
                preprocess_dockerfile: docker.preprocess_dockerfile,
                default: docker.default,
                group: docker.group,
            },
        )?;
    }
    for helm in file.helm {
        let name = helm.name.unwrap_or_else(|| "helmPackage".to_string());
        let package = helm_package(
            project,
            &name,
            helm.chart_directory,
            HelmPackageOptions {
                version: helm.version,
                app_version: helm.app_version,
                output_file: helm.output_file,
            },
        )?;
        if let Some(push) = helm.push {
            let push_name = push.name.unwrap_or_else(|| format!("{}/push", name));
            let task = helm_push(
                project,
                &push_name,
                package.chart_tarball.supplier(),
                &push.registry,
                push.credentials,
            )?;
            task.insecure.set(push.insecure)?;
        }
    }
    for manifest in file.docker_manifest {
        let name = manifest.name.unwrap_or_else(|| "dockerManifest".to_string());
        manifest_tool(
            project,
            &name,
            manifest.platforms,
            &manifest.template,
            &manifest.target,
            ManifestToolOptions {
                auth: manifest.auth,
                prefer_local: manifest.prefer_local,
                version: manifest.version,
            },
        )?;
    }
    if let Some(python) = file.python {
        apply_python(project, python)?;
    }
    for section in file.dist {
        let name = section.name.unwrap_or_else(|| "dist".to_string());
        let inputs = section
            .include
            .into_iter()
            .map(|include| {
                let input = DistInput::file(include.path);
                match include.arcname {
                    Some(arcname) => input.arcname(arcname),
                    None => input,
                }
            })
            .collect();
        dist(
            project,
            &name,
            inputs,
            section.output_file,
            DistOptions {
                archive_type: section.archive_type,
                prefix: section.prefix,
                group: section.group,
            },
        )?;
        for selector in &section.depends_on {
            project.add_relationship(&name, selector, true)?;
        }
    }
    Ok(())
}

fn apply_cargo(project: &mut Project, cargo: CargoSection) -> Result<()> {
    for registry in cargo.registries {
        cargo_registry(
            project,
            &registry.alias,
            &registry.index,
            registry.read_credentials,
            registry.publish_token,
        )?;
    }
    for (key, value) in cargo.env {
        project.metadata_mut::<CargoSettings>().set_build_env(key, value);
    }
    if let Some(sync) = enabled(cargo.sync_config) {
        cargo_sync_config(project, sync.replace)?;
    }
    if cargo.auth_proxy {
        cargo_auth_proxy(project)?;
    }
    for build in cargo.build {
        cargo_build(project, build.mode, build.build.options())?;
    }
    if let Some(test) = enabled(cargo.test) {
        cargo_test(project, test.options())?;
    }
    if cargo.fmt {
        cargo_fmt(project)?;
    }
    if let Some(clippy) = enabled(cargo.clippy) {
        cargo_clippy(project, clippy.fix, clippy.allow)?;
    }
    for publish in cargo.publish {
        let defaults = CargoPublishOptions::default();
        cargo_publish(
            project,
            &publish.registry,
            CargoPublishOptions {
                version: publish.version,
                allow_dirty: publish.allow_dirty,
                verify: publish.verify.unwrap_or(defaults.verify),
                additional_args: publish.additional_args,
                incremental: publish.incremental,
                env: publish.env,
                name: publish.name.unwrap_or(defaults.name),
            },
        )?;
    }
    Ok(())
}

fn apply_python(project: &mut Project, python: PythonSection) -> Result<()> {
    let settings = python_settings(project, python.build_system)?;
    if let Some(dir) = python.source_directory {
        settings.set_source_directory(dir);
    }
    if python.tests_directory.is_some() {
        settings.set_tests_directory(python.tests_directory);
    }
    for index in python.indexes {
        python_index(project, index)?;
    }
    if python.install {
        python_install(project)?;
    }
    if let Some(options) = enabled(python.black) {
        black(project, options.into())?;
    }
    if let Some(options) = enabled(python.isort) {
        isort(project, options.into())?;
    }
    if let Some(options) = enabled(python.flake8) {
        flake8(project, options.into())?;
    }
    if let Some(options) = enabled(python.mypy) {
        mypy(project, options.into())?;
    }
    if let Some(section) = enabled(python.pytest) {
        let defaults = PytestOptions::default();
        pytest(
            project,
            PytestOptions {
                name: section.name.unwrap_or(defaults.name),
                tests_dir: section.tests_dir,
                ignore_dirs: section.ignore_dirs,
                allow_no_tests: section.allow_no_tests,
                additional_args: section.additional_args,
            },
        )?;
    }
    let build = match enabled(python.build) {
        Some(section) => Some(python_build(project, section.as_version)?),
        None => None,
    };
    for publish in python.publish {
        let build = build.as_ref().ok_or_else(|| {
            KrakenError::Config("[python] publish needs [python] build to produce distributions".to_string())
        })?;
        let name = publish
            .name
            .unwrap_or_else(|| format!("pythonPublish.{}", publish.index));
        let task = python_publish(project, &name, &publish.index, build.output_files.supplier())?;
        task.skip_existing.set(publish.skip_existing)?;
    }
    Ok(())
}

fn add_builtin_variables(variables: &mut HashMap<String, String>) {
    for (key, value) in env::vars() {
        variables.insert(format!("ENV_{}", key), value);
    }

    if let Ok(pwd) = env::current_dir() {
        variables.insert("PWD".to_string(), pwd.to_string_lossy().to_string());
    }
}

/// The CI tag if one is being built, otherwise `git describe --tags --dirty`.
async fn add_git_variables(directory: &Path, variables: &mut HashMap<String, String>) -> Result<()> {
    let described = match ci_tag() {
        Some(tag) => tag,
        None => git_describe(directory, true, true).await?,
    };
    let version = GitVersion::parse(described.trim_start_matches('v'))?;
    variables.insert("GIT_VERSION_PYTHON".to_string(), version.to_python(false));
    variables.insert("GIT_VERSION_CARGO".to_string(), version.to_cargo(false));
    variables.insert("GIT_VERSION".to_string(), described);
    Ok(())
}

fn substitute_variables_in_value(value: &mut toml::Value, variables: &HashMap<String, String>) {
    match value {
        toml::Value::String(text) => *text = substitute_variables(text, variables),
        toml::Value::Array(items) => items
            .iter_mut()
            .for_each(|item| substitute_variables_in_value(item, variables)),
        toml::Value::Table(table) => table
            .iter_mut()
            .for_each(|(_, item)| substitute_variables_in_value(item, variables)),
        _ => {}
    }
}

fn braced_regex() -> &'static Regex {
    static BRACED: OnceLock<Regex> = OnceLock::new();
    BRACED.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

fn simple_regex() -> &'static Regex {
    static SIMPLE: OnceLock<Regex> = OnceLock::new();
    SIMPLE.get_or_init(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").unwrap())
}

/// Unknown variables are left as written.
fn substitute_variables(text: &str, variables: &HashMap<String, String>) -> String {
    let lookup = |caps: &regex::Captures| {
        variables
            .get(&caps[1])
            .cloned()
            .unwrap_or_else(|| caps[0].to_string())
    };
    let result = braced_regex().replace_all(text, lookup).to_string();
    simple_regex().replace_all(&result, lookup).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskGraph};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_braced_and_simple_variables() {
        let variables = vars(&[("USER", "ci"), ("HOST", "registry.example.test")]);
        assert_eq!(
            substitute_variables("${USER}@$HOST/$MISSING", &variables),
            "ci@registry.example.test/$MISSING"
        );
    }

    #[tokio::test]
    async fn loads_cargo_project() {
        let dir = tempfile::TempDir::new().unwrap();
        let text = r#"
            [project]
            name = "demo"
            default = ["lint"]

            [variables]
            TOKEN = "Bearer abc"

            [cargo]
            auth_proxy = true
            sync_config = true
            fmt = true
            build = [{ mode = "debug" }, { mode = "release", incremental = false }]
            test = true

            [[cargo.registries]]
            alias = "private"
            index = "https://git.example.test/index.git"
            read_credentials = { username = "me", password = "pw" }
            publish_token = "${TOKEN}"

            [[cargo.publish]]
            registry = "private"
            version = "1.2.3"
        "#;
        let loaded = load_project_from_str(text, dir.path()).await.unwrap();
        let project = loaded.project;
        assert_eq!(project.name(), "demo");
        assert_eq!(project.default_tasks(), vec!["lint"]);
        for name in [
            "cargoSyncConfig",
            "cargoAuthProxy",
            "cargoBuildDebug",
            "cargoBuildRelease",
            "cargoTest",
            "cargoFmtCheck",
            "cargoPublish",
            "cargoPublish/bump",
        ] {
            assert!(project.contains(name), "missing {}", name);
        }
        let registry = project.metadata::<CargoSettings>().unwrap().registry("private").unwrap();
        assert_eq!(registry.publish_token.as_deref(), Some("Bearer abc"));

        let graph = TaskGraph::build(&project).unwrap();
        let selected = graph.select(&["cargoBuildDebug".to_string()]).unwrap();
        assert_eq!(
            graph.execution_order(&selected),
            vec!["cargoSyncConfig", "cargoAuthProxy", "cargoBuildDebug"]
        );
    }

    #[tokio::test]
    async fn docker_backend_options_apply() {
        let dir = tempfile::TempDir::new().unwrap();
        let text = r#"
            [[docker]]
            name = "image"
            backend = "kaniko"
            tags = ["app:1"]
            push = true
            kaniko = { image = "kaniko:custom" }
        "#;
        let loaded = load_project_from_str(text, dir.path()).await.unwrap();
        let task = loaded.project.task("image").unwrap();
        assert!(task.description().unwrap().contains("kaniko"));
    }

    #[tokio::test]
    async fn unknown_docker_backend_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let text = "[[docker]]\nbackend = \"podman\"\n";
        assert!(matches!(
            load_project_from_str(text, dir.path()).await,
            Err(KrakenError::Config(_))
        ));
    }

    #[tokio::test]
    async fn python_publish_requires_build() {
        let dir = tempfile::TempDir::new().unwrap();
        let text = r#"
            [python]
            build_system = "poetry"
            indexes = [{ alias = "pypi", index_url = "https://pypi.org/simple" }]
            publish = [{ index = "pypi" }]
        "#;
        assert!(load_project_from_str(text, dir.path()).await.is_err());

        let text = format!("{}\nbuild = true\n", text);
        let loaded = load_project_from_str(&text, dir.path()).await.unwrap();
        assert!(loaded.project.contains("pythonPublish.pypi"));
    }

    #[tokio::test]
    async fn helm_push_reads_package_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let text = r#"
            [[helm]]
            chart_directory = "deploy/chart"
            push = { registry = "oci://registry.example.test/charts" }
        "#;
        let loaded = load_project_from_str(text, dir.path()).await.unwrap();
        let graph = TaskGraph::build(&loaded.project).unwrap();
        let edge = graph.dependencies("helmPackage/push").next().unwrap();
        assert_eq!(edge.from, "helmPackage");
        assert!(edge.data);
    }

    #[tokio::test]
    async fn dist_archive_follows_its_producers() {
        let dir = tempfile::TempDir::new().unwrap();
        let text = r#"
            [[helm]]
            chart_directory = "deploy/chart"

            [[docker_manifest]]
            platforms = ["linux/amd64", "linux/arm64"]
            template = "registry.example.test/app:1.0-ARCH"
            target = "registry.example.test/app:1.0"

            [[dist]]
            output_file = "app-1.0.zip"
            prefix = "app-1.0"
            depends_on = ["helmPackage"]
            include = [
                { path = "README.md" },
                { path = "build/helmPackage", arcname = "charts" },
            ]
        "#;
        let loaded = load_project_from_str(text, dir.path()).await.unwrap();
        let project = &loaded.project;
        assert!(project.contains("dockerManifest"));

        let graph = TaskGraph::build(project).unwrap();
        let selected = graph.select(&["dist".to_string()]).unwrap();
        assert_eq!(graph.execution_order(&selected), vec!["helmPackage", "dist"]);
        let description = project.task("dist").unwrap().description().unwrap();
        assert!(description.contains("app-1.0.zip"));
    }

    #[tokio::test]
    async fn dist_archive_type_must_be_known() {
        let dir = tempfile::TempDir::new().unwrap();
        let text = "[[dist]]\noutput_file = \"app.tar.gz\"\narchive_type = \"rar\"\n";
        assert!(load_project_from_str(text, dir.path()).await.is_err());
    }

    #[test]
    fn toggles() {
        assert!(enabled::<ClippySection>(Some(Toggle::Flag(false))).is_none());
        assert!(enabled::<ClippySection>(Some(Toggle::Flag(true))).is_some());
    }
}
