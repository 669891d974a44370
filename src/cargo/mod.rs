//! Tasks for Rust projects built with Cargo.

mod manifest;
pub mod mitm;
mod registry;
mod tasks;

pub use manifest::{CargoBin, CargoManifest};
pub use registry::CargoRegistry;
pub use tasks::{
    BUILD_FLAGS_VAR, CargoAuthProxyTask, CargoBinaryArtifact, CargoBuildTask, CargoBumpVersionTask,
    CargoClippyAllow, CargoClippyTask, CargoFmtTask, CargoInvocation, CargoPublishTask, CargoTestTask,
};

use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    sync::{Arc, PoisonError, RwLock},
};

use serde::Deserialize;
use tracing::debug;

use crate::{
    error::{KrakenError, Result},
    generic::RenderFileTask,
    property::{PropertyError, Supplier},
    task::Project,
    util::Credentials,
};

pub const CARGO_BUILD_SUPPORT_GROUP: &str = "cargoBuildSupport";
pub const CARGO_SYNC_CONFIG_TASK: &str = "cargoSyncConfig";
pub const CARGO_AUTH_PROXY_TASK: &str = "cargoAuthProxy";

const MANAGED_HEADER: &str = "# This file is managed by Kraken. Manual edits to this file will be overwritten.";
const PARTIALLY_MANAGED_HEADER: &str =
    "# This file is partially managed by Kraken. Comments and manually added repositories are not preserved.";

/// Cargo settings shared by the tasks of one project.
///
/// Tasks hold suppliers that read these settings when evaluated, so registries added after a
/// task was created are still visible to it.
#[derive(Debug, Default)]
pub struct CargoSettings {
    registries: Arc<RwLock<Vec<CargoRegistry>>>,
    build_env: Arc<RwLock<BTreeMap<String, String>>>,
}

impl CargoSettings {
    /// Add a registry, replacing one with the same alias.
    pub fn add_registry(&self, registry: CargoRegistry) {
        let mut registries = self.registries.write().unwrap_or_else(PoisonError::into_inner);
        match registries.iter_mut().find(|r| r.alias == registry.alias) {
            Some(existing) => *existing = registry,
            None => registries.push(registry),
        }
    }

    pub fn registries(&self) -> Vec<CargoRegistry> {
        self.registries.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn registry(&self, alias: &str) -> Option<CargoRegistry> {
        self.registries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.alias == alias)
            .cloned()
    }

    /// Environment for every cargo invocation. Per-task `env` overrides it.
    pub fn set_build_env(&self, key: impl Into<String>, value: impl Into<String>) {
        self.build_env
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    fn registries_supplier(&self) -> Supplier<Vec<CargoRegistry>> {
        let registries = Arc::clone(&self.registries);
        Supplier::of_callable(
            move || Ok(registries.read().unwrap_or_else(PoisonError::into_inner).clone()),
            vec![],
        )
    }

    fn registry_supplier(&self, alias: &str) -> Supplier<CargoRegistry> {
        let registries = Arc::clone(&self.registries);
        let alias = alias.to_string();
        Supplier::of_callable(
            move || {
                registries
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .find(|r| r.alias == alias)
                    .cloned()
                    .ok_or_else(|| PropertyError::Supplier(format!("unknown cargo registry '{}'", alias)))
            },
            vec![],
        )
    }

    fn env_supplier(&self, overrides: BTreeMap<String, String>) -> Supplier<BTreeMap<String, String>> {
        let build_env = Arc::clone(&self.build_env);
        Supplier::of_callable(
            move || {
                let mut env = build_env.read().unwrap_or_else(PoisonError::into_inner).clone();
                env.extend(overrides.clone());
                Ok(env)
            },
            vec![],
        )
    }
}

/// Render `.cargo/config.toml` with an index entry per registry. In merge mode everything else
/// in `existing` is kept, but comments and formatting are not.
pub fn sync_config_content(existing: Option<&str>, registries: &[CargoRegistry], replace: bool) -> Result<String> {
    let mut content: toml::Table = match existing {
        Some(text) if !replace => toml::from_str(text)?,
        _ => toml::Table::new(),
    };
    if !registries.is_empty() {
        let section = content
            .entry("registries")
            .or_insert_with(|| toml::Value::Table(toml::Table::new()))
            .as_table_mut()
            .ok_or_else(|| KrakenError::Config("'registries' in cargo config is not a table".to_string()))?;
        for registry in registries {
            let mut entry = toml::Table::new();
            entry.insert("index".to_string(), toml::Value::String(registry.index.clone()));
            section.insert(registry.alias.clone(), toml::Value::Table(entry));
        }
    }
    let header = if replace { MANAGED_HEADER } else { PARTIALLY_MANAGED_HEADER };
    Ok(format!("{}\n{}", header, toml::to_string(&content)?))
}

pub fn cargo_registry(
    project: &mut Project,
    alias: &str,
    index: &str,
    read_credentials: Option<Credentials>,
    publish_token: Option<String>,
) -> Result<()> {
    let registry = CargoRegistry::new(alias, index)?
        .with_read_credentials(read_credentials)
        .with_publish_token(publish_token);
    debug!("Adding cargo registry '{}' ({})", alias, index);
    project.metadata_mut::<CargoSettings>().add_registry(registry);
    Ok(())
}

/// Background task that the build tasks depend on to reach private registries.
pub fn cargo_auth_proxy(project: &mut Project) -> Result<Arc<CargoAuthProxyTask>> {
    let registries = project.metadata_mut::<CargoSettings>().registries_supplier();
    let task = project.register(
        CARGO_AUTH_PROXY_TASK,
        Some(CARGO_BUILD_SUPPORT_GROUP),
        false,
        CargoAuthProxyTask::new,
    )?;
    task.registries.set(registries)?;
    project.add_relationship(CARGO_AUTH_PROXY_TASK, &format!(":{}?", CARGO_SYNC_CONFIG_TASK), true)?;
    Ok(task)
}

/// Keep `.cargo/config.toml` in sync with the registries added through [`cargo_registry`].
/// Also registers `cargoSyncConfig.check` in the `lint` group.
pub fn cargo_sync_config(project: &mut Project, replace: bool) -> Result<Arc<RenderFileTask>> {
    let registries = Arc::clone(&project.metadata_mut::<CargoSettings>().registries);
    let task = project.register(CARGO_SYNC_CONFIG_TASK, Some("fmt"), true, RenderFileTask::new)?;
    task.file.set(std::path::PathBuf::from(".cargo/config.toml"))?;

    let file = task.file.clone();
    task.content.set(Supplier::of_callable(
        move || {
            let path = file.get()?;
            let existing = match fs::read_to_string(&path) {
                Ok(text) => Some(text),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(PropertyError::Supplier(format!("{}: {}", path.display(), e))),
            };
            let registries = registries.read().unwrap_or_else(PoisonError::into_inner).clone();
            sync_config_content(existing.as_deref(), &registries, replace)
                .map_err(|e| PropertyError::Supplier(e.to_string()))
        },
        vec![],
    ))?;

    task.make_check_task(project, None, "lint", true)?;
    Ok(task)
}

pub fn cargo_clippy(
    project: &mut Project,
    fix: bool,
    allow: Option<CargoClippyAllow>,
) -> Result<Arc<CargoClippyTask>> {
    let (name, group) = if fix {
        ("cargoClippyFix", "fmt")
    } else {
        ("cargoClippy", "lint")
    };
    let task = project.register(name, Some(group), !fix, CargoClippyTask::new)?;
    task.fix.set(fix)?;
    task.allow.set(allow)?;
    // Clippy builds the code.
    project.add_relationship(name, &format!(":{}?", CARGO_BUILD_SUPPORT_GROUP), true)?;
    project.add_relationship(name, &format!(":{}?", CARGO_SYNC_CONFIG_TASK), true)?;
    Ok(task)
}

/// Registers `cargoFmt` (group `fmt`) and `cargoFmtCheck` (group `lint`).
pub fn cargo_fmt(project: &mut Project) -> Result<(Arc<CargoFmtTask>, Arc<CargoFmtTask>)> {
    let fmt = project.register("cargoFmt", Some("fmt"), false, CargoFmtTask::new)?;
    let check = project.register("cargoFmtCheck", Some("lint"), true, CargoFmtTask::new)?;
    check.check.set(true)?;
    Ok((fmt, check))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CargoBuildMode {
    Debug,
    Release,
}

impl CargoBuildMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CargoBuildMode::Debug => "debug",
            CargoBuildMode::Release => "release",
        }
    }

    fn task_name(&self) -> &'static str {
        match self {
            CargoBuildMode::Debug => "cargoBuildDebug",
            CargoBuildMode::Release => "cargoBuildRelease",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CargoBuildOptions {
    pub incremental: Option<bool>,
    /// Overrides for the project's build environment.
    pub env: BTreeMap<String, String>,
    pub name: Option<String>,
    /// Defaults to `build` for builds and `test` for tests.
    pub group: Option<String>,
}

fn relate_build_support(project: &mut Project, name: &str, build_support: bool) -> Result<()> {
    if build_support {
        project.add_relationship(name, &format!(":{}?", CARGO_BUILD_SUPPORT_GROUP), true)?;
    }
    project.add_relationship(name, &format!(":{}?", CARGO_SYNC_CONFIG_TASK), true)
}

pub fn cargo_build(
    project: &mut Project,
    mode: CargoBuildMode,
    options: CargoBuildOptions,
) -> Result<Arc<CargoBuildTask>> {
    let env = project.metadata_mut::<CargoSettings>().env_supplier(options.env);
    let name = options.name.unwrap_or_else(|| mode.task_name().to_string());
    let group = options.group.unwrap_or_else(|| "build".to_string());
    let task = project.register(&name, Some(&group), false, CargoBuildTask::new)?;
    task.target.set(mode.as_str().to_string())?;
    task.cargo.incremental.set(options.incremental)?;
    task.cargo.env.set(env)?;
    if mode == CargoBuildMode::Release {
        task.cargo.additional_args.set(vec!["--release".to_string()])?;
    }
    relate_build_support(project, &name, true)?;
    Ok(task)
}

pub fn cargo_test(project: &mut Project, options: CargoBuildOptions) -> Result<Arc<CargoTestTask>> {
    let env = project.metadata_mut::<CargoSettings>().env_supplier(options.env);
    let name = options.name.unwrap_or_else(|| "cargoTest".to_string());
    let group = options.group.unwrap_or_else(|| "test".to_string());
    let task = project.register(&name, Some(&group), false, CargoTestTask::new)?;
    task.cargo.incremental.set(options.incremental)?;
    task.cargo.env.set(env)?;
    relate_build_support(project, &name, true)?;
    Ok(task)
}

#[derive(Debug, Clone)]
pub struct CargoPublishOptions {
    /// Temporarily bump `Cargo.toml` to this version while publishing.
    pub version: Option<String>,
    /// `None` means "only when a version is given".
    pub allow_dirty: Option<bool>,
    pub verify: bool,
    pub additional_args: Vec<String>,
    pub incremental: Option<bool>,
    pub env: BTreeMap<String, String>,
    pub name: String,
}

impl Default for CargoPublishOptions {
    fn default() -> Self {
        Self {
            version: None,
            allow_dirty: None,
            verify: true,
            additional_args: Vec::new(),
            incremental: None,
            env: BTreeMap::new(),
            name: "cargoPublish".to_string(),
        }
    }
}

/// Publish the crate to the registry `registry`. Only a verifying publish depends on the
/// `cargoBuildSupport` group, since only it builds the crate.
pub fn cargo_publish(
    project: &mut Project,
    registry: &str,
    options: CargoPublishOptions,
) -> Result<Arc<CargoPublishTask>> {
    let settings = project.metadata_mut::<CargoSettings>();
    let registry = settings.registry_supplier(registry);
    let env = settings.env_supplier(options.env);

    let name = options.name;
    let task = project.register(&name, Some("publish"), false, CargoPublishTask::new)?;
    task.registry.set(registry)?;
    task.verify.set(options.verify)?;
    task.allow_dirty
        .set(options.allow_dirty.unwrap_or(options.version.is_some()))?;
    task.cargo.additional_args.set(options.additional_args)?;
    task.cargo.incremental.set(options.incremental)?;
    task.cargo.env.set(env)?;
    relate_build_support(project, &name, options.verify)?;

    if let Some(version) = options.version {
        let bump_name = format!("{}/bump", name);
        let bump = project.register(&bump_name, None, false, CargoBumpVersionTask::new)?;
        bump.version.set(version)?;
        bump.revert.set(true)?;
        project.add_relationship(&name, &bump_name, true)?;
    }
    Ok(task)
}
