use std::{
    collections::BTreeMap,
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::{
    manifest::CargoManifest,
    mitm::{AuthInjector, DEFAULT_PROXY_PORT, MitmProxy, ProxyOptions, inject_proxy_config},
    registry::CargoRegistry,
};
use crate::{
    error::{KrakenError, Result},
    fs::AtomicFileSwap,
    git::GitConfig,
    property::{AnyProperty, Property},
    task::{Task, TaskContext, TaskStatus},
    util::{Credentials, ToolCommand},
};

/// Extra flags appended to every `cargo build` and `cargo test`.
pub const BUILD_FLAGS_VAR: &str = "KRAKEN_CARGO_BUILD_FLAGS";

fn build_flags() -> Vec<String> {
    std::env::var(BUILD_FLAGS_VAR)
        .map(|flags| flags.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Options shared by every task that compiles the crate.
pub struct CargoInvocation {
    pub additional_args: Property<Vec<String>>,
    /// `CARGO_INCREMENTAL` is only set when this holds a value.
    pub incremental: Property<Option<bool>>,
    pub env: Property<BTreeMap<String, String>>,
}

impl CargoInvocation {
    pub fn new(owner: &str) -> Self {
        Self {
            additional_args: Property::new(owner, "additional_args").with_default(Vec::new()),
            incremental: Property::new(owner, "incremental").with_default(None),
            env: Property::new(owner, "env").with_default(BTreeMap::new()),
        }
    }

    fn properties(&self) -> [&dyn AnyProperty; 3] {
        [&self.additional_args, &self.incremental, &self.env]
    }

    fn command(&self, subcommand: &str) -> Result<ToolCommand> {
        let mut command = ToolCommand::new("cargo")
            .arg(subcommand)
            .args(self.additional_args.get()?)
            .envs(&self.env.get()?);
        if let Some(incremental) = self.incremental.get()? {
            command = command.env("CARGO_INCREMENTAL", if incremental { "1" } else { "0" });
        }
        Ok(command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CargoBinaryArtifact {
    pub name: String,
    pub path: PathBuf,
}

/// Runs `cargo build`. For `debug` and `release` targets the binaries declared in `Cargo.toml` are
/// published through `out_binaries` and must exist once the build succeeds.
pub struct CargoBuildTask {
    pub target: Property<String>,
    pub cargo: CargoInvocation,
    pub out_binaries: Property<Vec<CargoBinaryArtifact>>,
}

impl CargoBuildTask {
    pub fn new(name: &str) -> Self {
        Self {
            target: Property::config(name, "target"),
            cargo: CargoInvocation::new(name),
            out_binaries: Property::output(name, "out_binaries"),
        }
    }

    fn command(&self) -> Result<ToolCommand> {
        Ok(self.cargo.command("build")?.args(build_flags()))
    }

    fn binaries(&self, ctx: &TaskContext) -> Result<Vec<CargoBinaryArtifact>> {
        let target = match self.target.get() {
            Ok(target) if target == "debug" || target == "release" => target,
            _ => return Ok(Vec::new()),
        };
        let manifest = CargoManifest::read(&ctx.project_dir.join("Cargo.toml"))?;
        let target_dir = std::env::var("CARGO_TARGET_DIR").unwrap_or_else(|_| "target".to_string());
        let target_dir = ctx.project_dir.join(target_dir).join(&target);
        Ok(manifest
            .bins()
            .into_iter()
            .map(|bin| CargoBinaryArtifact {
                path: target_dir.join(&bin.name),
                name: bin.name,
            })
            .collect())
    }
}

#[async_trait]
impl Task for CargoBuildTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        let mut properties: Vec<&dyn AnyProperty> = vec![&self.target, &self.out_binaries];
        properties.extend(self.cargo.properties());
        properties
    }

    fn description(&self) -> Option<String> {
        let command = self.command().ok()?;
        Some(format!("Run `{}`.", command.display()))
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        let binaries = self.binaries(ctx)?;
        self.out_binaries.set(binaries.clone())?;

        let status = ctx.run(&self.command()?).await?;
        if status.is_failed() {
            return Ok(status);
        }
        if let Some(missing) = binaries.iter().find(|bin| !bin.path.is_file()) {
            return Ok(TaskStatus::failed(format!(
                "expected binary '{}' at {}",
                missing.name,
                missing.path.display()
            )));
        }
        Ok(status)
    }
}

pub struct CargoTestTask {
    pub cargo: CargoInvocation,
}

impl CargoTestTask {
    pub fn new(name: &str) -> Self {
        Self {
            cargo: CargoInvocation::new(name),
        }
    }

    fn command(&self) -> Result<ToolCommand> {
        Ok(self.cargo.command("test")?.args(build_flags()))
    }
}

#[async_trait]
impl Task for CargoTestTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        self.cargo.properties().to_vec()
    }

    fn description(&self) -> Option<String> {
        let command = self.command().ok()?;
        Some(format!("Run `{}`.", command.display()))
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        ctx.run(&self.command()?).await
    }
}

/// Runs `cargo publish` against one of the project's registries. The token never shows up in
/// logs or status messages.
pub struct CargoPublishTask {
    pub registry: Property<CargoRegistry>,
    /// Build the packaged crate before uploading it.
    pub verify: Property<bool>,
    pub allow_dirty: Property<bool>,
    pub cargo: CargoInvocation,
}

impl CargoPublishTask {
    pub fn new(name: &str) -> Self {
        Self {
            registry: Property::config(name, "registry"),
            verify: Property::config(name, "verify").with_default(true),
            allow_dirty: Property::config(name, "allow_dirty").with_default(false),
            cargo: CargoInvocation::new(name),
        }
    }

    fn command(&self) -> Result<ToolCommand> {
        let registry = self.registry.get()?;
        let token = registry.publish_token()?;
        let mut command = self
            .cargo
            .command("publish")?
            .args(["--registry", registry.alias.as_str(), "--token", token])
            .secret(token);
        if !self.verify.get()? {
            command = command.arg("--no-verify");
        }
        if self.allow_dirty.get()? && !command.get_args().iter().any(|a| a == "--allow-dirty") {
            command = command.arg("--allow-dirty");
        }
        Ok(command)
    }
}

#[async_trait]
impl Task for CargoPublishTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        let mut properties: Vec<&dyn AnyProperty> = vec![&self.registry, &self.verify, &self.allow_dirty];
        properties.extend(self.cargo.properties());
        properties
    }

    fn description(&self) -> Option<String> {
        let command = self.command().ok()?;
        Some(format!("Run `{}`.", command.display()))
    }

    /// An unknown registry alias is a configuration error for the whole build.
    fn finalize(&self, _ctx: &TaskContext) -> Result<()> {
        self.registry
            .get()
            .map_err(|e| KrakenError::Config(e.to_string()))?;
        Ok(())
    }

    async fn prepare(&self, _ctx: &TaskContext) -> Result<Option<TaskStatus>> {
        self.registry.get()?.publish_token()?;
        Ok(None)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        ctx.run(&self.command()?).await
    }
}

/// Rewrites `package.version` in `Cargo.toml`. With `revert` set the task keeps running in the
/// background and puts the original manifest back on teardown.
pub struct CargoBumpVersionTask {
    pub version: Property<String>,
    pub revert: Property<bool>,
    pub cargo_toml_file: Property<PathBuf>,
    swap: Mutex<Option<AtomicFileSwap>>,
}

impl CargoBumpVersionTask {
    pub fn new(name: &str) -> Self {
        Self {
            version: Property::config(name, "version"),
            revert: Property::config(name, "revert").with_default(false),
            cargo_toml_file: Property::config(name, "cargo_toml_file")
                .with_default(PathBuf::from("Cargo.toml")),
            swap: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Task for CargoBumpVersionTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        vec![&self.version, &self.revert, &self.cargo_toml_file]
    }

    fn description(&self) -> Option<String> {
        Some(format!(
            "Bump the version in \"{}\" to \"{}\" [temporary: {}]",
            self.cargo_toml_file.get().ok()?.display(),
            self.version.get().ok()?,
            self.revert.get_or(false)
        ))
    }

    fn finalize(&self, ctx: &TaskContext) -> Result<()> {
        let dir = ctx.project_dir.clone();
        self.cargo_toml_file.set_map(move |path| dir.join(path))?;
        Ok(())
    }

    async fn execute(&self, _ctx: &TaskContext) -> Result<TaskStatus> {
        let file = self.cargo_toml_file.get()?;
        let version = self.version.get()?;
        let revert = self.revert.get()?;

        let mut manifest = CargoManifest::read(&file)?;
        manifest.set_version(&version)?;
        let swap = AtomicFileSwap::replace(&file, manifest.to_toml_string()?.as_bytes(), revert, false)?;

        if !revert {
            return Ok(TaskStatus::succeeded(format!("permanent bump to {}", version)));
        }
        *self.swap.lock().unwrap_or_else(PoisonError::into_inner) = Some(swap);
        Ok(TaskStatus::Started(Some(format!("temporary bump to {}", version))))
    }

    async fn teardown(&self, _ctx: &TaskContext) -> Result<TaskStatus> {
        let swap = self.swap.lock().unwrap_or_else(PoisonError::into_inner).take();
        match swap {
            Some(swap) => {
                let path = swap.path().to_path_buf();
                swap.restore()?;
                Ok(TaskStatus::succeeded(format!("restored {}", path.display())))
            }
            None => Ok(TaskStatus::Succeeded(None)),
        }
    }
}

/// What `cargo clippy --fix` tolerates in the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CargoClippyAllow {
    Staged,
    Dirty,
}

impl FromStr for CargoClippyAllow {
    type Err = KrakenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "staged" => Ok(Self::Staged),
            "dirty" => Ok(Self::Dirty),
            other => Err(KrakenError::Config(format!("invalid allow: '{}'", other))),
        }
    }
}

impl fmt::Display for CargoClippyAllow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Staged => f.write_str("staged"),
            Self::Dirty => f.write_str("dirty"),
        }
    }
}

pub struct CargoClippyTask {
    pub fix: Property<bool>,
    pub allow: Property<Option<CargoClippyAllow>>,
}

impl CargoClippyTask {
    pub fn new(name: &str) -> Self {
        Self {
            fix: Property::config(name, "fix").with_default(false),
            allow: Property::config(name, "allow").with_default(Some(CargoClippyAllow::Staged)),
        }
    }

    fn command(&self) -> Result<ToolCommand> {
        let mut command = ToolCommand::new("cargo").arg("clippy");
        if self.fix.get()? {
            command = command.arg("--fix");
            if let Some(allow) = self.allow.get()? {
                command = command.arg(format!("--allow-{}", allow));
            }
        }
        Ok(command)
    }
}

#[async_trait]
impl Task for CargoClippyTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        vec![&self.fix, &self.allow]
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        ctx.run(&self.command()?).await
    }
}

pub struct CargoFmtTask {
    pub check: Property<bool>,
}

impl CargoFmtTask {
    pub fn new(name: &str) -> Self {
        Self {
            check: Property::config(name, "check").with_default(false),
        }
    }
}

#[async_trait]
impl Task for CargoFmtTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        vec![&self.check]
    }

    fn description(&self) -> Option<String> {
        if self.check.get_or(false) {
            Some("Run `cargo fmt --check`.".to_string())
        } else {
            Some("Run `cargo fmt`.".to_string())
        }
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        let mut command = ToolCommand::new("cargo").arg("fmt");
        if self.check.get()? {
            command = command.arg("--check");
        }
        ctx.run(&command).await
    }
}

struct ProxySession {
    proxy: MitmProxy,
    swaps: Vec<AtomicFileSwap>,
}

/// Background task running the credential proxy for registries with read credentials.
///
/// While it runs, `.cargo/config.toml` and the global git config point at the proxy. Both files
/// are restored on teardown. `proxy_url` and `proxy_cert_file` are only valid until then.
pub struct CargoAuthProxyTask {
    pub registries: Property<Vec<CargoRegistry>>,
    pub cargo_config_file: Property<PathBuf>,
    pub git_config_file: Property<PathBuf>,
    pub proxy_port: Property<u16>,
    pub proxy_confdir: Property<PathBuf>,
    pub startup_timeout: Property<Duration>,
    pub idle_timeout: Property<Option<Duration>>,
    pub proxy_url: Property<String>,
    pub proxy_cert_file: Property<PathBuf>,
    session: Mutex<Option<ProxySession>>,
}

impl CargoAuthProxyTask {
    pub fn new(name: &str) -> Self {
        Self {
            registries: Property::config(name, "registries").with_default(Vec::new()),
            cargo_config_file: Property::config(name, "cargo_config_file")
                .with_default(PathBuf::from(".cargo/config.toml")),
            git_config_file: Property::config(name, "git_config_file"),
            proxy_port: Property::config(name, "proxy_port").with_default(DEFAULT_PROXY_PORT),
            proxy_confdir: Property::config(name, "proxy_confdir"),
            startup_timeout: Property::config(name, "startup_timeout")
                .with_default(Duration::from_secs(10)),
            idle_timeout: Property::config(name, "idle_timeout").with_default(None),
            proxy_url: Property::output(name, "proxy_url"),
            proxy_cert_file: Property::output(name, "proxy_cert_file"),
            session: Mutex::new(None),
        }
    }

    /// Credentials per index host. A registry whose host cannot be determined is an error, not an
    /// unauthenticated registry, and so is a host claimed by two registries with different
    /// credentials.
    pub fn injector(&self) -> Result<AuthInjector> {
        let mut auth: BTreeMap<String, Credentials> = BTreeMap::new();
        for registry in self.registries.get()? {
            let Some((host, credentials)) = registry.proxy_credentials()? else {
                continue;
            };
            match auth.get(&host) {
                Some(existing) if *existing != credentials => {
                    return Err(KrakenError::Credentials {
                        alias: registry.alias.clone(),
                        host,
                    });
                }
                _ => {
                    auth.insert(host, credentials);
                }
            }
        }
        Ok(AuthInjector::new(auth))
    }

    fn options(&self) -> Result<ProxyOptions> {
        let mut options = ProxyOptions::new(self.proxy_confdir.get()?);
        options.port = self.proxy_port.get()?;
        options.startup_timeout = self.startup_timeout.get()?;
        options.idle_timeout = self.idle_timeout.get()?;
        Ok(options)
    }
}

#[async_trait]
impl Task for CargoAuthProxyTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        vec![
            &self.registries,
            &self.cargo_config_file,
            &self.git_config_file,
            &self.proxy_port,
            &self.proxy_confdir,
            &self.startup_timeout,
            &self.idle_timeout,
            &self.proxy_url,
            &self.proxy_cert_file,
        ]
    }

    fn description(&self) -> Option<String> {
        Some(format!(
            "Inject read credentials for private Cargo registries through a proxy on port {}.",
            self.proxy_port.get_or(DEFAULT_PROXY_PORT)
        ))
    }

    fn finalize(&self, ctx: &TaskContext) -> Result<()> {
        let dir = ctx.project_dir.clone();
        self.cargo_config_file.set_map(move |path| dir.join(path))?;
        if let Ok(path) = GitConfig::global_path() {
            self.git_config_file.setdefault(path)?;
        }
        self.proxy_confdir
            .setdefault(ProxyOptions::default_confdir(&ctx.build_dir.join("mitmproxy")))?;
        Ok(())
    }

    async fn execute(&self, _ctx: &TaskContext) -> Result<TaskStatus> {
        let injector = self.injector()?;
        if injector.is_empty() {
            return Ok(TaskStatus::Skipped(
                "no registry has read credentials".to_string(),
            ));
        }
        let cargo_config = self.cargo_config_file.get()?;
        let git_config = self.git_config_file.get()?;

        let proxy = MitmProxy::start(&injector, &self.options()?).await?;
        let swaps = match inject_proxy_config(&cargo_config, &git_config, proxy.url(), proxy.cert_file()) {
            Ok(swaps) => swaps,
            Err(e) => {
                proxy.stop().await;
                return Err(e);
            }
        };
        self.proxy_url.set(proxy.url().to_string())?;
        self.proxy_cert_file.set(proxy.cert_file().to_path_buf())?;

        let message = format!(
            "proxy at {} for {}",
            proxy.url(),
            injector.hosts().collect::<Vec<_>>().join(", ")
        );
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(ProxySession { proxy, swaps });
        Ok(TaskStatus::Started(Some(message)))
    }

    async fn teardown(&self, _ctx: &TaskContext) -> Result<TaskStatus> {
        let session = self.session.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(ProxySession { proxy, swaps }) = session else {
            return Ok(TaskStatus::Succeeded(None));
        };

        let mut first_error = None;
        for swap in swaps.into_iter().rev() {
            info!("Restoring {}", swap.path().display());
            if let Err(e) = swap.restore() {
                warn!("Failed to restore config: {}", e);
                first_error.get_or_insert(e);
            }
        }
        proxy.stop().await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(TaskStatus::succeeded("proxy stopped")),
        }
    }
}
