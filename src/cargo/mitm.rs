//! Local MITM proxy that adds HTTP basic auth to requests for private registries.
//!
//! Cargo and git can only talk to authenticated registries through a single global credential, if
//! at all. The proxy intercepts their HTTPS traffic (they are told to trust its CA certificate) and
//! adds `Authorization: Basic ...` to every request for a host listed in the credential table.
//! The proxy itself is `mitmdump`; [`AuthInjector`] decides which requests get a header and renders
//! that decision into `mitmdump` options.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::{
    net::TcpStream,
    process::Child,
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    error::{KrakenError, Result},
    fs::AtomicFileSwap,
    git::GitConfig,
    util::{Credentials, ToolCommand},
};

pub const DEFAULT_PROXY_PORT: u16 = 8899;
const CERT_FILE_NAME: &str = "mitmproxy-ca-cert.pem";
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// The parts of an intercepted request that decide whether credentials are injected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptedRequest {
    pub method: String,
    pub headers: Vec<(String, String)>,
}

impl InterceptedRequest {
    pub fn new(method: &str, host: &str) -> Self {
        Self {
            method: method.to_string(),
            headers: vec![("Host".to_string(), host.to_string())],
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_count(&self, name: &str) -> usize {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .count()
    }

    /// Host header without the port.
    pub fn host(&self) -> Option<&str> {
        let host = self.header("Host")?;
        Some(host.rsplit_once(':').map_or(host, |(h, port)| {
            if port.chars().all(|c| c.is_ascii_digit()) { h } else { host }
        }))
    }
}

/// Per-host credential table.
#[derive(Debug, Clone, Default)]
pub struct AuthInjector {
    auth: BTreeMap<String, Credentials>,
}

impl AuthInjector {
    pub fn new(auth: BTreeMap<String, Credentials>) -> Self {
        Self { auth }
    }

    pub fn is_empty(&self) -> bool {
        self.auth.is_empty()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.auth.keys().map(String::as_str)
    }

    pub fn basic_auth(credentials: &Credentials) -> String {
        format!("Basic {}", credentials.basic_token())
    }

    /// Add an `Authorization` header if the request is not a CONNECT, targets a known host and has
    /// no `Authorization` header yet. Returns whether the request was modified.
    pub fn inject(&self, request: &mut InterceptedRequest) -> bool {
        if request.method.eq_ignore_ascii_case("CONNECT") || request.header("Authorization").is_some() {
            return false;
        }
        let Some(credentials) = request.host().and_then(|host| self.auth.get(host)) else {
            return false;
        };
        let value = Self::basic_auth(credentials);
        debug!("Injecting Authorization for {} request", request.method);
        request.headers.push(("Authorization".to_string(), value));
        true
    }

    /// `--modify-headers` options implementing [`AuthInjector::inject`] in `mitmdump`.
    pub fn mitmproxy_args(&self) -> Vec<String> {
        self.auth
            .iter()
            .flat_map(|(host, credentials)| {
                [
                    "--modify-headers".to_string(),
                    format!(
                        "|~d ^{}$ & !~m CONNECT & !~hq Authorization|Authorization|{}",
                        regex::escape(host),
                        Self::basic_auth(credentials)
                    ),
                ]
            })
            .collect()
    }

    fn secrets(&self) -> Vec<String> {
        self.auth
            .values()
            .flat_map(|c| [Self::basic_auth(c), c.password.clone()])
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub program: String,
    pub port: u16,
    /// Where `mitmdump` keeps its CA. Reusing it across builds keeps the certificate stable.
    pub confdir: PathBuf,
    pub startup_timeout: Duration,
    /// Stop the proxy after this long even if it was never stopped explicitly.
    pub idle_timeout: Option<Duration>,
    /// Inherit the proxy's stdout/stderr instead of discarding them.
    pub debug: bool,
}

impl ProxyOptions {
    pub fn new(confdir: impl Into<PathBuf>) -> Self {
        let debug = matches!(
            std::env::var("KRAKEN_CARGO_MITM_DEBUG").as_deref(),
            Ok("1") | Ok("true")
        );
        Self {
            program: "mitmdump".to_string(),
            port: DEFAULT_PROXY_PORT,
            confdir: confdir.into(),
            startup_timeout: Duration::from_secs(10),
            idle_timeout: None,
            debug,
        }
    }

    /// `<data dir>/kraken/mitmproxy`, or `fallback` if there is no data directory.
    pub fn default_confdir(fallback: &Path) -> PathBuf {
        dirs::data_local_dir()
            .map(|dir| dir.join("kraken").join("mitmproxy"))
            .unwrap_or_else(|| fallback.to_path_buf())
    }

    pub fn cert_file(&self) -> PathBuf {
        self.confdir.join(CERT_FILE_NAME)
    }

    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    fn command(&self, injector: &AuthInjector) -> ToolCommand {
        let mut command = ToolCommand::new(&self.program)
            .args(["--listen-host", "127.0.0.1", "--listen-port"])
            .arg(self.port.to_string())
            .args(["--set".to_string(), format!("confdir={}", self.confdir.display())])
            .args(injector.mitmproxy_args());
        for secret in injector.secrets() {
            command = command.secret(secret);
        }
        command
    }
}

/// A running proxy. Dropping it stops the process; [`MitmProxy::stop`] also waits for it to exit.
#[derive(Debug)]
pub struct MitmProxy {
    url: String,
    cert_file: PathBuf,
    stop: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl MitmProxy {
    /// Start the proxy and wait until it accepts connections and its CA certificate exists.
    pub async fn start(injector: &AuthInjector, options: &ProxyOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.confdir)?;
        let command = options.command(injector);
        info!("Starting proxy server: {}", command.display());

        let (stdout, stderr) = if options.debug {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::null(), Stdio::null())
        };
        let mut child = command.spawn(stdout, stderr).map_err(|e| {
            KrakenError::Proxy(format!("failed to start '{}': {}", options.program, e))
        })?;

        if let Err(e) = wait_until_ready(&mut child, options).await {
            terminate(&mut child).await;
            return Err(e);
        }

        let (stop, stopped) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(child, stopped, options.idle_timeout));

        Ok(Self {
            url: options.url(),
            cert_file: options.cert_file(),
            stop: Some(stop),
            supervisor: Some(supervisor),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn cert_file(&self) -> &Path {
        &self.cert_file
    }

    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                warn!("Proxy supervisor failed: {}", e);
            }
        }
    }
}

impl Drop for MitmProxy {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn wait_until_ready(child: &mut Child, options: &ProxyOptions) -> Result<()> {
    let deadline = Instant::now() + options.startup_timeout;
    let cert_file = options.cert_file();
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(KrakenError::Proxy(format!(
                "proxy exited during startup ({}), is port {} in use?",
                status, options.port
            )));
        }
        if cert_file.is_file() && TcpStream::connect(("127.0.0.1", options.port)).await.is_ok() {
            debug!("Proxy is accepting connections on port {}", options.port);
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(KrakenError::Proxy(format!(
                "proxy did not become ready within {}",
                humantime::format_duration(options.startup_timeout)
            )));
        }
        sleep(POLL_INTERVAL).await;
    }
}

async fn supervise(mut child: Child, stop: oneshot::Receiver<()>, idle_timeout: Option<Duration>) {
    let idle = async {
        match idle_timeout {
            Some(duration) => sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = stop => debug!("Stopping proxy server"),
        _ = idle => warn!("Proxy reached its idle timeout, stopping it"),
        status = child.wait() => {
            warn!("Proxy server exited unexpectedly: {:?}", status);
            return;
        }
    }
    terminate(&mut child).await;
}

/// SIGTERM, then SIGKILL if the process is still running after a grace period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: `pid` belongs to a child we have not yet reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    if timeout(STOP_GRACE, child.wait()).await.is_err() {
        warn!("Proxy did not stop within {:?}, killing it", STOP_GRACE);
        let _ = child.kill().await;
    }
}

/// Point cargo and git at the proxy. The returned guards restore both files when dropped.
pub fn inject_proxy_config(
    cargo_config: &Path,
    git_config: &Path,
    proxy_url: &str,
    cert_file: &Path,
) -> Result<Vec<AtomicFileSwap>> {
    let cert = std::path::absolute(cert_file)?;
    let cert = cert.to_string_lossy();

    let mut cargo: toml::Table = if cargo_config.is_file() {
        toml::from_str(&std::fs::read_to_string(cargo_config)?)?
    } else {
        toml::Table::new()
    };
    let http = cargo
        .entry("http")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()))
        .as_table_mut()
        .ok_or_else(|| {
            KrakenError::Config(format!("'http' in {} is not a table", cargo_config.display()))
        })?;
    http.insert("proxy".to_string(), toml::Value::String(proxy_url.to_string()));
    http.insert("cainfo".to_string(), toml::Value::String(cert.to_string()));

    let mut git = GitConfig::load(git_config)?;
    git.set("http", "proxy", proxy_url);
    git.set("http", "sslCAInfo", &cert);

    let mut swaps = Vec::new();
    info!("Updating {}", cargo_config.display());
    swaps.push(AtomicFileSwap::replace(
        cargo_config,
        toml::to_string(&cargo)?.as_bytes(),
        true,
        true,
    )?);
    info!("Updating {}", git_config.display());
    swaps.push(AtomicFileSwap::replace(git_config, git.dump().as_bytes(), true, true)?);
    Ok(swaps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn injector() -> AuthInjector {
        let mut auth = BTreeMap::new();
        auth.insert("example.test".to_string(), Credentials::new("user", "pass"));
        AuthInjector::new(auth)
    }

    #[test]
    fn injects_exactly_one_header_for_known_hosts() {
        let mut request = InterceptedRequest::new("GET", "example.test:443");
        assert!(injector().inject(&mut request));
        assert_eq!(request.header("authorization"), Some("Basic dXNlcjpwYXNz"));
        assert!(!injector().inject(&mut request));
        assert_eq!(request.header_count("Authorization"), 1);
    }

    #[test]
    fn leaves_other_requests_alone() {
        let connect = InterceptedRequest::new("CONNECT", "example.test:443");
        let mut modified = connect.clone();
        assert!(!injector().inject(&mut modified));
        assert_eq!(modified, connect);

        let other = InterceptedRequest::new("GET", "crates.io");
        let mut modified = other.clone();
        assert!(!injector().inject(&mut modified));
        assert_eq!(modified, other);

        let authed = InterceptedRequest::new("GET", "example.test").with_header("Authorization", "Bearer abc");
        let mut modified = authed.clone();
        assert!(!injector().inject(&mut modified));
        assert_eq!(modified.header("Authorization"), Some("Bearer abc"));
    }

    #[test]
    fn mitmproxy_args_encode_the_same_rule() {
        assert_eq!(
            injector().mitmproxy_args(),
            vec![
                "--modify-headers".to_string(),
                r"|~d ^example\.test$ & !~m CONNECT & !~hq Authorization|Authorization|Basic dXNlcjpwYXNz"
                    .to_string(),
            ]
        );
    }

    #[test]
    fn displayed_command_hides_credentials() {
        let options = ProxyOptions::new("/tmp/mitm");
        let display = options.command(&injector()).display();
        assert!(display.contains("--listen-port 8899"));
        assert!(!display.contains("dXNlcjpwYXNz"));
    }

    #[test]
    fn config_files_are_restored_byte_for_byte() {
        let dir = TempDir::new().unwrap();
        let cargo_config = dir.path().join(".cargo").join("config.toml");
        let git_config = dir.path().join("home").join(".gitconfig");
        std::fs::create_dir_all(cargo_config.parent().unwrap()).unwrap();
        let original = "# managed\n[registries.priv]\nindex = \"https://example.test/repo.git\"\n";
        std::fs::write(&cargo_config, original).unwrap();

        {
            let _guards = inject_proxy_config(
                &cargo_config,
                &git_config,
                "http://localhost:8899",
                &dir.path().join("ca.pem"),
            )
            .unwrap();
            let injected: toml::Table =
                toml::from_str(&std::fs::read_to_string(&cargo_config).unwrap()).unwrap();
            assert_eq!(injected["http"]["proxy"].as_str(), Some("http://localhost:8899"));
            assert!(injected["registries"]["priv"].is_table());
            let git = GitConfig::load(&git_config).unwrap();
            assert_eq!(git.get("http", "sslCAInfo"), Some(dir.path().join("ca.pem").to_str().unwrap()));
        }

        assert_eq!(std::fs::read_to_string(&cargo_config).unwrap(), original);
        assert!(!git_config.exists());
    }

    #[tokio::test]
    #[ignore = "requires mitmdump on PATH"]
    async fn proxy_starts_and_stops() {
        let dir = TempDir::new().unwrap();
        let mut options = ProxyOptions::new(dir.path());
        options.port = 18899;
        let proxy = MitmProxy::start(&injector(), &options).await.unwrap();
        assert!(proxy.cert_file().is_file());
        proxy.stop().await;
        assert!(TcpStream::connect(("127.0.0.1", 18899)).await.is_err());
    }
}
