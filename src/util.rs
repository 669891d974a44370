use base64::{Engine, engine::general_purpose::STANDARD};
use glob::glob;
use std::process::{Output, Stdio};
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    io::Error as IoError,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    error::{KrakenError, Result},
    output::OutputMode,
};

/// Replacement for secrets in displayed command lines.
pub const MASK: &str = "[MASKED]";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command execution error: {0}")]
    Io(#[from] IoError),
    #[error("Command timed out")]
    Timeout,
}

/// Username/password pair used for HTTP basic authentication.
#[derive(Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `base64(username:password)`, as used in Basic auth headers and Docker `config.json`.
    pub fn basic_token(&self) -> String {
        STANDARD.encode(format!("{}:{}", self.username, self.password))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &MASK)
            .finish()
    }
}

/// An external tool invocation: argv, environment, working directory and optional stdin.
///
/// Arguments holding a value registered with [`ToolCommand::secret`] are replaced by [`MASK`]
/// wherever the command is displayed or logged. `Debug` shows environment keys only.
#[derive(Clone, Default)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    env_remove: Vec<String>,
    cwd: Option<PathBuf>,
    stdin: Option<Vec<u8>>,
    secrets: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Drop an inherited variable from the child's environment.
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.env.remove(&key);
        self.env_remove.push(key);
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn secret(mut self, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.secrets.push(value);
        }
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn get_cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn masked_argv(&self) -> Vec<String> {
        self.argv()
            .into_iter()
            .map(|arg| mask_argument(&arg, &self.secrets))
            .collect()
    }

    /// The masked command line, shell-quoted.
    pub fn display(&self) -> String {
        self.masked_argv()
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn build(&self) -> TokioCommand {
        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&self.args);
        for key in &self.env_remove {
            cmd.env_remove(key);
        }
        cmd.envs(&self.env).kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd
    }

    /// Start the process without waiting for it. The child is killed if its handle is dropped.
    pub fn spawn(&self, stdout: Stdio, stderr: Stdio) -> std::io::Result<Child> {
        let mut cmd = self.build();
        cmd.stdout(stdout).stderr(stderr);
        cmd.spawn()
    }

    /// Run to completion, streaming or grouping the output per `mode`.
    pub async fn run(&self, mode: OutputMode, timeout: Option<Duration>) -> Result<Output> {
        debug!("$ {}", self.display());
        let stream = mode.streams();
        let output = run_command_with_timeout(self, timeout, stream).await?;
        if !stream {
            let _guard = output_print_lock().lock().await;
            let mut out = tokio::io::stdout();
            let mut err = tokio::io::stderr();
            out.write_all(&output.stdout).await?;
            err.write_all(&output.stderr).await?;
            out.flush().await?;
            err.flush().await?;
        }
        Ok(output)
    }

    /// Run to completion and capture stdout/stderr without printing anything.
    pub async fn output(&self) -> Result<Output> {
        debug!("$ {}", self.display());
        Ok(run_command_with_timeout(self, None, false).await?)
    }
}

impl fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCommand")
            .field("argv", &self.masked_argv())
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("env_remove", &self.env_remove)
            .field("cwd", &self.cwd)
            .field("stdin", &self.stdin.as_ref().map(|data| data.len()))
            .finish()
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// Secrets shorter than this only mask arguments (or `=` values) equal to them.
const MIN_EMBEDDED_SECRET_LEN: usize = 4;

/// Mask one command-line argument. An argument holding a secret becomes [`MASK`]; for
/// `key=value` arguments only the value is replaced.
pub fn mask_argument(arg: &str, secrets: &[String]) -> String {
    let exposes = |text: &str| {
        secrets.iter().any(|secret| {
            !secret.is_empty()
                && (text == secret || (secret.len() >= MIN_EMBEDDED_SECRET_LEN && text.contains(secret.as_str())))
        })
    };
    match arg.split_once('=') {
        Some((key, value)) if !exposes(key) && exposes(value) => format!("{}={}", key, MASK),
        _ if exposes(arg) => MASK.to_string(),
        _ => arg.to_string(),
    }
}

pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r#"'"'"'"#))
    }
}

pub fn parse_timeout(timeout_str: Option<&str>, default_timeout: Option<&str>) -> Option<Duration> {
    let timeout_to_parse = timeout_str.or(default_timeout)?;

    if timeout_to_parse == "0" || timeout_to_parse.is_empty() {
        return None;
    }

    match timeout_to_parse.parse::<humantime::Duration>() {
        Ok(duration) => Some(duration.into()),
        Err(e) => {
            warn!(
                "Invalid timeout format '{}': {} (use a duration like '5m', '30s', '1h30m')",
                timeout_to_parse, e
            );
            None
        }
    }
}

/// Expand file patterns relative to `base`, keeping the first occurrence of every match.
pub fn expand_globs(base: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut result = Vec::new();
    let mut seen = HashSet::new();

    for pattern in patterns {
        let full = base.join(pattern);
        let full = full.to_string_lossy();
        let paths = glob(&full)
            .map_err(|e| KrakenError::Config(format!("invalid pattern '{}': {}", pattern, e)))?;
        for path in paths {
            let path = path.map_err(|e| KrakenError::Io(e.into_error()))?;
            if path.is_file() && seen.insert(path.clone()) {
                result.push(path);
            }
        }
    }

    Ok(result)
}

async fn pump<R, W>(mut pipe: Option<R>, mut sink: W, stream: bool) -> std::result::Result<Vec<u8>, CommandError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut collected: Vec<u8> = Vec::new();
    if let Some(pipe) = pipe.as_mut() {
        let mut buf = [0u8; 8192];
        loop {
            let n = pipe.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
            if stream {
                sink.write_all(&buf[..n]).await?;
            }
        }
        if stream {
            sink.flush().await?;
        }
    }
    Ok(collected)
}

async fn run_command_with_timeout(
    command: &ToolCommand,
    timeout: Option<Duration>,
    stream_output: bool,
) -> std::result::Result<Output, CommandError> {
    let mut cmd = command.build();
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    if let (Some(data), Some(mut stdin)) = (command.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&data).await {
                debug!("Failed to write stdin: {}", e);
            }
        });
    }

    let stdout_handle = tokio::spawn(pump(child.stdout.take(), tokio::io::stdout(), stream_output));
    let stderr_handle = tokio::spawn(pump(child.stderr.take(), tokio::io::stderr(), stream_output));

    let status = match timeout {
        Some(duration) => {
            tokio::select! {
                result = child.wait() => result?,
                _ = tokio::time::sleep(duration) => {
                    if let Err(kill_err) = child.kill().await {
                        warn!("Failed to kill timed-out process: {}", kill_err);
                    }
                    let _ = child.wait().await;
                    return Err(CommandError::Timeout);
                }
            }
        }
        None => child.wait().await?,
    };

    let stdout = stdout_handle.await.map_err(IoError::other)??;
    let stderr = stderr_handle.await.map_err(IoError::other)??;

    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

static OUTPUT_PRINT_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn output_print_lock() -> &'static Mutex<()> {
    OUTPUT_PRINT_LOCK.get_or_init(|| Mutex::new(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_masked_wherever_it_appears() {
        let cmd = ToolCommand::new("cargo")
            .args(["publish", "--token", "s3cret"])
            .arg("--header=Bearer s3cret")
            .secret("s3cret");
        let display = cmd.display();
        assert!(!display.contains("s3cret"));
        assert_eq!(
            cmd.masked_argv(),
            vec!["cargo", "publish", "--token", MASK, "--header=[MASKED]"]
        );
        assert_eq!(cmd.argv()[3], "s3cret");
    }

    #[test]
    fn short_secret_masks_only_whole_values() {
        let cmd = ToolCommand::new("mitmdump")
            .args(["--listen-port", "8899", "-u", "p", "--proxyauth=p"])
            .arg("/tmp/kraken/conf")
            .secret("p");
        assert_eq!(
            cmd.masked_argv(),
            vec![
                "mitmdump",
                "--listen-port",
                "8899",
                "-u",
                MASK,
                "--proxyauth=[MASKED]",
                "/tmp/kraken/conf"
            ]
        );
    }

    #[test]
    fn embedded_secret_masks_the_whole_argument() {
        let cmd = ToolCommand::new("sh")
            .args(["-c", "echo 't0ps3cret' > /run/secrets/token && build"])
            .secret("t0ps3cret");
        assert_eq!(cmd.masked_argv(), vec!["sh", "-c", MASK]);
    }

    #[test]
    fn empty_secret_is_ignored() {
        let cmd = ToolCommand::new("echo").arg("hello").secret("");
        assert_eq!(cmd.display(), "echo hello");
    }

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(shell_quote("--release"), "--release");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn timeouts_parse_with_humantime() {
        assert_eq!(parse_timeout(Some("30s"), None), Some(Duration::from_secs(30)));
        assert_eq!(parse_timeout(None, Some("2m")), Some(Duration::from_secs(120)));
        assert_eq!(parse_timeout(Some("0"), Some("2m")), None);
        assert_eq!(parse_timeout(Some("soon"), None), None);
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials::new("me", "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output_and_feeds_stdin() {
        let output = ToolCommand::new("sh")
            .args(["-c", "read line; echo \"got $line\"; echo oops >&2; exit 3"])
            .stdin("hello\n")
            .output()
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "got hello\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr), "oops\n");
        assert_eq!(output.status.code(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_process() {
        let err = ToolCommand::new("sleep")
            .arg("5")
            .run(OutputMode::Group, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, KrakenError::Command(CommandError::Timeout)));
    }
}
