//! Poetry and Slap: detection, managed environments, install and build commands.

use std::{
    env, fmt, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::{debug, warn};

use super::PythonIndex;
use crate::{
    error::{KrakenError, Result},
    util::ToolCommand,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PythonBuildSystem {
    Poetry,
    Slap,
}

impl fmt::Display for PythonBuildSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PythonBuildSystem::Poetry => "Poetry",
            PythonBuildSystem::Slap => "Slap",
        })
    }
}

impl PythonBuildSystem {
    /// Look at `pyproject.toml` in `project_dir`. Slap wins over Poetry when both match.
    pub fn detect(project_dir: &Path) -> Result<Option<Self>> {
        let content = match fs::read_to_string(project_dir.join("pyproject.toml")) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Self::detect_from(&content))
    }

    pub fn detect_from(pyproject: &str) -> Option<Self> {
        if pyproject.contains("[tool.slap]") {
            Some(PythonBuildSystem::Slap)
        } else if pyproject.contains("poetry-core") {
            Some(PythonBuildSystem::Poetry)
        } else {
            None
        }
    }

    /// Path of the project's managed environment, if it exists.
    pub async fn environment_path(&self, project_dir: &Path) -> Result<Option<PathBuf>> {
        match self {
            PythonBuildSystem::Poetry => poetry_environment(project_dir).await,
            PythonBuildSystem::Slap => {
                if let Some(venv) = env::var_os("VIRTUAL_ENV") {
                    return Ok(Some(PathBuf::from(venv)));
                }
                let command = ToolCommand::new("slap").args(["venv", "-p"]).cwd(project_dir);
                Ok(query_line(&command).await?.filter(|p| !p.is_empty()).map(PathBuf::from))
            }
        }
    }

    /// Commands that create the environment and install the project into it, in order.
    pub fn install_commands(&self) -> Vec<ToolCommand> {
        match self {
            PythonBuildSystem::Poetry => vec![ToolCommand::new("poetry").args(["install", "--no-interaction"])],
            PythonBuildSystem::Slap => vec![
                ToolCommand::new("slap").args(["venv", "-ac"]),
                ToolCommand::new("slap").args(["install", "--link"]),
            ],
        }
    }

    /// Rewrites the project version in the worktree. The change is not reverted.
    pub fn version_command(&self, version: &str) -> ToolCommand {
        match self {
            PythonBuildSystem::Poetry => ToolCommand::new("poetry").args(["version", version]),
            PythonBuildSystem::Slap => ToolCommand::new("slap").args(["release", version]),
        }
    }

    /// Poetry always writes to `dist/`; Slap writes to `staging`.
    pub fn build_command(&self, staging: &Path) -> ToolCommand {
        match self {
            PythonBuildSystem::Poetry => ToolCommand::new("poetry").arg("build"),
            PythonBuildSystem::Slap => ToolCommand::new("slap")
                .args(["publish", "--dry", "-b"])
                .arg(staging.to_string_lossy()),
        }
    }

    pub fn build_output_dir(&self, project_dir: &Path, staging: &Path) -> PathBuf {
        match self {
            PythonBuildSystem::Poetry => project_dir.join("dist"),
            PythonBuildSystem::Slap => staging.to_path_buf(),
        }
    }
}

/// Stdout of `command` when it exits 0, `None` when it exits 1.
async fn query_line(command: &ToolCommand) -> Result<Option<String>> {
    let output = command.output().await?;
    match output.status.code() {
        Some(0) => Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string())),
        Some(1) => Ok(None),
        code => Err(KrakenError::Io(std::io::Error::other(format!(
            "`{}` failed with exit code {:?}",
            command, code
        )))),
    }
}

/// `poetry env info -p` does not work when Poetry falls back to another interpreter, so
/// `poetry env list --full-path` is asked at the same time and used as a fallback.
async fn poetry_environment(project_dir: &Path) -> Result<Option<PathBuf>> {
    // An active environment would be reported instead of the project's own.
    let current = ToolCommand::new("poetry")
        .args(["env", "info", "-p"])
        .cwd(project_dir)
        .env_remove("VIRTUAL_ENV");
    let known = ToolCommand::new("poetry")
        .args(["env", "list", "--full-path"])
        .cwd(project_dir);
    let (current, known) = tokio::join!(query_line(&current), query_line(&known));

    match current {
        Ok(Some(path)) if !path.is_empty() => return Ok(Some(PathBuf::from(path))),
        Ok(_) => {}
        Err(e) => warn!("Could not query the current Poetry environment: {}", e),
    }
    let known = match known {
        Ok(listing) => parse_env_list(&listing.unwrap_or_default()),
        Err(e) => {
            warn!("Could not list Poetry environments: {}", e);
            Vec::new()
        }
    };
    if known.len() > 1 {
        warn!(
            "This project has multiple Poetry environments. Picking the first one ({})",
            known[0].display()
        );
    }
    Ok(known.into_iter().next())
}

fn parse_env_list(listing: &str) -> Vec<PathBuf> {
    listing
        .lines()
        .map(|line| line.trim().trim_end_matches("(Activated)").trim())
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Put the environment's scripts first on `PATH` and set `VIRTUAL_ENV`.
pub fn activate(command: ToolCommand, env_path: &Path) -> Result<ToolCommand> {
    let bin_dir = env_path.join(if cfg!(windows) { "Scripts" } else { "bin" });
    let path = env::var_os("PATH").unwrap_or_default();
    let path = env::join_paths(std::iter::once(bin_dir).chain(env::split_paths(&path)))
        .map_err(|e| KrakenError::Config(format!("cannot activate {}: {}", env_path.display(), e)))?;
    debug!("Activating managed environment ({})", env_path.display());
    Ok(command
        .env("VIRTUAL_ENV", env_path.to_string_lossy())
        .env("PATH", path.to_string_lossy()))
}

/// `poetry.toml` with `http-basic` credentials for every package source that has them, or
/// `None` when there is nothing to add.
pub fn poetry_toml_with_credentials(existing: Option<&str>, indexes: &[PythonIndex]) -> Result<Option<String>> {
    let sources: Vec<_> = indexes
        .iter()
        .filter(|index| index.is_package_source)
        .filter_map(|index| index.credentials.as_ref().map(|c| (index.alias.as_str(), c)))
        .collect();
    if sources.is_empty() {
        return Ok(None);
    }

    let mut config: toml::Table = match existing {
        Some(text) => toml::from_str(text)?,
        None => toml::Table::new(),
    };
    let http_basic = config
        .entry("http-basic")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()))
        .as_table_mut()
        .ok_or_else(|| KrakenError::Config("'http-basic' in poetry.toml is not a table".to_string()))?;
    for (alias, credentials) in sources {
        let mut entry = toml::Table::new();
        entry.insert("username".to_string(), credentials.username.clone().into());
        entry.insert("password".to_string(), credentials.password.clone().into());
        http_basic.insert(alias.to_string(), toml::Value::Table(entry));
    }
    Ok(Some(toml::to_string(&config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Credentials;

    #[test]
    fn detection_prefers_slap() {
        let poetry = "[build-system]\nrequires = [\"poetry-core\"]\n";
        assert_eq!(PythonBuildSystem::detect_from(poetry), Some(PythonBuildSystem::Poetry));
        let slap = format!("{}\n[tool.slap]\ntyped = true\n", poetry);
        assert_eq!(PythonBuildSystem::detect_from(&slap), Some(PythonBuildSystem::Slap));
        assert_eq!(PythonBuildSystem::detect_from("[project]\nname = \"x\"\n"), None);
    }

    #[test]
    fn missing_pyproject_detects_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(PythonBuildSystem::detect(dir.path()).unwrap(), None);
    }

    #[test]
    fn env_list_drops_activation_marker() {
        let listing = "/cache/demo-abc-py3.10 (Activated)\n\n/cache/demo-abc-py3.9\n";
        assert_eq!(
            parse_env_list(listing),
            vec![
                PathBuf::from("/cache/demo-abc-py3.10"),
                PathBuf::from("/cache/demo-abc-py3.9")
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn activation_prepends_bin_dir() {
        let command = activate(ToolCommand::new("pytest"), Path::new("/venvs/demo")).unwrap();
        assert_eq!(command.get_env("VIRTUAL_ENV"), Some("/venvs/demo"));
        assert!(command.get_env("PATH").unwrap().starts_with("/venvs/demo/bin"));
    }

    #[test]
    fn poetry_credentials_merge_into_existing_config() {
        let mut private = PythonIndex::new("private", "https://pypi.example.test/simple").unwrap();
        private.credentials = Some(Credentials::new("me", "pw"));
        let mut upload_only = PythonIndex::new("upload", "https://upload.example.test/").unwrap();
        upload_only.is_package_source = false;
        upload_only.credentials = Some(Credentials::new("x", "y"));

        let existing = "[virtualenvs]\nin-project = true\n";
        let rendered = poetry_toml_with_credentials(Some(existing), &[private, upload_only])
            .unwrap()
            .unwrap();
        let parsed: toml::Table = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed["virtualenvs"]["in-project"].as_bool(), Some(true));
        assert_eq!(parsed["http-basic"]["private"]["password"].as_str(), Some("pw"));
        assert!(parsed["http-basic"].get("upload").is_none());
    }

    #[test]
    fn no_credentials_leaves_poetry_toml_alone() {
        let index = PythonIndex::new("pypi", "https://pypi.org/simple").unwrap();
        assert_eq!(poetry_toml_with_credentials(None, &[index]).unwrap(), None);
    }
}
