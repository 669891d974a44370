use std::{collections::BTreeMap, fs, path::Path};

use serde_json::{Map, Value, json};
use tempfile::TempDir;

use crate::{error::Result, util::Credentials};

/// Docker `config.json` with one `auths` entry per registry host.
pub fn render_docker_auth(auth: &BTreeMap<String, Credentials>, pretty: bool) -> Result<String> {
    let auths: Map<String, Value> = auth
        .iter()
        .map(|(host, credentials)| (host.clone(), json!({ "auth": credentials.basic_token() })))
        .collect();
    let document = json!({ "auths": auths });
    Ok(if pretty {
        serde_json::to_string_pretty(&document)?
    } else {
        serde_json::to_string(&document)?
    })
}

/// A temporary `DOCKER_CONFIG` directory holding only the given credentials. Removed on drop.
pub struct DockerConfigDir {
    dir: TempDir,
}

impl DockerConfigDir {
    pub fn create(auth: &BTreeMap<String, Credentials>) -> Result<Self> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("config.json"), render_docker_auth(auth, false)?)?;
        Ok(Self { dir })
    }

    /// `None` when there are no credentials, so the user's own Docker config stays in effect.
    pub fn for_auth(auth: &BTreeMap<String, Credentials>) -> Result<Option<Self>> {
        if auth.is_empty() {
            return Ok(None);
        }
        Self::create(auth).map(Some)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}
