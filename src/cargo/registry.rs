use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use crate::{
    error::{KrakenError, Result},
    util::Credentials,
};

fn alias_regex() -> &'static Regex {
    static ALIAS: OnceLock<Regex> = OnceLock::new();
    ALIAS.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap())
}

/// A Cargo registry known under `alias` in `.cargo/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CargoRegistry {
    pub alias: String,
    pub index: String,
    pub read_credentials: Option<Credentials>,
    /// For Artifactory this is `Bearer <TOKEN>` with a token generated in the JFrog UI.
    pub publish_token: Option<String>,
}

impl CargoRegistry {
    pub fn new(alias: &str, index: &str) -> Result<Self> {
        if !alias_regex().is_match(alias) {
            return Err(KrakenError::Config(format!(
                "invalid cargo registry alias '{}'",
                alias
            )));
        }
        Ok(Self {
            alias: alias.to_string(),
            index: index.to_string(),
            read_credentials: None,
            publish_token: None,
        })
    }

    pub fn with_read_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.read_credentials = credentials;
        self
    }

    pub fn with_publish_token(mut self, token: Option<String>) -> Self {
        self.publish_token = token;
        self
    }

    /// Hostname of the index URL. Credentials are injected for requests to this host.
    pub fn host(&self) -> Result<String> {
        let invalid = || {
            KrakenError::Config(format!(
                "cannot determine the host of registry '{}' from index '{}'",
                self.alias, self.index
            ))
        };
        let url = Url::parse(&self.index).map_err(|_| invalid())?;
        url.host_str().map(str::to_string).ok_or_else(invalid)
    }

    pub fn publish_token(&self) -> Result<&str> {
        self.publish_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| self.missing_credentials())
    }

    /// Host and credentials the auth proxy injects. `None` for registries read anonymously.
    pub fn proxy_credentials(&self) -> Result<Option<(String, Credentials)>> {
        let Some(credentials) = &self.read_credentials else {
            return Ok(None);
        };
        let host = self.host()?;
        if credentials.username.is_empty() || credentials.password.is_empty() {
            return Err(KrakenError::Credentials {
                alias: self.alias.clone(),
                host,
            });
        }
        Ok(Some((host, credentials.clone())))
    }

    fn missing_credentials(&self) -> KrakenError {
        KrakenError::Credentials {
            alias: self.alias.clone(),
            host: self.host().unwrap_or_else(|_| self.index.clone()),
        }
    }
}
