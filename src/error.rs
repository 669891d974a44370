use thiserror::Error;

use crate::{property::PropertyError, util::CommandError};

#[derive(Debug, Error)]
pub enum KrakenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing or conflicting credentials for registry '{alias}' (host '{host}')")]
    Credentials { alias: String, host: String },

    #[error("Property error: {0}")]
    Property(#[from] PropertyError),

    #[error("Dependency error: {0}")]
    Dependency(String),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Task '{task}': {message}")]
    Task { task: String, message: String },
}

impl KrakenError {
    pub fn task(task: impl Into<String>, message: impl Into<String>) -> Self {
        KrakenError::Task {
            task: task.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KrakenError>;
