use std::{
    fs,
    path::{Path, PathBuf},
};

use toml::{Table, Value};

use crate::error::{KrakenError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CargoBin {
    pub name: String,
    pub path: Option<String>,
}

/// The parts of `Cargo.toml` the cargo tasks read or rewrite. Everything else is kept as-is.
#[derive(Debug, Clone)]
pub struct CargoManifest {
    path: PathBuf,
    data: Table,
}

impl CargoManifest {
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let data: Table = toml::from_str(text)?;
        Ok(Self {
            path: path.to_path_buf(),
            data,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn package(&self) -> Option<&Table> {
        self.data.get("package").and_then(Value::as_table)
    }

    pub fn package_name(&self) -> Option<&str> {
        self.package()?.get("name")?.as_str()
    }

    pub fn version(&self) -> Option<&str> {
        self.package()?.get("version")?.as_str()
    }

    pub fn set_version(&mut self, version: &str) -> Result<()> {
        let package = self
            .data
            .get_mut("package")
            .and_then(Value::as_table_mut)
            .ok_or_else(|| {
                KrakenError::Config(format!(
                    "'{}' has no [package] section",
                    self.path.display()
                ))
            })?;
        package.insert("version".to_string(), Value::String(version.to_string()));
        Ok(())
    }

    /// `[[bin]]` targets.
    pub fn bins(&self) -> Vec<CargoBin> {
        let Some(bins) = self.data.get("bin").and_then(Value::as_array) else {
            return Vec::new();
        };
        bins.iter()
            .filter_map(Value::as_table)
            .filter_map(|bin| {
                Some(CargoBin {
                    name: bin.get("name")?.as_str()?.to_string(),
                    path: bin.get("path").and_then(Value::as_str).map(str::to_string),
                })
            })
            .collect()
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(&self.data)?)
    }
}
