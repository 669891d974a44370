//! Git helpers: versions derived from `git describe`, CI tag detection and `.gitconfig` editing.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;

use crate::{
    error::{KrakenError, Result},
    util::ToolCommand,
};

/// Describe the repository at `path` the way `git describe --tags --dirty` does.
pub async fn git_describe(path: &Path, tags: bool, dirty: bool) -> Result<String> {
    let mut command = ToolCommand::new("git").arg("describe").cwd(path);
    if tags {
        command = command.arg("--tags");
    }
    if dirty {
        command = command.arg("--dirty");
    }
    let output = command.output().await?;
    if !output.status.success() {
        return Err(KrakenError::Config(format!(
            "could not describe Git repository at '{}'",
            path.display()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// The tag being built in CI, if the current GitHub Actions ref is a tag.
pub fn ci_tag() -> Option<String> {
    ci_tag_from(|key| std::env::var(key).ok())
}

/// GitHub ref variables are ignored unless `CI` is set to something other than `false`/`0`.
pub fn ci_tag_from(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    let in_ci = lookup("CI").is_some_and(|ci| !matches!(ci.trim(), "" | "0" | "false"));
    if !in_ci {
        return None;
    }
    match lookup("GITHUB_REF_TYPE").as_deref() {
        Some("tag") => lookup("GITHUB_REF_NAME").filter(|name| !name.is_empty()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitDistance {
    pub value: u32,
    pub sha: String,
}

/// `X.Y.Z`, optionally followed by `-N-gSHA` (commits since the tag) and `-dirty`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub distance: Option<CommitDistance>,
    pub dirty: bool,
}

fn git_version_regex() -> &'static Regex {
    static GIT_VERSION: OnceLock<Regex> = OnceLock::new();
    GIT_VERSION.get_or_init(|| {
        Regex::new(r"^(\d+)\.(\d+)\.(\d+)(?:-(\d+)-g(\w+))?(-dirty)?$").unwrap()
    })
}

impl GitVersion {
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || KrakenError::Config(format!("not a valid GitVersion: '{}'", value));
        let caps = git_version_regex().captures(value).ok_or_else(invalid)?;
        let number = |i: usize| caps[i].parse::<u64>().map_err(|_| invalid());

        let distance = match (caps.get(4), caps.get(5)) {
            (Some(n), Some(sha)) => Some(CommitDistance {
                value: n.as_str().parse().map_err(|_| invalid())?,
                sha: sha.as_str().to_string(),
            }),
            _ => None,
        };

        Ok(Self {
            major: number(1)?,
            minor: number(2)?,
            patch: number(3)?,
            distance,
            dirty: caps.get(6).is_some(),
        })
    }

    fn base(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }

    /// PEP 440: `0.1.0-7-gabcdef` becomes `0.1.0.dev7`, or `0.1.0.dev7+gabcdef` with the SHA.
    pub fn to_python(&self, include_sha: bool) -> String {
        match &self.distance {
            None => self.base(),
            Some(d) if include_sha => format!("{}.dev{}+g{}", self.base(), d.value, d.sha),
            Some(d) => format!("{}.dev{}", self.base(), d.value),
        }
    }

    /// SemVer: `0.1.0-7-gabcdef` becomes `0.1.0-dev7`, or `0.1.0-dev7+abcdef` with the SHA.
    pub fn to_cargo(&self, include_sha: bool) -> String {
        match &self.distance {
            None => self.base(),
            Some(d) if include_sha => format!("{}-dev{}+{}", self.base(), d.value, d.sha),
            Some(d) => format!("{}-dev{}", self.base(), d.value),
        }
    }
}

impl fmt::Display for GitVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base())?;
        if let Some(d) = &self.distance {
            write!(f, "-{}-g{}", d.value, d.sha)?;
        }
        if self.dirty {
            f.write_str("-dirty")?;
        }
        Ok(())
    }
}

pub fn git_version_to_python(value: &str, include_sha: bool) -> Result<String> {
    Ok(GitVersion::parse(value)?.to_python(include_sha))
}

pub fn git_version_to_cargo(value: &str, include_sha: bool) -> Result<String> {
    Ok(GitVersion::parse(value)?.to_cargo(include_sha))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

/// Minimal reader/writer for git's INI-style config files. Comments are not preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitConfig {
    sections: Vec<Section>,
}

impl GitConfig {
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();
        // A repeated header continues the earlier section of the same name.
        let mut current = None;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = Some(config.section_index(header.trim()));
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (line, "true"),
            };
            if let Some(index) = current {
                config.sections[index]
                    .entries
                    .push((key.to_string(), value.to_string()));
            }
        }
        config
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    /// `~/.gitconfig`
    pub fn global_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".gitconfig"))
            .ok_or_else(|| KrakenError::Config("could not determine home directory".to_string()))
    }

    fn section_index(&mut self, name: &str) -> usize {
        match self.sections.iter().position(|s| s.name == name) {
            Some(index) => index,
            None => {
                self.sections.push(Section {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                self.sections.len() - 1
            }
        }
    }

    fn section_mut(&mut self, name: &str) -> &mut Section {
        let index = self.section_index(name);
        &mut self.sections[index]
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.name == section)?
            .entries
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        let section = self.section_mut(section);
        match section
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => section.entries.push((key.to_string(), value.to_string())),
        }
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push_str(&format!("[{}]\n", section.name));
            for (key, value) in &section.entries {
                out.push_str(&format!("\t{} = {}\n", key, value));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_versions() {
        assert_eq!(git_version_to_python("0.1.0", false).unwrap(), "0.1.0");
        assert_eq!(git_version_to_python("0.1.0", true).unwrap(), "0.1.0");
        assert_eq!(git_version_to_python("0.1.0-7-gabcdef", false).unwrap(), "0.1.0.dev7");
        assert_eq!(
            git_version_to_python("0.1.0-7-gabcdef", true).unwrap(),
            "0.1.0.dev7+gabcdef"
        );
    }

    #[test]
    fn cargo_versions_ignore_dirty() {
        assert_eq!(git_version_to_cargo("0.1.0", true).unwrap(), "0.1.0");
        assert_eq!(git_version_to_cargo("0.1.0-7-gabcdef", true).unwrap(), "0.1.0-dev7+abcdef");
        assert_eq!(git_version_to_cargo("0.1.0-7-gabcdef", false).unwrap(), "0.1.0-dev7");
        assert_eq!(
            git_version_to_cargo("0.1.0-7-gabcdef-dirty", true).unwrap(),
            "0.1.0-dev7+abcdef"
        );
    }

    #[test]
    fn parse_and_display() {
        let version = GitVersion::parse("1.2.3-10-g0badc0de-dirty").unwrap();
        assert_eq!(version.major, 1);
        assert_eq!(
            version.distance,
            Some(CommitDistance {
                value: 10,
                sha: "0badc0de".into()
            })
        );
        assert!(version.dirty);
        assert_eq!(version.to_string(), "1.2.3-10-g0badc0de-dirty");
        assert!(GitVersion::parse("v1.2.3").is_err());
        assert!(GitVersion::parse("1.2").is_err());
    }

    #[test]
    fn ci_tag_requires_tag_ref() {
        let env = |ref_type: &'static str| {
            move |key: &str| match key {
                "CI" => Some("true".to_string()),
                "GITHUB_REF_TYPE" => Some(ref_type.to_string()),
                "GITHUB_REF_NAME" => Some("1.4.0".to_string()),
                _ => None,
            }
        };
        assert_eq!(ci_tag_from(env("tag")), Some("1.4.0".to_string()));
        assert_eq!(ci_tag_from(env("branch")), None);

        let outside_ci = |key: &str| match key {
            "GITHUB_REF_TYPE" => Some("tag".to_string()),
            "GITHUB_REF_NAME" => Some("1.4.0".to_string()),
            _ => None,
        };
        assert_eq!(ci_tag_from(outside_ci), None);
    }

    #[test]
    fn repeated_gitconfig_section_keeps_its_entries() {
        let text = "[user]\n\tname = Jane\n[http]\n\tpostBuffer = 524288000\n[user]\n\temail = jane@example.test\n";
        let config = GitConfig::parse(text);
        assert_eq!(config.get("user", "email"), Some("jane@example.test"));
        assert_eq!(config.get("http", "email"), None);

        let reparsed = GitConfig::parse(&config.dump());
        assert_eq!(reparsed.get("user", "name"), Some("Jane"));
        assert_eq!(reparsed.get("user", "email"), Some("jane@example.test"));
        assert_eq!(reparsed.get("http", "postBuffer"), Some("524288000"));
    }

    #[test]
    fn gitconfig_round_trip_and_update() {
        let text = "# user settings\n[user]\n\tname = Jane\n\temail = jane@example.test\n[http]\n\tproxy = old\n";
        let mut config = GitConfig::parse(text);
        assert_eq!(config.get("user", "name"), Some("Jane"));
        config.set("http", "proxy", "http://localhost:8899");
        config.set("http", "sslCAInfo", "/tmp/ca.pem");
        let dumped = config.dump();
        assert_eq!(
            dumped,
            "[user]\n\tname = Jane\n\temail = jane@example.test\n[http]\n\tproxy = http://localhost:8899\n\tsslCAInfo = /tmp/ca.pem\n"
        );
        assert_eq!(GitConfig::parse(&dumped), config);
    }
}
