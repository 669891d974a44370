use clap::ValueEnum;
use serde::Deserialize;

#[derive(ValueEnum, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Stream tool output live.
    Stream,
    /// Print each tool's output as a single block after it exits.
    #[default]
    Group,
}

impl OutputMode {
    pub fn streams(self) -> bool {
        matches!(self, OutputMode::Stream)
    }
}
