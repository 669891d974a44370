use clap::Parser;

use crate::output::OutputMode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Project file to load
    #[arg(short = 'f', long = "file", default_value = "kraken.toml")]
    pub file: String,

    /// Enable verbose output and debug logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Override the project's default timeout per tool invocation (e.g., "5m", "30s", "1h30m")
    #[arg(short = 't', long = "timeout")]
    pub timeout: Option<String>,

    /// How to display tool output in the terminal
    #[arg(long = "output", value_enum)]
    pub output: Option<OutputMode>,

    /// Show what would be executed without running tasks
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// List the project's tasks and exit
    #[arg(long = "list")]
    pub list: bool,

    /// Tasks or groups to run (`name`, `:name`, `group`); the project's default tasks if empty
    pub targets: Vec<String>,
}
