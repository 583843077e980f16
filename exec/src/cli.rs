use clap::Parser;
use clap::ValueEnum;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    /// Path to a courier TOML config file. Without one, a default config
    /// rooted at the working directory is used.
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Working directory for the agent. Defaults to the current directory.
    #[arg(long = "cd", short = 'C', value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Agent session id to resume.
    #[arg(long)]
    pub session: Option<String>,

    /// Continue the most recent session for this directory instead of
    /// starting a new one.
    #[arg(long = "continue", default_value_t = false)]
    pub continue_latest: bool,

    /// User id recorded against the run; defaults to 0 for local use.
    #[arg(long, default_value_t = 0)]
    pub user: i64,

    /// Specifies color settings for use in the output.
    #[arg(long = "color", value_enum, default_value_t = Color::Auto)]
    pub color: Color,

    /// Initial instructions for the agent. Pass `-` (or nothing, when piped)
    /// to read the prompt from stdin.
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum Color {
    Always,
    Never,
    #[default]
    Auto,
}
