use std::io;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

/// Which agent back-end to drive. Selected once at start-up; there is no
/// runtime fallback between back-ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// One-shot agent CLI emitting stream-JSON on stdout. Reports cost.
    #[default]
    Primary,
    /// The same agent driven through its SDK/stdio dialect.
    Sdk,
    /// Alternate agent CLI with its own flag set. Does not report cost.
    Alternate,
}

/// Per-back-end knobs: where the binary lives and which model to request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendOptions {
    /// Explicit path to the agent binary. When unset, discovery falls back
    /// to an environment override and then a `$PATH` search.
    pub binary: Option<PathBuf>,
    pub model: Option<String>,
    /// Extra arguments appended verbatim before the prompt.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Static start-up configuration for the execution core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Absolute root below which all working directories and file-tool paths
    /// must lie.
    pub approved_directory: PathBuf,
    pub backend: BackendKind,
    /// Wall-clock bound over an entire agent run.
    pub agent_timeout_seconds: u64,
    /// Empty means "no constraint from this side".
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub session_timeout_hours: i64,
    pub max_turns: u32,
    /// Most recent stream messages retained for result extraction.
    pub max_message_buffer: usize,
    pub primary: BackendOptions,
    pub sdk: BackendOptions,
    pub alternate: BackendOptions,
}

pub const DEFAULT_AGENT_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_SESSION_TIMEOUT_HOURS: i64 = 24;
pub const DEFAULT_MAX_TURNS: u32 = 10;
pub const DEFAULT_MAX_MESSAGE_BUFFER: usize = 1000;

/// Serde mirror of the on-disk TOML. Everything is optional here so that a
/// partial file works; `Config::from_toml` applies defaults and validates.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigToml {
    pub approved_directory: Option<PathBuf>,
    pub backend: Option<BackendKind>,
    pub agent_timeout_seconds: Option<u64>,
    pub allowed_tools: Option<Vec<String>>,
    pub disallowed_tools: Option<Vec<String>>,
    pub session_timeout_hours: Option<i64>,
    pub max_turns: Option<u32>,
    pub max_message_buffer: Option<usize>,
    pub primary: Option<BackendOptions>,
    pub sdk: Option<BackendOptions>,
    pub alternate: Option<BackendOptions>,
}

impl Config {
    pub fn load(path: &Path) -> io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let cfg: ConfigToml = toml::from_str(&contents).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed to parse {}: {e}", path.display()),
            )
        })?;
        Self::from_toml(cfg)
    }

    pub fn from_toml(cfg: ConfigToml) -> io::Result<Self> {
        let approved_directory = cfg.approved_directory.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "approved_directory is required",
            )
        })?;
        if !approved_directory.is_absolute() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "approved_directory must be absolute: {}",
                    approved_directory.display()
                ),
            ));
        }

        let agent_timeout_seconds = cfg
            .agent_timeout_seconds
            .unwrap_or(DEFAULT_AGENT_TIMEOUT_SECONDS);
        if agent_timeout_seconds == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "agent_timeout_seconds must be at least 1",
            ));
        }

        Ok(Self {
            approved_directory,
            backend: cfg.backend.unwrap_or_default(),
            agent_timeout_seconds,
            allowed_tools: cfg.allowed_tools.unwrap_or_default(),
            disallowed_tools: cfg.disallowed_tools.unwrap_or_default(),
            session_timeout_hours: cfg
                .session_timeout_hours
                .unwrap_or(DEFAULT_SESSION_TIMEOUT_HOURS),
            max_turns: cfg.max_turns.unwrap_or(DEFAULT_MAX_TURNS),
            max_message_buffer: cfg
                .max_message_buffer
                .unwrap_or(DEFAULT_MAX_MESSAGE_BUFFER),
            primary: cfg.primary.unwrap_or_default(),
            sdk: cfg.sdk.unwrap_or_default(),
            alternate: cfg.alternate.unwrap_or_default(),
        })
    }

    /// Minimal configuration rooted at `approved_directory` with every other
    /// field at its default. Used by front-ends that run without a config
    /// file.
    pub fn with_approved_directory(approved_directory: PathBuf) -> io::Result<Self> {
        Self::from_toml(ConfigToml {
            approved_directory: Some(approved_directory),
            ..Default::default()
        })
    }

    pub fn backend_options(&self) -> &BackendOptions {
        match self.backend {
            BackendKind::Primary => &self.primary,
            BackendKind::Sdk => &self.sdk,
            BackendKind::Alternate => &self.alternate,
        }
    }
}
