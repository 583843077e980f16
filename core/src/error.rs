use std::io;

use courier_protocol::ErrorKind;
use regex_lite::Regex;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, CourierErr>;

/// Why the path/command validator rejected an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    PathEscape,
    DangerousCommand,
    FilenameInvalid,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ViolationKind::PathEscape => "path_escape",
            ViolationKind::DangerousCommand => "dangerous_command",
            ViolationKind::FilenameInvalid => "filename_invalid",
        };
        write!(f, "{label}")
    }
}

#[derive(Error, Debug)]
pub enum CourierErr {
    /// The path/command validator rejected an input before it reached the
    /// agent.
    #[error("access denied ({kind}): {reason}")]
    PolicyViolation {
        kind: ViolationKind,
        reason: String,
    },

    /// A critical tool was denied mid-run. The supervisor cancels the agent
    /// as soon as this surfaces through the stream sink.
    #[error("{0}")]
    ToolValidation(ToolValidationError),

    /// Wall-clock budget for the entire run elapsed.
    #[error("agent timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The child could not be spawned, or exited reporting a failure of its
    /// own.
    #[error("agent process failed: {message}")]
    Process { message: String },

    #[error("{0}")]
    UsageLimitReached(UsageLimitReachedError),

    /// The stream closed without the final `result` message.
    #[error("agent stream ended without a result: {0}")]
    Parsing(String),

    #[error("no session with id: {0}")]
    SessionNotFound(String),

    /// The run was preempted by a newer request from the same user. Callers
    /// treat this as silence; the new run's progress replaces the old.
    #[error("run interrupted by a newer request")]
    Interrupted,

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

impl CourierErr {
    /// Machine-readable classification for error responses, where one
    /// exists. `Interrupted` and internal errors return `None`; the facade
    /// propagates those instead of translating them.
    pub fn response_kind(&self) -> Option<ErrorKind> {
        match self {
            CourierErr::PolicyViolation { .. } => Some(ErrorKind::PolicyViolation),
            CourierErr::ToolValidation(_) => Some(ErrorKind::ToolValidationFailed),
            CourierErr::Timeout { .. } => Some(ErrorKind::Timeout),
            CourierErr::Process { .. } => Some(ErrorKind::Process),
            CourierErr::UsageLimitReached(_) => Some(ErrorKind::UsageLimit),
            CourierErr::Parsing(_) => Some(ErrorKind::Parsing),
            CourierErr::SessionNotFound(_) => Some(ErrorKind::SessionNotFound),
            CourierErr::Interrupted
            | CourierErr::Io(_)
            | CourierErr::Json(_)
            | CourierErr::TokioJoin(_) => None,
        }
    }
}

/// Raised when the agent requests a critical tool the policy denies.
#[derive(Debug, Clone)]
pub struct ToolValidationError {
    pub blocked_tools: Vec<String>,
    pub allowed_tools: Vec<String>,
}

impl std::fmt::Display for ToolValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tool access blocked: {}", self.blocked_tools.join(", "))
    }
}

#[derive(Debug, Clone, Default)]
pub struct UsageLimitReachedError {
    /// Reset time parsed from the agent's error text, e.g. "7:30pm".
    pub reset_time: Option<String>,
    pub timezone: Option<String>,
}

impl std::fmt::Display for UsageLimitReachedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.reset_time, &self.timezone) {
            (Some(reset), Some(tz)) => write!(
                f,
                "Usage limit reached. Your limit resets at {reset} ({tz})."
            ),
            (Some(reset), None) => {
                write!(f, "Usage limit reached. Your limit resets at {reset}.")
            }
            _ => write!(f, "Usage limit reached. Please try again later."),
        }
    }
}

/// Recognize a usage-limit message in agent output and pull the reset time
/// out of the prose. Agents report this as free text, so matching is
/// deliberately loose: "limit reached", "resets at 7:30pm (UTC)", etc.
pub fn parse_usage_limit(text: &str) -> Option<UsageLimitReachedError> {
    let lowered = text.to_lowercase();
    if !lowered.contains("limit reached") && !lowered.contains("usage limit") {
        return None;
    }

    let reset_time = Regex::new(r"(?i)resets?\s*(?:at\s*)?(\d{1,2}(?::\d{2})?\s*(?:am|pm)?)")
        .ok()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string());
    let timezone = Regex::new(r"\(([^)]+)\)")
        .ok()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());

    Some(UsageLimitReachedError {
        reset_time,
        timezone,
    })
}
