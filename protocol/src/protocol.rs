//! Defines the protocol between the courier host and an agent child process.
//!
//! Agent back-ends emit line-delimited JSON on stdout; the stream parser in
//! `courier-core` turns each line into one [`StreamUpdate`]. Unknown message
//! types never surface here — the parser logs and drops them — so consumers
//! can be total over this enum.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// A single prompt relayed from the chat front-end to an agent.
///
/// Immutable once constructed; the facade derives everything else
/// (session identity, continuation flag) from the session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub prompt: String,
    /// Must be an absolute path under the approved directory.
    pub working_directory: PathBuf,
    pub user_id: i64,
    /// Agent-issued session id to resume, if the caller has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub continue_session: bool,
}

/// Consolidated outcome of one agent run. Produced exactly once per request,
/// for failures as well as successes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub content: String,
    pub session_id: String,
    /// Reported cost in USD; 0.0 when the back-end does not report cost.
    pub cost: f64,
    pub duration_ms: u64,
    pub num_turns: u32,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Tools the agent started, in arrival order.
    #[serde(default)]
    pub tools_used: Vec<ToolInvocation>,
}

impl AgentResponse {
    /// Error-shaped response with no session attached. The facade uses this
    /// when translating failures into user-facing replies.
    pub fn from_error(kind: ErrorKind, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            session_id: String::new(),
            cost: 0.0,
            duration_ms: 0,
            num_turns: 0,
            is_error: true,
            error_kind: Some(kind),
            tools_used: Vec::new(),
        }
    }
}

/// Machine-readable failure classification carried on error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PolicyViolation,
    ToolValidationFailed,
    Timeout,
    UsageLimit,
    Process,
    Parsing,
    SessionNotFound,
}

/// One tool the agent started during a run, as recorded on the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub input: Value,
}

/// A tool call requested inside an assistant message (`tool_use` block).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingPhase {
    /// Append-only partial scratchpad text.
    Delta,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Success,
    Error,
}

/// Back-end initialization notice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Tool names advertised by the back-end, when reported.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Echoed input; some back-ends emit this at the start of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingUpdate {
    pub content: String,
    pub subtype: ThinkingPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Assistant-visible text and/or requested tool calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Notification that a tool is about to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallUpdate {
    /// Identifier so this can be paired with the matching tool result.
    pub call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Completion of a previously started tool call, matched by `call_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultUpdate {
    pub call_id: String,
    pub tool_name: String,
    pub status: ToolCallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Final message of a run. At most one per request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultUpdate {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub is_error: bool,
    /// Back-end specific error discriminator, e.g. `error_max_turns`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
}

/// Out-of-band failure reported on the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorUpdate {
    pub message: String,
}

/// One event in an agent's output stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamUpdate {
    System(SystemUpdate),
    User(UserUpdate),
    Thinking(ThinkingUpdate),
    Assistant(AssistantUpdate),
    ToolCall(ToolCallUpdate),
    ToolResult(ToolResultUpdate),
    Result(ResultUpdate),
    Error(ErrorUpdate),
}

impl StreamUpdate {
    /// Tool calls requested by this update, if any. Assistant messages carry
    /// embedded tool-call requests; started tool calls surface as a
    /// single-element list so the monitor can treat both shapes uniformly.
    pub fn tool_calls(&self) -> Vec<ToolCallRequest> {
        match self {
            StreamUpdate::Assistant(update) => update.tool_calls.clone(),
            StreamUpdate::ToolCall(update) => vec![ToolCallRequest {
                name: update.tool_name.clone(),
                id: Some(update.call_id.clone()),
                input: update.tool_args.clone(),
            }],
            _ => Vec::new(),
        }
    }

    /// Session id carried in the update's session context, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            StreamUpdate::System(u) => u.session_id.as_deref(),
            StreamUpdate::User(u) => u.session_id.as_deref(),
            StreamUpdate::Thinking(u) => u.session_id.as_deref(),
            StreamUpdate::Assistant(u) => u.session_id.as_deref(),
            StreamUpdate::ToolCall(u) => u.session_id.as_deref(),
            StreamUpdate::ToolResult(u) => u.session_id.as_deref(),
            StreamUpdate::Result(u) => Some(u.session_id.as_str()),
            StreamUpdate::Error(_) => None,
        }
    }

    /// Updates that bypass the progress renderer's throttle window.
    pub fn is_important(&self) -> bool {
        matches!(
            self,
            StreamUpdate::ToolResult(_) | StreamUpdate::Result(_) | StreamUpdate::Error(_)
        )
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn stream_update_round_trips_through_tagged_json() {
        let update = StreamUpdate::ToolCall(ToolCallUpdate {
            call_id: "call-1".to_string(),
            tool_name: "read".to_string(),
            tool_args: json!({"path": "src/main.rs"}),
            timestamp: None,
            session_id: Some("sess-9".to_string()),
        });
        let wire = serde_json::to_value(&update).unwrap();
        assert_eq!(wire["type"], "tool_call");
        assert_eq!(wire["call_id"], "call-1");

        let back: StreamUpdate = serde_json::from_value(wire).unwrap();
        match back {
            StreamUpdate::ToolCall(u) => {
                assert_eq!(u.tool_name, "read");
                assert_eq!(u.session_id.as_deref(), Some("sess-9"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn assistant_tool_calls_are_visible_to_the_monitor() {
        let update = StreamUpdate::Assistant(AssistantUpdate {
            content: None,
            tool_calls: vec![ToolCallRequest {
                name: "write".to_string(),
                id: Some("c1".to_string()),
                input: json!({"file_path": "/etc/passwd"}),
            }],
            timestamp: None,
            session_id: None,
        });
        let calls = update.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "write");
    }

    #[test]
    fn importance_flags_drive_render_throttling() {
        let result = StreamUpdate::Result(ResultUpdate::default());
        assert!(result.is_important());

        let thinking = StreamUpdate::Thinking(ThinkingUpdate {
            content: "hmm".to_string(),
            subtype: ThinkingPhase::Delta,
            timestamp: None,
            session_id: None,
        });
        assert!(!thinking.is_important());
    }
}
