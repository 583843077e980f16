//! Line-delimited JSON stream handling for agent stdout.
//!
//! The reader pulls fixed-size chunks with a short poll timeout so that a
//! cancellation flag is observed even while the child is silent. Each
//! complete line is decoded with UTF-8 replacement and parsed into a
//! [`StreamUpdate`]; malformed lines are counted and skipped, never fatal.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use courier_protocol::AssistantUpdate;
use courier_protocol::ErrorUpdate;
use courier_protocol::ResultUpdate;
use courier_protocol::StreamUpdate;
use courier_protocol::SystemUpdate;
use courier_protocol::ThinkingPhase;
use courier_protocol::ThinkingUpdate;
use courier_protocol::ToolCallRequest;
use courier_protocol::ToolCallStatus;
use courier_protocol::ToolCallUpdate;
use courier_protocol::ToolInvocation;
use courier_protocol::ToolResultUpdate;
use courier_protocol::UserUpdate;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;

pub(crate) const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// How long a single read may block before the cancellation flag is
/// re-checked. This is a pump interval, not a request timeout.
pub(crate) const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Cooperative cancellation signal shared between the facade, the
/// supervisor registries, and the stream reader.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub(crate) enum ReadEvent {
    Line(String),
    Cancelled,
    Eof,
}

/// Buffered line reader over an agent's stdout pipe.
pub(crate) struct LineReader<R> {
    reader: R,
    buffer: Vec<u8>,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            chunk: vec![0u8; STREAM_CHUNK_BYTES],
            eof: false,
        }
    }

    /// Next complete line, or `Cancelled`/`Eof`. Checks the flag between
    /// chunks so it never blocks much longer than [`READ_POLL_INTERVAL`]
    /// past a cancel request.
    pub(crate) async fn next_line(&mut self, cancel: &CancelFlag) -> io::Result<ReadEvent> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                return Ok(ReadEvent::Line(decode_line(&line)));
            }

            if self.eof {
                if self.buffer.is_empty() {
                    return Ok(ReadEvent::Eof);
                }
                let line = std::mem::take(&mut self.buffer);
                return Ok(ReadEvent::Line(decode_line(&line)));
            }

            if cancel.is_cancelled() {
                return Ok(ReadEvent::Cancelled);
            }

            match timeout(READ_POLL_INTERVAL, self.reader.read(&mut self.chunk)).await {
                Err(_elapsed) => {
                    if cancel.is_cancelled() {
                        return Ok(ReadEvent::Cancelled);
                    }
                }
                Ok(Ok(0)) => self.eof = true,
                Ok(Ok(n)) => self.buffer.extend_from_slice(&self.chunk[..n]),
                Ok(Err(e)) => return Err(e),
            }
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

pub(crate) enum Parsed {
    Update(StreamUpdate),
    Ignored,
    Malformed,
}

/// Parse one wire line. Two dialects are accepted: the flat tagged shape
/// (`{"type":"tool_call","subtype":"started",...}` with `<name>ToolCall`
/// wrappers) and the block shape (assistant messages carrying `text` /
/// `tool_use` / `tool_result` content blocks).
pub(crate) fn parse_line(line: &str) -> Parsed {
    if line.is_empty() {
        return Parsed::Ignored;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, line = truncate_for_log(line), "failed to parse stream line");
            return Parsed::Malformed;
        }
    };
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        debug!(line = truncate_for_log(line), "stream message without a type");
        return Parsed::Malformed;
    };

    match kind {
        "system" => Parsed::Update(parse_system(&value)),
        "user" => Parsed::Update(parse_user(&value)),
        "thinking" => Parsed::Update(parse_thinking(&value)),
        "assistant" => Parsed::Update(parse_assistant(&value)),
        "tool_call" => parse_tool_event(&value),
        "tool_result" => parse_tool_result(&value),
        "result" => Parsed::Update(StreamUpdate::Result(parse_result(&value))),
        "error" => Parsed::Update(StreamUpdate::Error(ErrorUpdate {
            message: string_field(&value, "message")
                .or_else(|| string_field(&value, "error"))
                .unwrap_or_else(|| "unknown error".to_string()),
        })),
        other => {
            debug!(msg_type = other, "dropping unknown stream message type");
            Parsed::Ignored
        }
    }
}

/// Wrapper keys used by the flat tool-call dialect, mapped to plain tool
/// names. `mcpToolCall` is handled separately.
const TOOL_CALL_WRAPPERS: &[(&str, &str)] = &[
    ("grepToolCall", "grep"),
    ("readToolCall", "read"),
    ("editToolCall", "edit"),
    ("semSearchToolCall", "semsearch"),
    ("listToolCall", "list"),
    ("shellToolCall", "shell"),
    ("writeToolCall", "write"),
    ("globToolCall", "glob"),
    ("readLintsToolCall", "readlints"),
    ("updateTodosToolCall", "updatetodos"),
    ("deleteToolCall", "delete"),
    ("moveToolCall", "move"),
    ("copyToolCall", "copy"),
    ("mkdirToolCall", "mkdir"),
    ("webSearchToolCall", "websearch"),
    ("fetchToolCall", "fetch"),
    ("searchToolCall", "search"),
];

fn parse_system(value: &Value) -> StreamUpdate {
    StreamUpdate::System(SystemUpdate {
        subtype: string_field(value, "subtype"),
        model: string_field(value, "model"),
        cwd: string_field(value, "cwd"),
        tools: value
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        session_id: session_id_field(value),
    })
}

fn parse_user(value: &Value) -> StreamUpdate {
    let content = match value.get("content").and_then(Value::as_str) {
        Some(text) => Some(text.to_string()),
        None => {
            let parts = collect_text_blocks(value);
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
    };
    StreamUpdate::User(UserUpdate {
        content,
        session_id: session_id_field(value),
    })
}

fn parse_thinking(value: &Value) -> StreamUpdate {
    let subtype = match value.get("subtype").and_then(Value::as_str) {
        Some("delta") => ThinkingPhase::Delta,
        _ => ThinkingPhase::Completed,
    };
    StreamUpdate::Thinking(ThinkingUpdate {
        content: string_field(value, "text")
            .or_else(|| string_field(value, "content"))
            .unwrap_or_default(),
        subtype,
        timestamp: timestamp_field(value),
        session_id: session_id_field(value),
    })
}

fn parse_assistant(value: &Value) -> StreamUpdate {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCallRequest> = Vec::new();

    if let Some(blocks) = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    {
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        text_parts.push(text.to_string());
                    }
                }
                Some("tool_use") => {
                    if let Some(name) = block.get("name").and_then(Value::as_str) {
                        tool_calls.push(ToolCallRequest {
                            name: name.to_string(),
                            id: block.get("id").and_then(Value::as_str).map(str::to_string),
                            input: block.get("input").cloned().unwrap_or(Value::Null),
                        });
                    }
                }
                // Tool results embedded in assistant messages are treated as
                // appendable content.
                Some("tool_result") => {
                    if let Some(text) = block.get("content").and_then(Value::as_str) {
                        text_parts.push(text.to_string());
                    }
                }
                _ => {}
            }
        }
    } else if let Some(text) = value.get("content").and_then(Value::as_str) {
        text_parts.push(text.to_string());
    }

    if let Some(calls) = value.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            if let Some(name) = call.get("name").and_then(Value::as_str) {
                tool_calls.push(ToolCallRequest {
                    name: name.to_string(),
                    id: call.get("id").and_then(Value::as_str).map(str::to_string),
                    input: call.get("input").cloned().unwrap_or(Value::Null),
                });
            }
        }
    }

    StreamUpdate::Assistant(AssistantUpdate {
        content: (!text_parts.is_empty()).then(|| text_parts.concat()),
        tool_calls,
        timestamp: timestamp_field(value),
        session_id: session_id_field(value),
    })
}

/// Flat dialect `tool_call` message, `subtype` `started` or `completed`.
fn parse_tool_event(value: &Value) -> Parsed {
    let subtype = value.get("subtype").and_then(Value::as_str);
    let Some(call_id) = string_field(value, "call_id") else {
        debug!("tool_call message without call_id");
        return Parsed::Malformed;
    };

    let (tool_name, tool_args, tool_result) = extract_tool_body(value);
    let Some(tool_name) = tool_name else {
        debug!(call_id = %call_id, "unable to determine tool name");
        return Parsed::Ignored;
    };

    match subtype {
        Some("completed") => {
            let (status, error) = completion_status(tool_result.as_ref(), value);
            Parsed::Update(StreamUpdate::ToolResult(ToolResultUpdate {
                call_id,
                tool_name,
                status,
                result: tool_result,
                error,
                timestamp: timestamp_field(value),
                session_id: session_id_field(value),
            }))
        }
        // `started` is the default for a bare tool_call message.
        _ => Parsed::Update(StreamUpdate::ToolCall(ToolCallUpdate {
            call_id,
            tool_name,
            tool_args: tool_args.unwrap_or(Value::Null),
            timestamp: timestamp_field(value),
            session_id: session_id_field(value),
        })),
    }
}

/// Direct tagged `tool_result` message (block dialect back-ends).
fn parse_tool_result(value: &Value) -> Parsed {
    let Some(call_id) = string_field(value, "call_id") else {
        debug!("tool_result message without call_id");
        return Parsed::Malformed;
    };
    let status = match value.get("status").and_then(Value::as_str) {
        Some("error") => ToolCallStatus::Error,
        _ => ToolCallStatus::Success,
    };
    Parsed::Update(StreamUpdate::ToolResult(ToolResultUpdate {
        call_id,
        tool_name: string_field(value, "tool_name").unwrap_or_else(|| "unknown".to_string()),
        status,
        result: value.get("result").cloned(),
        error: string_field(value, "error"),
        timestamp: timestamp_field(value),
        session_id: session_id_field(value),
    }))
}

/// Pull `(name, args, result)` out of a flat-dialect message, handling both
/// the direct `tool_name`/`tool_args` fields and `<x>ToolCall` wrappers.
fn extract_tool_body(value: &Value) -> (Option<String>, Option<Value>, Option<Value>) {
    if let Some(name) = string_field(value, "tool_name") {
        return (
            Some(name),
            value.get("tool_args").cloned(),
            value.get("result").cloned(),
        );
    }

    let Some(body) = value.get("tool_call").and_then(Value::as_object) else {
        return (None, None, None);
    };

    for (wrapper, name) in TOOL_CALL_WRAPPERS {
        if let Some(info) = body.get(*wrapper) {
            return (
                Some((*name).to_string()),
                info.get("args").cloned(),
                info.get("result").cloned(),
            );
        }
    }

    // MCP tool calls carry the provider and tool name inside their args.
    if let Some(info) = body.get("mcpToolCall") {
        let args = info.get("args");
        let provider = args
            .and_then(|a| a.get("providerIdentifier"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let tool = args
            .and_then(|a| a.get("toolName"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        return (
            Some(format!("mcp_{provider}_{tool}")),
            args.and_then(|a| a.get("args")).cloned(),
            info.get("result").cloned(),
        );
    }

    (None, None, None)
}

/// Derive success/error from a completed tool's result payload.
fn completion_status(result: Option<&Value>, value: &Value) -> (ToolCallStatus, Option<String>) {
    if value.get("is_error").and_then(Value::as_bool) == Some(true) {
        return (
            ToolCallStatus::Error,
            string_field(value, "error").or_else(|| Some("tool reported an error".to_string())),
        );
    }
    let Some(result) = result else {
        return (ToolCallStatus::Success, None);
    };
    if let Some(object) = result.as_object() {
        if let Some(error) = object.get("error") {
            return (ToolCallStatus::Error, Some(error.to_string()));
        }
        if let Some(status) = object.get("status").and_then(Value::as_str) {
            if matches!(status, "error" | "failed" | "rejected") {
                return (ToolCallStatus::Error, Some(status.to_string()));
            }
        }
    }
    (ToolCallStatus::Success, None)
}

fn parse_result(value: &Value) -> ResultUpdate {
    ResultUpdate {
        content: string_field(value, "result")
            .or_else(|| string_field(value, "content"))
            .unwrap_or_default(),
        session_id: session_id_field(value).unwrap_or_default(),
        cost: value
            .get("cost")
            .or_else(|| value.get("total_cost_usd"))
            .and_then(Value::as_f64),
        duration_ms: value.get("duration_ms").and_then(Value::as_u64),
        num_turns: value
            .get("num_turns")
            .and_then(Value::as_u64)
            .map(|n| n as u32),
        is_error: value
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        subtype: string_field(value, "subtype"),
    }
}

fn collect_text_blocks(value: &Value) -> Vec<String> {
    value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn session_id_field(value: &Value) -> Option<String> {
    string_field(value, "session_id").or_else(|| {
        value
            .get("session_context")
            .and_then(|c| c.get("session_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}

fn timestamp_field(value: &Value) -> Option<String> {
    value
        .get("timestamp")
        .or_else(|| value.get("timestamp_ms"))
        .map(|v| match v.as_str() {
            Some(s) => s.to_string(),
            None => v.to_string(),
        })
}

fn truncate_for_log(line: &str) -> &str {
    let end = line
        .char_indices()
        .nth(200)
        .map(|(i, _)| i)
        .unwrap_or(line.len());
    &line[..end]
}

/// In-flight record for one tool call within a single request.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub input: Value,
    pub status: ToolCallStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
}

/// Correlation table `call_id → record`. Calls may interleave and nest, so
/// completion is matched strictly by id, never by scope.
#[derive(Default)]
pub(crate) struct ToolCallTable {
    records: HashMap<String, ToolCallRecord>,
    order: Vec<String>,
}

impl ToolCallTable {
    pub(crate) fn on_started(&mut self, call_id: &str, tool_name: &str, input: &Value) {
        if self.records.contains_key(call_id) {
            warn!(call_id, "duplicate tool_call.started; replacing record");
        } else {
            self.order.push(call_id.to_string());
        }
        self.records.insert(
            call_id.to_string(),
            ToolCallRecord {
                tool_name: tool_name.to_string(),
                input: input.clone(),
                status: ToolCallStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                result: None,
            },
        );
    }

    /// Returns false for completions with no matching start; those are
    /// tolerated but logged by the caller.
    pub(crate) fn on_completed(
        &mut self,
        call_id: &str,
        status: ToolCallStatus,
        result: Option<&Value>,
    ) -> bool {
        match self.records.get_mut(call_id) {
            Some(record) => {
                record.status = status;
                record.finished_at = Some(Utc::now());
                record.result = result.cloned();
                true
            }
            None => false,
        }
    }

    /// Mark every still-running record as errored. Called at end of stream
    /// so the table is deterministic even when the agent dies mid-call.
    pub(crate) fn close_orphans(&mut self) -> Vec<String> {
        let mut orphans = Vec::new();
        for call_id in &self.order {
            if let Some(record) = self.records.get_mut(call_id) {
                if record.status == ToolCallStatus::Running {
                    record.status = ToolCallStatus::Error;
                    record.finished_at = Some(Utc::now());
                    orphans.push(call_id.clone());
                }
            }
        }
        if !orphans.is_empty() {
            warn!(count = orphans.len(), "closed orphaned tool calls: not completed");
        }
        orphans
    }

    /// Started tools in arrival order, as recorded on the response.
    pub(crate) fn invocations(&self) -> Vec<ToolInvocation> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .map(|record| ToolInvocation {
                name: record.tool_name.clone(),
                timestamp: Some(record.started_at.to_rfc3339()),
                input: record.input.clone(),
            })
            .collect()
    }

    pub(crate) fn get(&self, call_id: &str) -> Option<&ToolCallRecord> {
        self.records.get(call_id)
    }
}

/// Accumulates one request's stream: bounded message history, tool
/// correlation, turn counting, and final-result extraction.
pub(crate) struct StreamCollector {
    capacity: usize,
    messages: VecDeque<StreamUpdate>,
    assistant_parts: Vec<String>,
    pub(crate) assistant_turns: u32,
    pub(crate) parsing_errors: u64,
    pub(crate) result: Option<ResultUpdate>,
    pub(crate) tools: ToolCallTable,
}

impl StreamCollector {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            messages: VecDeque::new(),
            assistant_parts: Vec::new(),
            assistant_turns: 0,
            parsing_errors: 0,
            result: None,
            tools: ToolCallTable::default(),
        }
    }

    /// Parse one line, fold it into the collector state, and hand back the
    /// update for sink delivery.
    pub(crate) fn ingest(&mut self, line: &str) -> Option<StreamUpdate> {
        match parse_line(line) {
            Parsed::Update(update) => {
                self.observe(&update);
                Some(update)
            }
            Parsed::Ignored => None,
            Parsed::Malformed => {
                self.parsing_errors += 1;
                None
            }
        }
    }

    fn observe(&mut self, update: &StreamUpdate) {
        match update {
            StreamUpdate::Assistant(u) => {
                if let Some(content) = &u.content {
                    self.assistant_turns += 1;
                    self.assistant_parts.push(content.clone());
                }
            }
            StreamUpdate::ToolCall(u) => {
                self.tools.on_started(&u.call_id, &u.tool_name, &u.tool_args);
            }
            StreamUpdate::ToolResult(u) => {
                if !self.tools.on_completed(&u.call_id, u.status, u.result.as_ref()) {
                    debug!(call_id = %u.call_id, "completion for unknown tool call");
                }
            }
            StreamUpdate::Result(u) => {
                if self.result.is_some() {
                    warn!("agent emitted more than one result message; keeping the first");
                } else {
                    self.result = Some(u.clone());
                }
            }
            _ => {}
        }

        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(update.clone());
    }

    pub(crate) fn assistant_content(&self) -> String {
        self.assistant_parts.concat()
    }

    pub(crate) fn message_count(&self) -> usize {
        self.messages.len()
    }
}
