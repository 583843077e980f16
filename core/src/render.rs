//! Throttled progress rendering into a single chat message.
//!
//! The renderer is a state machine over the stream: it keeps a per-request
//! tool journal, a rolling todo board, and a current activity line, and
//! re-edits one chat message with the composed body. It must not reorder
//! events and it never raises; transport failures are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use courier_protocol::StreamUpdate;
use courier_protocol::ThinkingPhase;
use courier_protocol::ToolCallStatus;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::sink::StreamSink;
use crate::transport::ChatId;
use crate::transport::ChatTransport;
use crate::transport::MessageRef;
use crate::transport::ParseMode;

/// Minimum interval between message edits. Command-triggered runs refresh
/// faster than free-text prompts; important updates (tool results, final
/// result, errors) bypass the window entirely.
pub const COMMAND_EDIT_INTERVAL: Duration = Duration::from_millis(800);
pub const FREE_TEXT_EDIT_INTERVAL: Duration = Duration::from_millis(1500);

const MAX_PARAM_VALUE_CHARS: usize = 30;
const MAX_PARAMS_CHARS: usize = 50;
const MAX_CONTENT_PREVIEW_CHARS: usize = 150;

/// The tool whose results carry the rolling todo list.
const TODO_TOOL_NAME: &str = "updatetodos";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Command,
    FreeText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

impl TodoStatus {
    /// Wire statuses look like `TODO_STATUS_IN_PROGRESS`; match loosely.
    fn parse(raw: &str) -> Self {
        let lowered = raw.to_lowercase();
        if lowered.contains("completed") || lowered.contains("done") {
            TodoStatus::Completed
        } else if lowered.contains("in_progress") || lowered.contains("inprogress") {
            TodoStatus::InProgress
        } else {
            TodoStatus::Pending
        }
    }

    fn checkbox(self) -> &'static str {
        match self {
            TodoStatus::Pending => "[ ]",
            TodoStatus::InProgress => "[~]",
            TodoStatus::Completed => "[x]",
        }
    }
}

#[derive(Debug, Clone)]
struct TodoItem {
    id: String,
    content: String,
    status: TodoStatus,
}

struct JournalEntry {
    name: String,
    params: String,
    status: ToolCallStatus,
}

impl JournalEntry {
    fn icon(&self) -> &'static str {
        match self.status {
            ToolCallStatus::Running => "⏳",
            ToolCallStatus::Success => "✅",
            ToolCallStatus::Error => "❌",
        }
    }

    fn status_suffix(&self) -> &'static str {
        match self.status {
            ToolCallStatus::Running => " [running]",
            ToolCallStatus::Success => "",
            ToolCallStatus::Error => " [failed]",
        }
    }
}

pub struct ProgressRenderer {
    transport: Arc<dyn ChatTransport>,
    chat: ChatId,
    heading: String,
    mode: RenderMode,
    /// When false, each todo payload replaces the board instead of merging
    /// into it.
    merge_todos: bool,
    message: Option<MessageRef>,
    journal: HashMap<String, JournalEntry>,
    journal_order: Vec<String>,
    todos: Vec<TodoItem>,
    thinking_thoughts: String,
    activity: String,
    last_edit: Option<Instant>,
    last_body: String,
    finished: bool,
}

impl ProgressRenderer {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        chat: ChatId,
        heading: impl Into<String>,
        mode: RenderMode,
    ) -> Self {
        Self {
            transport,
            chat,
            heading: heading.into(),
            mode,
            merge_todos: true,
            message: None,
            journal: HashMap::new(),
            journal_order: Vec::new(),
            todos: Vec::new(),
            thinking_thoughts: String::new(),
            activity: "Starting…".to_string(),
            last_edit: None,
            last_body: String::new(),
            finished: false,
        }
    }

    pub fn with_todo_merge(mut self, merge: bool) -> Self {
        self.merge_todos = merge;
        self
    }

    /// Fold one update into the rendered state and maybe edit the chat
    /// message. Never returns an error.
    pub async fn observe(&mut self, update: &StreamUpdate) {
        if self.finished {
            return;
        }
        let important = update.is_important();
        let render = self.apply(update);

        if matches!(update, StreamUpdate::Result(_)) {
            self.finish().await;
            return;
        }
        if render {
            self.maybe_edit(important).await;
        }
    }

    /// Delete the progress message; the formatted final content is sent
    /// separately by the chat glue.
    pub async fn finish(&mut self) {
        self.finished = true;
        if let Some(message) = self.message.take() {
            if let Err(e) = self.transport.delete_message(&message).await {
                debug!(error = %e, "failed to delete progress message");
            }
        }
    }

    /// Returns whether the update warrants a re-render at all.
    fn apply(&mut self, update: &StreamUpdate) -> bool {
        match update {
            StreamUpdate::System(u) => {
                if u.subtype.as_deref() == Some("init") {
                    let model = u.model.as_deref().unwrap_or("agent");
                    self.activity = format!("🚀 Starting {model} with {} tools", u.tools.len());
                    return true;
                }
                false
            }
            StreamUpdate::Thinking(u) => match u.subtype {
                // Deltas accumulate silently; rendering each one would
                // flicker the message.
                ThinkingPhase::Delta => {
                    self.thinking_thoughts.push_str(&u.content);
                    false
                }
                ThinkingPhase::Completed => {
                    self.activity = "💭 Thinking…".to_string();
                    true
                }
            },
            StreamUpdate::Assistant(u) => {
                if !u.tool_calls.is_empty() {
                    self.activity = "🤔 Processing…".to_string();
                } else if let Some(content) = &u.content {
                    let preview = truncate_chars(content, MAX_CONTENT_PREVIEW_CHARS);
                    self.activity = format!("🤖 Working…\n_{}_", escape_markdown(&preview));
                }
                true
            }
            StreamUpdate::ToolCall(u) => {
                if !self.journal.contains_key(&u.call_id) {
                    self.journal_order.push(u.call_id.clone());
                }
                self.journal.insert(
                    u.call_id.clone(),
                    JournalEntry {
                        name: format_tool_name(&u.tool_name),
                        params: format_tool_params(&u.tool_args),
                        status: ToolCallStatus::Running,
                    },
                );
                self.activity = "🤔 Processing…".to_string();
                true
            }
            StreamUpdate::ToolResult(u) => {
                if let Some(entry) = self.journal.get_mut(&u.call_id) {
                    entry.status = u.status;
                }
                if u.tool_name.eq_ignore_ascii_case(TODO_TOOL_NAME) {
                    if let Some(payload) = &u.result {
                        self.apply_todos(payload);
                    }
                }
                true
            }
            StreamUpdate::Error(u) => {
                self.activity = format!("❌ Error: {}", escape_markdown(&u.message));
                true
            }
            StreamUpdate::User(_) | StreamUpdate::Result(_) => false,
        }
    }

    fn apply_todos(&mut self, payload: &Value) {
        let items = normalize_todo_payload(payload);
        if items.is_empty() {
            return;
        }
        if !self.merge_todos {
            self.todos = items;
            return;
        }
        for item in items {
            match self.todos.iter_mut().find(|t| t.id == item.id) {
                Some(existing) => *existing = item,
                None => self.todos.push(item),
            }
        }
    }

    fn compose(&self) -> String {
        let mut sections: Vec<String> = Vec::new();
        if !self.heading.is_empty() {
            sections.push(self.heading.clone());
        }

        if !self.todos.is_empty() {
            let mut lines = vec!["📋 TODO".to_string()];
            for todo in &self.todos {
                let content = escape_markdown(&todo.content);
                let line = if todo.status == TodoStatus::Completed {
                    format!("- {} ~{content}~", todo.status.checkbox())
                } else {
                    format!("- {} {content}", todo.status.checkbox())
                };
                lines.push(line);
            }
            sections.push(lines.join("\n"));
        }

        if !self.journal_order.is_empty() {
            let lines: Vec<String> = self
                .journal_order
                .iter()
                .filter_map(|id| self.journal.get(id))
                .map(|entry| {
                    format!(
                        "{} {}{}{}",
                        entry.icon(),
                        escape_markdown(&entry.name),
                        escape_markdown(&entry.params),
                        entry.status_suffix()
                    )
                })
                .collect();
            sections.push(lines.join("\n"));
        }

        if !self.activity.is_empty() {
            sections.push(self.activity.clone());
        }
        sections.join("\n\n")
    }

    async fn maybe_edit(&mut self, important: bool) {
        let body = self.compose();
        if body == self.last_body {
            return;
        }
        let interval = match self.mode {
            RenderMode::Command => COMMAND_EDIT_INTERVAL,
            RenderMode::FreeText => FREE_TEXT_EDIT_INTERVAL,
        };
        if !important {
            if let Some(last) = self.last_edit {
                if last.elapsed() < interval {
                    return;
                }
            }
        }

        match &self.message {
            None => match self
                .transport
                .send_message(self.chat, &body, ParseMode::Markdown, None)
                .await
            {
                Ok(message) => self.message = Some(message),
                Err(e) => {
                    debug!(error = %e, "failed to send progress message");
                    return;
                }
            },
            Some(message) => {
                if let Err(e) = self
                    .transport
                    .edit_message(message, &body, ParseMode::Markdown)
                    .await
                {
                    debug!(error = %e, "failed to edit progress message");
                    return;
                }
            }
        }
        self.last_body = body;
        self.last_edit = Some(Instant::now());
    }
}

/// Adapter so a renderer can stand directly behind the facade's stream
/// sink.
pub struct RendererSink {
    renderer: Mutex<ProgressRenderer>,
}

impl RendererSink {
    pub fn new(renderer: ProgressRenderer) -> Arc<Self> {
        Arc::new(Self {
            renderer: Mutex::new(renderer),
        })
    }

    pub async fn finish(&self) {
        self.renderer.lock().await.finish().await;
    }
}

#[async_trait]
impl StreamSink for RendererSink {
    async fn on_update(&self, update: &StreamUpdate) -> Result<()> {
        self.renderer.lock().await.observe(update).await;
        Ok(())
    }
}

/// `mcp_provider_tool` → `Provider:Tool`; other names are title-cased.
fn format_tool_name(tool_name: &str) -> String {
    if let Some(rest) = tool_name.strip_prefix("mcp_") {
        if let Some((provider, name)) = rest.split_once('_') {
            return format!("{}:{}", title_case(provider), title_case(name));
        }
    }
    title_case(tool_name)
}

fn title_case(text: &str) -> String {
    text.split(['_', '-', ' '])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compact `(k1="v1", k2=3)` rendering with per-value and total truncation.
fn format_tool_params(args: &Value) -> String {
    let Some(object) = args.as_object() else {
        return "()".to_string();
    };
    if object.is_empty() {
        return "()".to_string();
    }

    let parts: Vec<String> = object
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => {
                format!("{key}=\"{}\"", truncate_chars(s, MAX_PARAM_VALUE_CHARS))
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => format!("{key}={value}"),
            other => format!(
                "{key}={}",
                truncate_chars(&other.to_string(), MAX_PARAM_VALUE_CHARS)
            ),
        })
        .collect();
    let joined = truncate_chars(&parts.join(", "), MAX_PARAMS_CHARS);
    format!("({joined})")
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max).collect();
    format!("{kept}...")
}

/// Escape characters the chat platform's markdown parser trips on.
fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '\\' | '_' | '*' | '`' | '[') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Todo payloads arrive as a list, as `{todos: [...]}`/`{items: [...]}`, or
/// as a single item. Anything else normalizes to empty.
fn normalize_todo_payload(payload: &Value) -> Vec<TodoItem> {
    let items: Vec<&Value> = if let Some(list) = payload.as_array() {
        list.iter().collect()
    } else if let Some(list) = payload
        .get("todos")
        .or_else(|| payload.get("items"))
        .and_then(Value::as_array)
    {
        list.iter().collect()
    } else if payload.get("id").is_some() {
        vec![payload]
    } else {
        Vec::new()
    };

    items
        .into_iter()
        .filter_map(|item| {
            let id = item
                .get("id")
                .and_then(Value::as_str)
                .or_else(|| item.get("content").and_then(Value::as_str))?
                .to_string();
            let content = item
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or(&id)
                .to_string();
            let status = item
                .get("status")
                .and_then(Value::as_str)
                .map(TodoStatus::parse)
                .unwrap_or(TodoStatus::Pending);
            Some(TodoItem {
                id,
                content,
                status,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use courier_protocol::ResultUpdate;
    use courier_protocol::SystemUpdate;
    use courier_protocol::ToolCallUpdate;
    use courier_protocol::ToolResultUpdate;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use crate::transport::InlineKeyboard;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Send(String),
        Edit(String),
        Delete,
    }

    #[derive(Default)]
    struct MockTransport {
        ops: StdMutex<Vec<Op>>,
    }

    #[async_trait]
    impl ChatTransport for MockTransport {
        async fn send_message(
            &self,
            chat: ChatId,
            text: &str,
            _parse_mode: ParseMode,
            _reply_markup: Option<InlineKeyboard>,
        ) -> anyhow::Result<MessageRef> {
            self.ops.lock().unwrap().push(Op::Send(text.to_string()));
            Ok(MessageRef {
                chat,
                message_id: 1,
            })
        }

        async fn edit_message(
            &self,
            _message: &MessageRef,
            text: &str,
            _parse_mode: ParseMode,
        ) -> anyhow::Result<()> {
            self.ops.lock().unwrap().push(Op::Edit(text.to_string()));
            Ok(())
        }

        async fn delete_message(&self, _message: &MessageRef) -> anyhow::Result<()> {
            self.ops.lock().unwrap().push(Op::Delete);
            Ok(())
        }

        async fn send_document(
            &self,
            _chat: ChatId,
            _bytes: Vec<u8>,
            _filename: &str,
            _caption: Option<&str>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn renderer(transport: &Arc<MockTransport>) -> ProgressRenderer {
        ProgressRenderer::new(
            Arc::clone(transport) as Arc<dyn ChatTransport>,
            ChatId(7),
            "▶️ run in /work",
            RenderMode::Command,
        )
    }

    fn tool_call(call_id: &str, name: &str, args: Value) -> StreamUpdate {
        StreamUpdate::ToolCall(ToolCallUpdate {
            call_id: call_id.to_string(),
            tool_name: name.to_string(),
            tool_args: args,
            timestamp: None,
            session_id: None,
        })
    }

    fn tool_result(call_id: &str, name: &str, status: ToolCallStatus, result: Option<Value>) -> StreamUpdate {
        StreamUpdate::ToolResult(ToolResultUpdate {
            call_id: call_id.to_string(),
            tool_name: name.to_string(),
            status,
            result,
            error: None,
            timestamp: None,
            session_id: None,
        })
    }

    #[tokio::test]
    async fn journal_tracks_tool_lifecycle() {
        let transport = Arc::new(MockTransport::default());
        let mut renderer = renderer(&transport);

        renderer
            .observe(&tool_call("A", "read", json!({"path": "src/very/long/path/to/some/file.rs"})))
            .await;
        renderer
            .observe(&tool_result("A", "read", ToolCallStatus::Success, None))
            .await;

        let ops = transport.ops.lock().unwrap().clone();
        assert!(matches!(ops[0], Op::Send(_)));
        let Op::Edit(body) = &ops[1] else {
            panic!("expected edit, got {ops:?}");
        };
        assert!(body.contains("✅ Read"));
        assert!(body.contains("..."), "long param values are truncated");
    }

    #[tokio::test]
    async fn unimportant_updates_are_throttled() {
        let transport = Arc::new(MockTransport::default());
        let mut renderer = renderer(&transport);

        // First render sends the message; immediately after, a second
        // non-important update inside the window must not edit.
        renderer.observe(&tool_call("A", "read", json!({}))).await;
        renderer.observe(&tool_call("B", "grep", json!({}))).await;

        let ops = transport.ops.lock().unwrap().clone();
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0], Op::Send(_)));
    }

    #[tokio::test]
    async fn important_updates_bypass_the_throttle() {
        let transport = Arc::new(MockTransport::default());
        let mut renderer = renderer(&transport);

        renderer.observe(&tool_call("A", "read", json!({}))).await;
        renderer
            .observe(&tool_result("A", "read", ToolCallStatus::Error, None))
            .await;

        let ops = transport.ops.lock().unwrap().clone();
        assert_eq!(ops.len(), 2);
        let Op::Edit(body) = &ops[1] else {
            panic!("expected edit");
        };
        assert!(body.contains("❌ Read"));
        assert!(body.contains("[failed]"));
    }

    #[tokio::test]
    async fn todo_results_update_the_board_and_merge() {
        let transport = Arc::new(MockTransport::default());
        let mut renderer = renderer(&transport);

        let payload = json!({"todos": [
            {"id": "1", "content": "explore the codebase", "status": "TODO_STATUS_COMPLETED"},
            {"id": "2", "content": "write the fix", "status": "TODO_STATUS_IN_PROGRESS"}
        ]});
        renderer
            .observe(&tool_result("T1", "updateTodos", ToolCallStatus::Success, Some(payload)))
            .await;

        let update = json!([{"id": "2", "content": "write the fix", "status": "TODO_STATUS_COMPLETED"}]);
        renderer
            .observe(&tool_result("T2", "updatetodos", ToolCallStatus::Success, Some(update)))
            .await;

        let ops = transport.ops.lock().unwrap().clone();
        let Op::Edit(body) = ops.last().unwrap() else {
            panic!("expected edit");
        };
        assert!(body.contains("📋 TODO"));
        assert!(body.contains("[x] ~explore the codebase~"));
        assert!(body.contains("[x] ~write the fix~"));
        assert_eq!(renderer.todos.len(), 2);
    }

    #[tokio::test]
    async fn final_result_deletes_the_progress_message() {
        let transport = Arc::new(MockTransport::default());
        let mut renderer = renderer(&transport);

        renderer.observe(&tool_call("A", "read", json!({}))).await;
        renderer
            .observe(&StreamUpdate::Result(ResultUpdate::default()))
            .await;

        let ops = transport.ops.lock().unwrap().clone();
        assert_eq!(ops.last(), Some(&Op::Delete));

        // Late updates after the final result are ignored.
        renderer.observe(&tool_call("B", "grep", json!({}))).await;
        assert_eq!(transport.ops.lock().unwrap().len(), ops.len());
    }

    #[tokio::test]
    async fn thinking_deltas_accumulate_without_rendering() {
        let transport = Arc::new(MockTransport::default());
        let mut renderer = renderer(&transport);

        for chunk in ["first ", "second"] {
            renderer
                .observe(&StreamUpdate::Thinking(courier_protocol::ThinkingUpdate {
                    content: chunk.to_string(),
                    subtype: ThinkingPhase::Delta,
                    timestamp: None,
                    session_id: None,
                }))
                .await;
        }
        assert_eq!(renderer.thinking_thoughts, "first second");
        assert!(transport.ops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn system_init_announces_the_model() {
        let transport = Arc::new(MockTransport::default());
        let mut renderer = renderer(&transport);
        renderer
            .observe(&StreamUpdate::System(SystemUpdate {
                subtype: Some("init".to_string()),
                model: Some("sonnet".to_string()),
                tools: vec!["Read".to_string(), "Bash".to_string()],
                ..Default::default()
            }))
            .await;
        let ops = transport.ops.lock().unwrap().clone();
        let Op::Send(body) = &ops[0] else {
            panic!("expected send");
        };
        assert!(body.contains("Starting sonnet with 2 tools"));
    }

    #[test]
    fn tool_names_format_for_humans() {
        assert_eq!(format_tool_name("read"), "Read");
        assert_eq!(format_tool_name("web_search"), "Web Search");
        assert_eq!(format_tool_name("mcp_github_search"), "Github:Search");
    }

    #[test]
    fn params_are_truncated_at_both_levels() {
        let args = json!({"path": "a-very-long-path-that-keeps-going/and/going/forever.txt"});
        let rendered = format_tool_params(&args);
        assert!(rendered.chars().count() <= MAX_PARAMS_CHARS + "()".len() + "...".len());
        assert!(rendered.starts_with("(path=\""));
    }

    #[test]
    fn markdown_special_characters_are_escaped() {
        assert_eq!(escape_markdown("a_b*c`d[e"), "a\\_b\\*c\\`d\\[e");
    }
}
