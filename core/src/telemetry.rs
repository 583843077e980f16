//! Per-tool-call span tracking.
//!
//! Tool calls interleave and nest, so spans live in a flat `call_id → span`
//! map and are closed by id, never by scope. A span opens when
//! `tool_call.started` arrives and ends when the matching completion is
//! observed; anything still open at end of request is closed as an error.

use std::collections::HashMap;

use courier_protocol::ToolCallStatus;
use serde_json::Value;
use tracing::Span;
use tracing::debug;
use tracing::info_span;
use tracing::warn;

/// Truncation limits for span attributes, per value.
const MAX_SIMPLE_VALUE: usize = 1024;
const MAX_COMPLEX_VALUE: usize = 2048;
const MAX_RESULT_PREVIEW: usize = 5 * 1024;

struct OpenToolSpan {
    span: Span,
    tool_name: String,
}

#[derive(Default)]
pub(crate) struct ToolSpanTracker {
    live: HashMap<String, OpenToolSpan>,
}

impl ToolSpanTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on_started(&mut self, call_id: &str, tool_name: &str, args: &Value) {
        let tool_type = if tool_name.starts_with("mcp_") {
            "mcp"
        } else {
            "builtin"
        };
        let span = info_span!(
            "agent_tool",
            tool.name = %tool_name,
            tool.call_id = %call_id,
            tool.kind = tool_type,
        );
        span.in_scope(|| {
            debug!(input = %format_args_preview(args), "tool call started");
        });

        if self
            .live
            .insert(
                call_id.to_string(),
                OpenToolSpan {
                    span,
                    tool_name: tool_name.to_string(),
                },
            )
            .is_some()
        {
            warn!(call_id, "duplicate tool span; previous span closed");
        }
    }

    pub(crate) fn on_completed(
        &mut self,
        call_id: &str,
        status: ToolCallStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) {
        let Some(open) = self.live.remove(call_id) else {
            debug!(call_id, "completion for a tool span that was never opened");
            return;
        };

        let preview = result.map(format_result_preview).unwrap_or_default();
        open.span.in_scope(|| match status {
            ToolCallStatus::Error => {
                warn!(
                    tool.name = %open.tool_name,
                    error = error.unwrap_or("unknown"),
                    result = %preview,
                    "tool call failed"
                );
            }
            _ => {
                debug!(tool.name = %open.tool_name, result = %preview, "tool call completed");
            }
        });
        // Dropping `open` ends the span.
    }

    /// End every span that never saw a completion. Called once per request,
    /// after the stream closes.
    pub(crate) fn close_orphans(&mut self) {
        for (call_id, open) in self.live.drain() {
            open.span.in_scope(|| {
                warn!(call_id = %call_id, tool.name = %open.tool_name, "tool span not completed");
            });
        }
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.live.len()
    }
}

/// Compact JSON rendering of tool arguments with per-value truncation:
/// strings and scalars are capped at 1 KiB, nested structures at 2 KiB.
fn format_args_preview(args: &Value) -> String {
    match args.as_object() {
        Some(object) => {
            let parts: Vec<String> = object
                .iter()
                .map(|(key, value)| {
                    let rendered = match value {
                        Value::String(s) => truncate(s, MAX_SIMPLE_VALUE),
                        Value::Null | Value::Bool(_) | Value::Number(_) => value.to_string(),
                        _ => truncate(&value.to_string(), MAX_COMPLEX_VALUE),
                    };
                    format!("{key}={rendered}")
                })
                .collect();
            parts.join(", ")
        }
        None => truncate(&args.to_string(), MAX_COMPLEX_VALUE),
    }
}

fn format_result_preview(result: &Value) -> String {
    let rendered = match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    truncate(&rendered, MAX_RESULT_PREVIEW)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let end = text
        .char_indices()
        .take_while(|(i, _)| *i < max)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    format!("{}...(truncated)", &text[..end])
}
