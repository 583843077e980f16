use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use courier_common::elapsed::format_duration;
use courier_protocol::StreamUpdate;
use courier_protocol::ThinkingPhase;
use courier_protocol::ToolCallStatus;
use owo_colors::OwoColorize;
use owo_colors::Style;

const MAX_OUTPUT_LINES_FOR_TOOL_RESULT: usize = 20;

/// Prints stream updates as timestamped terminal lines, pairing tool starts
/// with their completions by call id so each completion can report its
/// duration.
pub(crate) struct EventProcessor {
    call_id_to_tool: HashMap<String, ToolCallBegin>,

    // To ensure that --color=never is respected, ANSI escapes _must_ be
    // added using .style() with one of these fields.
    bold: Style,
    dimmed: Style,
    magenta: Style,
    red: Style,
    green: Style,
}

struct ToolCallBegin {
    invocation: String,
    start_time: Instant,
}

macro_rules! ts_println {
    ($($arg:tt)*) => {{
        let now = Utc::now();
        let formatted = now.format("%Y-%m-%dT%H:%M:%S").to_string();
        print!("[{}] ", formatted);
        println!($($arg)*);
    }};
}

impl EventProcessor {
    pub(crate) fn create_with_ansi(with_ansi: bool) -> Self {
        let call_id_to_tool = HashMap::new();
        if with_ansi {
            Self {
                call_id_to_tool,
                bold: Style::new().bold(),
                dimmed: Style::new().dimmed(),
                magenta: Style::new().magenta(),
                red: Style::new().red(),
                green: Style::new().green(),
            }
        } else {
            Self {
                call_id_to_tool,
                bold: Style::new(),
                dimmed: Style::new(),
                magenta: Style::new(),
                red: Style::new(),
                green: Style::new(),
            }
        }
    }

    pub(crate) fn process_update(&mut self, update: StreamUpdate) {
        match update {
            StreamUpdate::System(u) => {
                let model = u.model.unwrap_or_else(|| "agent".to_string());
                let session = u.session_id.unwrap_or_default();
                ts_println!(
                    "{} model {} session {}",
                    u.subtype.unwrap_or_else(|| "system".to_string()).style(self.dimmed),
                    model.style(self.bold),
                    session
                );
            }
            StreamUpdate::User(u) => {
                if let Some(content) = u.content {
                    ts_println!("{}", content.style(self.dimmed));
                }
            }
            StreamUpdate::Thinking(u) => {
                // Deltas are partial fragments; only completed thoughts get
                // a line of their own.
                if u.subtype == ThinkingPhase::Completed && !u.content.is_empty() {
                    ts_println!("{} {}", "thinking".style(self.magenta), u.content.style(self.dimmed));
                }
            }
            StreamUpdate::Assistant(u) => {
                if let Some(content) = u.content {
                    let prefix = "agent:".style(self.bold);
                    ts_println!("{prefix} {content}");
                }
            }
            StreamUpdate::ToolCall(u) => {
                let args = serde_json::to_string(&u.tool_args).unwrap_or_default();
                let invocation = if args.is_empty() || args == "null" {
                    format!("{}()", u.tool_name)
                } else {
                    format!("{}({args})", u.tool_name)
                };
                self.call_id_to_tool.insert(
                    u.call_id.clone(),
                    ToolCallBegin {
                        invocation: invocation.clone(),
                        start_time: Instant::now(),
                    },
                );
                ts_println!("{} {}", "tool".style(self.magenta), invocation.style(self.bold));
            }
            StreamUpdate::ToolResult(u) => {
                let info = self.call_id_to_tool.remove(&u.call_id);
                let (duration, invocation) = match info {
                    Some(begin) => (
                        format!(" in {}", format_duration(begin.start_time.elapsed())),
                        begin.invocation,
                    ),
                    None => (String::new(), format!("tool('{}')", u.call_id)),
                };

                let (status_str, style) = match u.status {
                    ToolCallStatus::Error => ("failed", self.red),
                    _ => ("success", self.green),
                };
                let title = format!("{invocation} {status_str}{duration}:");
                ts_println!("{}", title.style(style));

                if let Some(result) = u.result {
                    let pretty = match &result {
                        serde_json::Value::String(s) => s.clone(),
                        other => serde_json::to_string_pretty(other)
                            .unwrap_or_else(|_| other.to_string()),
                    };
                    for line in pretty.lines().take(MAX_OUTPUT_LINES_FOR_TOOL_RESULT) {
                        println!("{}", line.style(self.dimmed));
                    }
                }
            }
            StreamUpdate::Result(u) => {
                let title = format!(
                    "result session={} cost=${:.4} turns={}",
                    u.session_id,
                    u.cost.unwrap_or(0.0),
                    u.num_turns.unwrap_or(0)
                );
                ts_println!("{}", title.style(self.dimmed));
            }
            StreamUpdate::Error(u) => {
                let prefix = "ERROR:".style(self.red);
                ts_println!("{prefix} {}", u.message);
            }
        }
    }
}
