//! Tool-use policy enforcement and accounting.
//!
//! The monitor sits between the stream parser and the progress renderer:
//! every update carrying tool calls passes through [`ToolMonitor::validate`]
//! before the agent's tool execution is allowed to stand.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;
use tracing::debug;
use tracing::warn;
use wildmatch::WildMatch;

use crate::safety;

/// Tools that read or write files; their `path`/`file_path` argument must
/// stay inside the working directory.
const FILE_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "read_file",
    "create_file",
    "edit_file",
    "read",
    "write",
    "edit",
];

const SHELL_TOOLS: &[&str] = &["Bash", "bash", "shell"];

/// Tools whose misuse is severe enough that a denial cancels the current
/// run instead of letting it finish.
const CRITICAL_TOOLS: &[&str] = &["Task", "Read", "Write", "Edit"];

pub fn is_critical_tool(tool_name: &str) -> bool {
    CRITICAL_TOOLS
        .iter()
        .any(|t| t.eq_ignore_ascii_case(tool_name))
}

fn is_file_tool(tool_name: &str) -> bool {
    FILE_TOOLS.contains(&tool_name)
}

fn is_shell_tool(tool_name: &str) -> bool {
    SHELL_TOOLS.contains(&tool_name)
}

/// A recorded policy denial.
#[derive(Debug, Clone)]
pub struct SecurityViolation {
    pub kind: String,
    pub tool_name: String,
    pub user_id: i64,
    pub working_directory: PathBuf,
    pub reason: String,
}

/// Returned to the caller when a tool call is denied.
#[derive(Debug, Clone)]
pub struct ToolDenial {
    pub tool_name: String,
    pub reason: String,
    /// Critical denials must cancel the in-flight agent.
    pub critical: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ToolStats {
    pub total_calls: u64,
    pub by_tool: HashMap<String, u64>,
    pub unique_tools: usize,
    pub security_violations: usize,
}

#[derive(Debug, Clone, Default)]
pub struct UserToolSummary {
    pub user_id: i64,
    pub security_violations: usize,
    pub violation_kinds: Vec<String>,
}

#[derive(Default)]
struct MonitorState {
    tool_usage: HashMap<String, u64>,
    violations: Vec<SecurityViolation>,
}

/// Monitor and validate the agent's tool usage.
///
/// Allow/deny entries support glob-style patterns (`mcp_*`). An empty
/// allow-list means "no constraint from that side"; the deny-list always
/// applies.
pub struct ToolMonitor {
    allowed: Vec<String>,
    disallowed: Vec<String>,
    state: Mutex<MonitorState>,
}

impl ToolMonitor {
    pub fn new(allowed: Vec<String>, disallowed: Vec<String>) -> Self {
        Self {
            allowed,
            disallowed,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn allowed_tools(&self) -> &[String] {
        &self.allowed
    }

    /// Validate one tool call before its execution is accepted.
    ///
    /// Policy order: allow-list membership (when the list is non-empty),
    /// deny-list, file-path containment for file tools, dangerous-command
    /// screening for shell tools. Usage is counted for every call; denials
    /// are appended to the violation log.
    pub fn validate(
        &self,
        tool_name: &str,
        tool_input: &Value,
        working_directory: &Path,
        user_id: i64,
    ) -> Result<(), ToolDenial> {
        debug!(tool_name, user_id, "validating tool call");
        self.count_usage(tool_name);

        if !self.allowed.is_empty() && !matches_any(&self.allowed, tool_name) {
            return Err(self.deny(
                "disallowed_tool",
                tool_name,
                user_id,
                working_directory,
                format!("Tool not allowed: {tool_name}"),
            ));
        }

        if matches_any(&self.disallowed, tool_name) {
            return Err(self.deny(
                "explicitly_disallowed_tool",
                tool_name,
                user_id,
                working_directory,
                format!("Tool explicitly disallowed: {tool_name}"),
            ));
        }

        if is_file_tool(tool_name) {
            let path = tool_input
                .get("path")
                .or_else(|| tool_input.get("file_path"))
                .and_then(Value::as_str);
            let Some(path) = path else {
                return Err(self.deny(
                    "file_path_required",
                    tool_name,
                    user_id,
                    working_directory,
                    "File path required".to_string(),
                ));
            };
            if let Err(e) = safety::validate_path(path, working_directory) {
                return Err(self.deny(
                    "invalid_file_path",
                    tool_name,
                    user_id,
                    working_directory,
                    e.to_string(),
                ));
            }
        }

        if is_shell_tool(tool_name) {
            let command = tool_input
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if let Err(e) = safety::check_command(command) {
                return Err(self.deny(
                    "dangerous_command",
                    tool_name,
                    user_id,
                    working_directory,
                    e.to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn stats(&self) -> ToolStats {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        ToolStats {
            total_calls: state.tool_usage.values().sum(),
            by_tool: state.tool_usage.clone(),
            unique_tools: state.tool_usage.len(),
            security_violations: state.violations.len(),
        }
    }

    pub fn violations(&self) -> Vec<SecurityViolation> {
        match self.state.lock() {
            Ok(state) => state.violations.clone(),
            Err(poisoned) => poisoned.into_inner().violations.clone(),
        }
    }

    pub fn user_summary(&self, user_id: i64) -> UserToolSummary {
        let violations = self.violations();
        let mine: Vec<&SecurityViolation> =
            violations.iter().filter(|v| v.user_id == user_id).collect();
        let mut kinds: Vec<String> = mine.iter().map(|v| v.kind.clone()).collect();
        kinds.sort();
        kinds.dedup();
        UserToolSummary {
            user_id,
            security_violations: mine.len(),
            violation_kinds: kinds,
        }
    }

    pub fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.tool_usage.clear();
            state.violations.clear();
        }
    }

    fn count_usage(&self, tool_name: &str) {
        if let Ok(mut state) = self.state.lock() {
            *state.tool_usage.entry(tool_name.to_string()).or_insert(0) += 1;
        }
    }

    fn deny(
        &self,
        kind: &str,
        tool_name: &str,
        user_id: i64,
        working_directory: &Path,
        reason: String,
    ) -> ToolDenial {
        warn!(kind, tool_name, user_id, reason = %reason, "tool call denied");
        if let Ok(mut state) = self.state.lock() {
            state.violations.push(SecurityViolation {
                kind: kind.to_string(),
                tool_name: tool_name.to_string(),
                user_id,
                working_directory: working_directory.to_path_buf(),
                reason: reason.clone(),
            });
        }
        ToolDenial {
            tool_name: tool_name.to_string(),
            reason,
            critical: is_critical_tool(tool_name),
        }
    }
}

fn matches_any(patterns: &[String], tool_name: &str) -> bool {
    patterns
        .iter()
        .any(|pattern| WildMatch::new(pattern).matches(tool_name))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn workdir() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn empty_lists_allow_everything() {
        let monitor = ToolMonitor::new(vec![], vec![]);
        let wd = workdir();
        assert!(monitor.validate("WebSearch", &json!({}), wd.path(), 1).is_ok());
    }

    #[test]
    fn allow_list_excludes_unlisted_tools() {
        let monitor = ToolMonitor::new(vec!["Bash".to_string()], vec![]);
        let wd = workdir();
        let denial = monitor
            .validate("Write", &json!({"file_path": "x.txt"}), wd.path(), 1)
            .unwrap_err();
        assert!(denial.reason.contains("Tool not allowed: Write"));
        assert!(denial.critical);
    }

    #[test]
    fn deny_list_applies_even_without_allow_list() {
        let monitor = ToolMonitor::new(vec![], vec!["WebSearch".to_string()]);
        let wd = workdir();
        let denial = monitor
            .validate("WebSearch", &json!({}), wd.path(), 1)
            .unwrap_err();
        assert!(denial.reason.contains("explicitly disallowed"));
        assert!(!denial.critical);
    }

    #[test]
    fn allow_list_supports_glob_patterns() {
        let monitor = ToolMonitor::new(vec!["mcp_*".to_string()], vec![]);
        let wd = workdir();
        assert!(monitor
            .validate("mcp_github_search", &json!({}), wd.path(), 1)
            .is_ok());
        assert!(monitor.validate("Bash", &json!({}), wd.path(), 1).is_err());
    }

    #[test]
    fn file_tools_require_a_contained_path() {
        let monitor = ToolMonitor::new(vec![], vec![]);
        let wd = workdir();

        let denial = monitor
            .validate("Read", &json!({}), wd.path(), 1)
            .unwrap_err();
        assert_eq!(denial.reason, "File path required");

        let denial = monitor
            .validate("Read", &json!({"file_path": "/etc/passwd"}), wd.path(), 1)
            .unwrap_err();
        assert!(denial.reason.contains("path"));
        assert!(denial.critical);

        assert!(monitor
            .validate("Read", &json!({"file_path": "src/lib.rs"}), wd.path(), 1)
            .is_ok());
    }

    #[test]
    fn shell_tools_reject_dangerous_commands() {
        let monitor = ToolMonitor::new(vec![], vec![]);
        let wd = workdir();
        let denial = monitor
            .validate("Bash", &json!({"command": "sudo rm -rf /"}), wd.path(), 1)
            .unwrap_err();
        assert!(denial.reason.contains("dangerous command"));
        assert!(!denial.critical);

        assert!(monitor
            .validate("Bash", &json!({"command": "ls -la | head"}), wd.path(), 1)
            .is_ok());
    }

    #[test]
    fn usage_and_violations_are_accounted() {
        let monitor = ToolMonitor::new(vec!["Bash".to_string()], vec![]);
        let wd = workdir();
        let _ = monitor.validate("Bash", &json!({"command": "ls"}), wd.path(), 7);
        let _ = monitor.validate("Write", &json!({}), wd.path(), 7);

        let stats = monitor.stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.by_tool.get("Bash"), Some(&1));
        assert_eq!(stats.security_violations, 1);

        let summary = monitor.user_summary(7);
        assert_eq!(summary.security_violations, 1);
        assert_eq!(summary.violation_kinds, vec!["disallowed_tool"]);
    }

    #[test]
    fn critical_classification_is_case_insensitive() {
        assert!(is_critical_tool("Write"));
        assert!(is_critical_tool("write"));
        assert!(is_critical_tool("task"));
        assert!(!is_critical_tool("Bash"));
    }
}
