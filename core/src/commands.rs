//! Project commands and the chat callback wire format.
//!
//! Projects can ship reusable prompts as markdown files under
//! `<working_directory>/.claude/commands/<name>.md`; each becomes a chat
//! button whose callback data round-trips the command name. The file body
//! is used verbatim as the agent prompt.

use std::io;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;
use tracing::warn;

use crate::transport::InlineButton;
use crate::transport::InlineKeyboard;

/// Router branch for project-command callbacks.
pub const PROJECT_COMMAND_ACTION: &str = "pcmd";

const COMMANDS_SUBDIR: &str = ".claude/commands";

/// A command discovered in the project's commands directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectCommand {
    /// Filename stem; doubles as the callback parameter.
    pub name: String,
    pub file_path: PathBuf,
    /// First heading line of the file, with `#` markers stripped.
    pub description: String,
}

impl ProjectCommand {
    pub fn callback_data(&self) -> String {
        build_callback_data(PROJECT_COMMAND_ACTION, &self.name)
    }
}

/// `action:parameter`, ASCII, colon-delimited. The parameter is opaque to
/// the core.
pub fn build_callback_data(action: &str, parameter: &str) -> String {
    format!("{action}:{parameter}")
}

/// Split callback data into `(action, parameter)`. Only the first colon
/// delimits, so parameters may themselves contain colons.
pub fn parse_callback_data(data: &str) -> Option<(&str, &str)> {
    data.split_once(':')
}

/// The command name carried by a `pcmd` callback, if this is one.
pub fn parse_project_command(data: &str) -> Option<&str> {
    match parse_callback_data(data) {
        Some((PROJECT_COMMAND_ACTION, name)) => Some(name),
        _ => None,
    }
}

/// Scan the project's commands directory. Unreadable entries are skipped
/// with a warning; a missing directory is simply an empty list.
pub fn project_commands(working_directory: &Path) -> Vec<ProjectCommand> {
    let commands_dir = working_directory.join(COMMANDS_SUBDIR);
    if !commands_dir.is_dir() {
        debug!(
            path = %commands_dir.display(),
            "no project commands directory"
        );
        return Vec::new();
    }

    let entries = match std::fs::read_dir(&commands_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %commands_dir.display(), error = %e, "failed to read commands directory");
            return Vec::new();
        }
    };

    let mut commands: Vec<ProjectCommand> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("md"))
        .filter_map(|path| {
            let name = path.file_stem()?.to_str()?.to_string();
            let description = extract_description(&path);
            Some(ProjectCommand {
                name,
                file_path: path,
                description,
            })
        })
        .collect();

    commands.sort_by(|a, b| a.name.cmp(&b.name));
    commands
}

/// Full markdown body of the command file; used as the agent prompt.
pub fn read_command_prompt(command: &ProjectCommand) -> io::Result<String> {
    std::fs::read_to_string(&command.file_path)
}

pub fn find_command<'a>(
    commands: &'a [ProjectCommand],
    name: &str,
) -> Option<&'a ProjectCommand> {
    commands.iter().find(|c| c.name == name)
}

/// Inline keyboard with one button per command, two per row by default.
pub fn commands_keyboard(commands: &[ProjectCommand], columns: usize) -> InlineKeyboard {
    let buttons: Vec<InlineButton> = commands
        .iter()
        .map(|command| InlineButton {
            label: format!("/{}", command.name),
            callback_data: command.callback_data(),
        })
        .collect();
    InlineKeyboard::grid(buttons, columns)
}

pub fn format_commands_list(commands: &[ProjectCommand]) -> String {
    if commands.is_empty() {
        return "No project commands found.".to_string();
    }
    commands
        .iter()
        .map(|command| format!("• `/{}` — {}", command.name, command.description))
        .collect::<Vec<_>>()
        .join("\n")
}

fn extract_description(path: &Path) -> String {
    let fallback = || {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().replace('-', " "))
            .unwrap_or_default()
    };
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let first_line = contents.lines().next().unwrap_or_default().trim();
            let stripped = first_line.trim_start_matches('#').trim();
            if stripped.is_empty() {
                fallback()
            } else {
                stripped.to_string()
            }
        }
        Err(_) => fallback(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn write_command(root: &Path, name: &str, body: &str) {
        let dir = root.join(COMMANDS_SUBDIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{name}.md")), body).unwrap();
    }

    #[test]
    fn callback_data_round_trips_command_names() {
        for name in ["deploy", "run-tests", "fix_ci", "x"] {
            let data = build_callback_data(PROJECT_COMMAND_ACTION, name);
            assert_eq!(parse_project_command(&data), Some(name));
        }
    }

    #[test]
    fn parameters_may_contain_colons() {
        assert_eq!(
            parse_callback_data("session:abc:def"),
            Some(("session", "abc:def"))
        );
        assert_eq!(parse_callback_data("no-colon"), None);
    }

    #[test]
    fn foreign_actions_are_not_project_commands() {
        assert_eq!(parse_project_command("other:deploy"), None);
    }

    #[test]
    fn scan_finds_sorted_commands_with_descriptions() {
        let root = TempDir::new().unwrap();
        write_command(root.path(), "deploy", "# Deploy to staging\n\nRun the deploy.");
        write_command(root.path(), "audit", "Check dependencies for advisories");
        std::fs::write(
            root.path().join(COMMANDS_SUBDIR).join("notes.txt"),
            "not a command",
        )
        .unwrap();

        let commands = project_commands(root.path());
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].name, "audit");
        assert_eq!(commands[0].description, "Check dependencies for advisories");
        assert_eq!(commands[1].name, "deploy");
        assert_eq!(commands[1].description, "Deploy to staging");
    }

    #[test]
    fn missing_directory_yields_no_commands() {
        let root = TempDir::new().unwrap();
        assert!(project_commands(root.path()).is_empty());
    }

    #[test]
    fn command_body_is_the_prompt() {
        let root = TempDir::new().unwrap();
        write_command(root.path(), "deploy", "# Deploy\n\nShip it.");
        let commands = project_commands(root.path());
        let prompt = read_command_prompt(&commands[0]).unwrap();
        assert!(prompt.ends_with("Ship it."));
    }

    #[test]
    fn keyboard_uses_callback_data() {
        let root = TempDir::new().unwrap();
        write_command(root.path(), "a", "# A");
        write_command(root.path(), "b", "# B");
        write_command(root.path(), "c", "# C");

        let commands = project_commands(root.path());
        let keyboard = commands_keyboard(&commands, 2);
        assert_eq!(keyboard.rows.len(), 2);
        assert_eq!(keyboard.rows[0][0].label, "/a");
        assert_eq!(keyboard.rows[0][0].callback_data, "pcmd:a");

        let listing = format_commands_list(&commands);
        assert!(listing.contains("`/a`"));
    }
}
