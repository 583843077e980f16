//! Pre-execution screening of user- and agent-supplied paths and commands.
//!
//! Everything here is pure with respect to process state; the only I/O is
//! `std::fs` metadata lookups needed to follow symlinks.

use std::io;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::error::CourierErr;
use crate::error::Result;
use crate::error::ViolationKind;

/// Substrings that mark a shell command as dangerous regardless of context.
/// Common shell composition (`|`, `>`, `&&`, `$()`) is deliberately allowed;
/// this list targets privilege escalation, filesystem destruction, raw disk
/// writes, and the classic fork bomb.
pub const DANGEROUS_COMMAND_PATTERNS: &[&str] = &[
    "sudo",
    "rm -rf /",
    "chmod 777 /",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

/// Filenames reserved by the host OS (Windows device names). Checked on all
/// platforms: a repository containing `NUL.txt` is a portability hazard
/// wherever it is created.
const RESERVED_FILENAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Reject commands containing any known-dangerous pattern. Matching is
/// case-insensitive and substring-based: an embedded `sudo` inside a longer
/// pipeline is still a rejection.
pub fn check_command(command: &str) -> Result<()> {
    let lowered = command.to_lowercase();
    for pattern in DANGEROUS_COMMAND_PATTERNS {
        if lowered.contains(pattern) {
            return Err(CourierErr::PolicyViolation {
                kind: ViolationKind::DangerousCommand,
                reason: format!("dangerous command pattern detected: {pattern}"),
            });
        }
    }
    Ok(())
}

/// Resolve `candidate` against `approved_root` and require the result to be
/// the root itself or a descendant of it. Symlinks are followed; `..`
/// segments that climb out of the root are rejected even when the target
/// does not exist yet.
pub fn validate_path(candidate: impl AsRef<Path>, approved_root: &Path) -> Result<PathBuf> {
    let candidate = candidate.as_ref();

    for component in candidate.components() {
        if let Component::Normal(part) = component {
            let name = part.to_string_lossy();
            if name.chars().any(char::is_control) {
                return Err(CourierErr::PolicyViolation {
                    kind: ViolationKind::FilenameInvalid,
                    reason: "filename contains control characters".to_string(),
                });
            }
            if is_reserved_filename(&name) {
                return Err(CourierErr::PolicyViolation {
                    kind: ViolationKind::FilenameInvalid,
                    reason: format!("filename is reserved on the host OS: {name}"),
                });
            }
        }
    }

    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        approved_root.join(candidate)
    };

    let resolved = resolve_existing_prefix(&joined).map_err(|e| CourierErr::PolicyViolation {
        kind: ViolationKind::PathEscape,
        reason: format!("failed to resolve path: {e}"),
    })?;
    let root = resolve_existing_prefix(approved_root).map_err(|e| CourierErr::PolicyViolation {
        kind: ViolationKind::PathEscape,
        reason: format!("failed to resolve approved root: {e}"),
    })?;

    if resolved == root || resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(CourierErr::PolicyViolation {
            kind: ViolationKind::PathEscape,
            reason: format!(
                "path escapes the approved directory: {}",
                resolved.display()
            ),
        })
    }
}

/// Canonicalize the deepest existing ancestor of `path`, then apply the
/// remaining components lexically. This follows symlinks for everything that
/// exists while still resolving paths whose tail has not been created yet
/// (a `Write` tool creating a new file).
fn resolve_existing_prefix(path: &Path) -> io::Result<PathBuf> {
    if let Ok(resolved) = path.canonicalize() {
        return Ok(resolved);
    }

    let mut base = path;
    while !base.exists() {
        base = base.parent().unwrap_or(Path::new("/"));
    }
    let mut resolved = base.canonicalize()?;

    let tail = path
        .strip_prefix(base)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    for component in tail.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(resolved)
}

fn is_reserved_filename(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    RESERVED_FILENAMES
        .iter()
        .any(|reserved| stem.eq_ignore_ascii_case(reserved))
}
