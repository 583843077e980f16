//! Agent back-ends.
//!
//! Three variants share one contract and one process engine; they differ in
//! argument template, binary discovery, and what their result dialect
//! reports. The variant is chosen once at start-up from configuration and
//! nothing downstream introspects it.

mod alternate;
mod primary;
mod sdk;

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use courier_protocol::AgentResponse;

pub use alternate::AlternateCliBackend;
pub use primary::PrimaryCliBackend;
pub use sdk::SdkBackend;

use crate::config::BackendKind;
use crate::config::Config;
use crate::error::Result;
use crate::sink::StreamSink;

/// One agent run as seen by a back-end.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub prompt: String,
    pub working_directory: PathBuf,
    /// Agent-issued session id to resume; `None` for fresh sessions.
    pub session_id: Option<String>,
    pub continue_session: bool,
    pub user_id: Option<i64>,
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one prompt to completion, applying `sink` to every stream
    /// update.
    async fn execute(
        &self,
        ctx: ExecutionContext,
        sink: Arc<dyn StreamSink>,
    ) -> Result<AgentResponse>;

    /// Flag the user's in-flight run for cancellation.
    fn cancel_user(&self, user_id: i64);

    /// Cancel all active runs and release resources.
    async fn shutdown(&self);

    fn active_process_count(&self) -> usize;
}

pub fn create_backend(config: &Config) -> Arc<dyn AgentBackend> {
    match config.backend {
        BackendKind::Primary => Arc::new(PrimaryCliBackend::new(config)),
        BackendKind::Sdk => Arc::new(SdkBackend::new(config)),
        BackendKind::Alternate => Arc::new(AlternateCliBackend::new(config)),
    }
}

/// Locate an agent binary: explicit config path first, then an environment
/// override, then a `$PATH` search for the given names.
pub(crate) fn find_agent_binary(
    configured: Option<&Path>,
    env_var: &str,
    names: &[&str],
) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Some(path.to_path_buf());
        }
    }

    if let Some(path) = std::env::var_os(env_var) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        for name in names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tempfile::TempDir;

    #[test]
    fn configured_path_wins_when_it_exists() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("agent");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();

        let found = find_agent_binary(Some(&bin), "COURIER_TEST_NO_SUCH_VAR", &[]);
        assert_eq!(found, Some(bin));
    }

    #[test]
    fn missing_everything_yields_none() {
        let found = find_agent_binary(
            Some(Path::new("/nonexistent/agent")),
            "COURIER_TEST_NO_SUCH_VAR",
            &["courier-test-binary-that-does-not-exist"],
        );
        assert_eq!(found, None);
    }
}
