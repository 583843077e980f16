//! Primary agent CLI: one-shot invocation emitting stream-JSON on stdout.
//!
//! This is the default back-end. Its result dialect reports cost, duration
//! and turn counts directly.

use std::sync::Arc;

use async_trait::async_trait;
use courier_protocol::AgentResponse;

use crate::backend::AgentBackend;
use crate::backend::ExecutionContext;
use crate::backend::find_agent_binary;
use crate::config::BackendOptions;
use crate::config::Config;
use crate::error::CourierErr;
use crate::error::Result;
use crate::sink::StreamSink;
use crate::supervisor::ProcessSupervisor;
use crate::supervisor::SpawnSpec;

/// Environment override for the primary agent binary location.
pub const PRIMARY_AGENT_BIN_ENV: &str = "COURIER_PRIMARY_AGENT_BIN";

const PRIMARY_AGENT_NAMES: &[&str] = &["agent"];

pub struct PrimaryCliBackend {
    supervisor: ProcessSupervisor,
    options: BackendOptions,
    max_turns: u32,
}

impl PrimaryCliBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(config),
            options: config.primary.clone(),
            max_turns: config.max_turns,
        }
    }

    fn build_spec(&self, ctx: &ExecutionContext) -> Result<SpawnSpec> {
        let program = find_agent_binary(
            self.options.binary.as_deref(),
            PRIMARY_AGENT_BIN_ENV,
            PRIMARY_AGENT_NAMES,
        )
        .ok_or_else(|| CourierErr::Process {
            message: format!(
                "agent CLI not found; install it or set {PRIMARY_AGENT_BIN_ENV}"
            ),
        })?;

        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--max-turns".to_string(),
            self.max_turns.to_string(),
        ];
        if let Some(model) = &self.options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if ctx.continue_session {
            if let Some(session_id) = &ctx.session_id {
                args.push("--resume".to_string());
                args.push(session_id.clone());
            }
        }
        args.extend(self.options.extra_args.iter().cloned());
        args.push(ctx.prompt.clone());

        Ok(SpawnSpec {
            program,
            args,
            env: Vec::new(),
            cwd: ctx.working_directory.clone(),
        })
    }
}

#[async_trait]
impl AgentBackend for PrimaryCliBackend {
    fn name(&self) -> &'static str {
        "primary-cli"
    }

    async fn execute(
        &self,
        ctx: ExecutionContext,
        sink: Arc<dyn StreamSink>,
    ) -> Result<AgentResponse> {
        let spec = self.build_spec(&ctx)?;
        self.supervisor.run(spec, sink, ctx.user_id).await
    }

    fn cancel_user(&self, user_id: i64) {
        self.supervisor.cancel_user(user_id);
    }

    async fn shutdown(&self) {
        self.supervisor.cancel_all();
    }

    fn active_process_count(&self) -> usize {
        self.supervisor.active_process_count()
    }
}
