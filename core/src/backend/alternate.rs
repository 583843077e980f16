//! Alternate agent CLI.
//!
//! Speaks the flat tool-call dialect (`<name>ToolCall` wrappers, thinking
//! deltas, partial output streaming) and reports no cost in its result
//! message, so responses from this back-end carry `cost = 0.0`.

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

pub const ALTERNATE_AGENT_BIN_ENV: &str = "COURIER_ALT_AGENT_BIN";

const ALTERNATE_AGENT_NAMES: &[&str] = &["pilot", "pilot-agent"];

pub struct AlternateCliBackend {
    supervisor: ProcessSupervisor,
    options: BackendOptions,
}

impl AlternateCliBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(config),
            options: config.alternate.clone(),
        }
    }

    fn build_spec(&self, ctx: &ExecutionContext) -> Result<SpawnSpec> {
        let program = find_agent_binary(
            self.options.binary.as_deref(),
            ALTERNATE_AGENT_BIN_ENV,
            ALTERNATE_AGENT_NAMES,
        )
        .ok_or_else(|| CourierErr::Process {
            message: format!(
                "alternate agent CLI not found; install it or set {ALTERNATE_AGENT_BIN_ENV}"
            ),
        })?;

        // Force mode: the monitor is the policy layer here, not the agent's
        // own interactive prompt.
        let mut args = vec![
            "--force".to_string(),
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--stream-partial-output".to_string(),
            "--workspace".to_string(),
            ctx.working_directory.display().to_string(),
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
impl AgentBackend for AlternateCliBackend {
    fn name(&self) -> &'static str {
        "alternate-cli"
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
