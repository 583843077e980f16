//! SDK/stdio dialect of the primary agent.
//!
//! Drives the same binary through its SDK surface: edits are auto-accepted
//! (the monitor still vetoes disallowed tools before they stand) and an
//! in-memory table remembers how many prompts each session has seen, which
//! resumed runs report in logs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use courier_protocol::AgentResponse;
use tracing::debug;

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

pub const SDK_AGENT_BIN_ENV: &str = "COURIER_SDK_AGENT_BIN";

const SDK_AGENT_NAMES: &[&str] = &["agent"];

#[derive(Default)]
struct SessionBookkeeping {
    prompt_count: HashMap<String, u32>,
}

pub struct SdkBackend {
    supervisor: ProcessSupervisor,
    options: BackendOptions,
    max_turns: u32,
    sessions: Mutex<SessionBookkeeping>,
}

impl SdkBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(config),
            options: config.sdk.clone(),
            max_turns: config.max_turns,
            sessions: Mutex::new(SessionBookkeeping::default()),
        }
    }

    fn build_spec(&self, ctx: &ExecutionContext) -> Result<SpawnSpec> {
        let program = find_agent_binary(
            self.options.binary.as_deref(),
            SDK_AGENT_BIN_ENV,
            SDK_AGENT_NAMES,
        )
        .ok_or_else(|| CourierErr::Process {
            message: format!("agent CLI not found; install it or set {SDK_AGENT_BIN_ENV}"),
        })?;

        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--permission-mode".to_string(),
            "accept-edits".to_string(),
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

    fn note_prompt(&self, session_id: &str) -> u32 {
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = sessions
            .prompt_count
            .entry(session_id.to_string())
            .or_insert(0);
        *count += 1;
        *count
    }
}

#[async_trait]
impl AgentBackend for SdkBackend {
    fn name(&self) -> &'static str {
        "sdk"
    }

    async fn execute(
        &self,
        ctx: ExecutionContext,
        sink: Arc<dyn StreamSink>,
    ) -> Result<AgentResponse> {
        let spec = self.build_spec(&ctx)?;
        let response = self.supervisor.run(spec, sink, ctx.user_id).await?;
        if !response.session_id.is_empty() {
            let prompts = self.note_prompt(&response.session_id);
            debug!(session_id = %response.session_id, prompts, "sdk session updated");
        }
        Ok(response)
    }

    fn cancel_user(&self, user_id: i64) {
        self.supervisor.cancel_user(user_id);
    }

    async fn shutdown(&self) {
        self.supervisor.cancel_all();
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.prompt_count.clear();
        }
    }

    fn active_process_count(&self) -> usize {
        self.supervisor.active_process_count()
    }
}
