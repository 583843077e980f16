//! Public entry point of the execution core.
//!
//! One facade instance serves every user. Per user it enforces single
//! flight: a new prompt preempts the in-flight run, which observes the
//! cancellation flag, tears its child down, and surfaces `Interrupted` to
//! its own caller. Known failures are translated here into user-facing
//! error responses so chat glue only ever renders `content`.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use courier_protocol::AgentRequest;
use courier_protocol::AgentResponse;
use courier_protocol::ErrorKind;
use courier_protocol::StreamUpdate;
use tokio::sync::Mutex;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::backend::AgentBackend;
use crate::backend::ExecutionContext;
use crate::backend::create_backend;
use crate::config::Config;
use crate::error::CourierErr;
use crate::error::Result;
use crate::error::ToolValidationError;
use crate::monitor::ToolMonitor;
use crate::safety;
use crate::session::SessionStore;
use crate::session::UserSessionSummary;
use crate::sink::StreamSink;
use crate::transport::InteractionStorage;
use crate::transport::RateLimiter;

/// Upper bound on waiting for a preempted run to wind down. Cancellation
/// escalation itself is bounded at ~4.5s, so this only guards against a
/// wedged task.
const PREEMPT_WAIT: Duration = Duration::from_secs(5);

struct RunHandle {
    run_id: Uuid,
    done: watch::Receiver<bool>,
}

pub struct AgentFacade {
    config: Arc<Config>,
    backend: Arc<dyn AgentBackend>,
    sessions: Arc<SessionStore>,
    monitor: Arc<ToolMonitor>,
    storage: Option<Arc<dyn InteractionStorage>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    active_tasks: Mutex<HashMap<i64, RunHandle>>,
}

impl AgentFacade {
    pub fn new(config: Arc<Config>) -> Self {
        let backend = create_backend(&config);
        info!(backend = backend.name(), "agent integration initialized");
        Self {
            sessions: Arc::new(SessionStore::new(config.session_timeout_hours)),
            monitor: Arc::new(ToolMonitor::new(
                config.allowed_tools.clone(),
                config.disallowed_tools.clone(),
            )),
            backend,
            storage: None,
            rate_limiter: None,
            active_tasks: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Replace the configured back-end. Intended for wiring test doubles
    /// and alternative supervisors.
    pub fn with_backend(mut self, backend: Arc<dyn AgentBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn InteractionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn monitor(&self) -> &Arc<ToolMonitor> {
        &self.monitor
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Run one prompt. Exactly one response (or propagated error) per call.
    pub async fn run(
        &self,
        request: AgentRequest,
        on_stream: Option<Arc<dyn StreamSink>>,
    ) -> Result<AgentResponse> {
        match self.run_impl(request, on_stream).await {
            Ok(response) => Ok(response),
            Err(err) => self.translate_error(err),
        }
    }

    async fn run_impl(
        &self,
        request: AgentRequest,
        on_stream: Option<Arc<dyn StreamSink>>,
    ) -> Result<AgentResponse> {
        info!(
            user_id = request.user_id,
            working_directory = %request.working_directory.display(),
            session_id = request.session_id.as_deref().unwrap_or(""),
            prompt_length = request.prompt.len(),
            "running agent command"
        );

        let working_directory =
            safety::validate_path(&request.working_directory, &self.config.approved_directory)?;

        if let Some(limiter) = &self.rate_limiter {
            // Cost is unknown before the run; back-ends that report no cost
            // contribute zero here as well.
            let (allowed, reason) = limiter.check(request.user_id, 0.0).await;
            if !allowed {
                let reason =
                    reason.unwrap_or_else(|| "Rate limit exceeded. Try again later.".to_string());
                return Ok(AgentResponse::from_error(ErrorKind::UsageLimit, reason));
            }
        }

        self.preempt(request.user_id).await;

        let session = self
            .sessions
            .get_or_create(
                request.user_id,
                &working_directory,
                request.session_id.as_deref(),
            )
            .await;
        let continue_session =
            (request.continue_session || request.session_id.is_some()) && !session.is_new;
        let agent_session_id = (!session.is_new).then(|| session.session_id.clone());

        let validating = Arc::new(ValidatingSink {
            monitor: Arc::clone(&self.monitor),
            inner: on_stream,
            working_directory: working_directory.clone(),
            user_id: request.user_id,
            state: StdMutex::new(ValidationState::default()),
        });

        let run_id = Uuid::new_v4();
        let (done_tx, done_rx) = watch::channel(false);
        self.active_tasks
            .lock()
            .await
            .insert(request.user_id, RunHandle { run_id, done: done_rx });

        let ctx = ExecutionContext {
            prompt: request.prompt.clone(),
            working_directory,
            session_id: agent_session_id,
            continue_session,
            user_id: Some(request.user_id),
        };
        let backend_sink: Arc<dyn StreamSink> = validating.clone();
        let outcome = self.backend.execute(ctx, backend_sink).await;

        let _ = done_tx.send(true);
        {
            let mut tasks = self.active_tasks.lock().await;
            if tasks.get(&request.user_id).map(|h| h.run_id) == Some(run_id) {
                tasks.remove(&request.user_id);
            }
        }

        let mut response = outcome?;

        // Non-critical denials let the run finish but the response must say
        // what was blocked.
        let blocked = validating.blocked_tools();
        if !blocked.is_empty() {
            error!(
                user_id = request.user_id,
                blocked = %blocked.join(","),
                "command completed but tool validation failed"
            );
            response.is_error = true;
            response.error_kind = Some(ErrorKind::ToolValidationFailed);
            response.content = self.tool_error_message(&blocked);
        }

        let old_session_id = session.session_id.clone();
        let committed = self.sessions.update(&old_session_id, &response).await;
        response.session_id = committed
            .map(|s| s.session_id)
            .unwrap_or(old_session_id);

        info!(
            session_id = %response.session_id,
            cost = response.cost,
            duration_ms = response.duration_ms,
            num_turns = response.num_turns,
            is_error = response.is_error,
            "agent command completed"
        );

        if let Some(storage) = &self.storage {
            let storage = Arc::clone(storage);
            let user_id = request.user_id;
            let prompt = request.prompt;
            let saved = response.clone();
            tokio::spawn(async move {
                if let Err(e) = storage
                    .save_interaction(user_id, &saved.session_id, &prompt, &saved)
                    .await
                {
                    warn!(error = %e, "failed to save interaction");
                }
            });
        }

        Ok(response)
    }

    /// Cancel the user's in-flight run, if any, and wait (bounded) for it
    /// to wind down so two children never run concurrently for one user.
    async fn preempt(&self, user_id: i64) {
        let previous = {
            let tasks = self.active_tasks.lock().await;
            tasks.get(&user_id).map(|h| h.done.clone())
        };
        let Some(mut done) = previous else {
            return;
        };
        if *done.borrow() {
            return;
        }

        info!(user_id, "preempting previous in-flight run");
        // Two rounds: the first cancel can land in the window before the
        // supervisor has registered the run's cancellation flag.
        for attempt in 0..2 {
            self.backend.cancel_user(user_id);
            match timeout(PREEMPT_WAIT / 2, done.wait_for(|finished| *finished)).await {
                Ok(Ok(_)) => {
                    debug!(user_id, "previous run wound down");
                    return;
                }
                Ok(Err(_)) => {
                    debug!(user_id, "previous run dropped its completion channel");
                    return;
                }
                Err(_) if attempt == 0 => {}
                Err(_) => warn!(user_id, "previous run did not wind down in time"),
            }
        }
    }

    /// Continue the most recent resumable session for this user and
    /// directory. Returns `None` when there is nothing to continue.
    pub async fn continue_session(
        &self,
        user_id: i64,
        working_directory: &Path,
        prompt: Option<String>,
        on_stream: Option<Arc<dyn StreamSink>>,
    ) -> Result<Option<AgentResponse>> {
        let working_directory =
            safety::validate_path(working_directory, &self.config.approved_directory)?;
        let Some(latest) = self.sessions.most_recent_for(user_id, &working_directory).await else {
            info!(user_id, "no matching session to continue");
            return Ok(None);
        };

        let response = self
            .run(
                AgentRequest {
                    prompt: prompt.unwrap_or_default(),
                    working_directory: working_directory.to_path_buf(),
                    user_id,
                    session_id: Some(latest.session_id),
                    continue_session: true,
                },
                on_stream,
            )
            .await?;
        Ok(Some(response))
    }

    /// Cancel all children and sweep expired sessions.
    pub async fn shutdown(&self) {
        info!(backend = self.backend.name(), "shutting down agent integration");
        self.backend.shutdown().await;
        let removed = self.sessions.cleanup_expired().await;
        debug!(removed, "shutdown session sweep complete");
    }

    pub async fn cleanup_expired_sessions(&self) -> usize {
        self.sessions.cleanup_expired().await
    }

    pub fn tool_stats(&self) -> crate::monitor::ToolStats {
        self.monitor.stats()
    }

    /// Session and tool-usage overview for one user.
    pub async fn user_summary(&self, user_id: i64) -> (UserSessionSummary, crate::monitor::UserToolSummary) {
        (
            self.sessions.user_summary(user_id).await,
            self.monitor.user_summary(user_id),
        )
    }

    /// Map known failures to error responses; `Interrupted` and internal
    /// errors propagate to the caller untranslated.
    fn translate_error(&self, err: CourierErr) -> Result<AgentResponse> {
        let Some(kind) = err.response_kind() else {
            return Err(err);
        };
        let content = match &err {
            CourierErr::PolicyViolation { reason, .. } => {
                format!("🚫 Access denied: {reason}")
            }
            CourierErr::ToolValidation(e) => self.tool_error_message(&e.blocked_tools),
            CourierErr::Timeout { seconds } => format!(
                "⏱️ The request timed out after {seconds} seconds. The agent was stopped; \
                 try a smaller task or send a new prompt to start over."
            ),
            CourierErr::UsageLimitReached(e) => format!("⏳ {e}"),
            CourierErr::Process { message } => format!("❌ The agent failed:\n{message}"),
            CourierErr::Parsing(_) => {
                "❌ The agent ended without producing a result. Please try again.".to_string()
            }
            CourierErr::SessionNotFound(id) => format!(
                "Session `{id}` was not found. Send a new prompt to start a fresh session."
            ),
            _ => err.to_string(),
        };
        warn!(error = %err, "translated failure into error response");
        Ok(AgentResponse::from_error(kind, content))
    }

    fn tool_error_message(&self, blocked: &[String]) -> String {
        let allowed = self.monitor.allowed_tools();
        let allowed_list = if allowed.is_empty() {
            "all tools except the deny-list".to_string()
        } else {
            allowed
                .iter()
                .map(|t| format!("`{t}`"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let blocked_list = blocked
            .iter()
            .map(|t| format!("`{t}`"))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "🚫 **Tool access blocked**\n\n\
             The agent tried to use tools that are not allowed:\n{blocked_list}\n\n\
             **What you can do:**\n\
             • Ask the administrator to enable these tools\n\
             • Rephrase your request to use a different approach\n\n\
             **Currently allowed tools:**\n{allowed_list}"
        )
    }
}

#[derive(Default)]
struct ValidationState {
    /// Names of denied tools, in first-denial order. The monitor's
    /// violation log keeps the full records.
    blocked: Vec<String>,
}

/// Wraps the caller's sink: every update carrying tool calls is checked
/// against the monitor first. Critical denials raise; non-critical denials
/// are recorded and the run continues so the user gets an explanation.
struct ValidatingSink {
    monitor: Arc<ToolMonitor>,
    inner: Option<Arc<dyn StreamSink>>,
    working_directory: PathBuf,
    user_id: i64,
    state: StdMutex<ValidationState>,
}

impl ValidatingSink {
    fn blocked_tools(&self) -> Vec<String> {
        match self.state.lock() {
            Ok(state) => state.blocked.clone(),
            Err(poisoned) => poisoned.into_inner().blocked.clone(),
        }
    }
}

#[async_trait]
impl StreamSink for ValidatingSink {
    async fn on_update(&self, update: &StreamUpdate) -> Result<()> {
        for call in update.tool_calls() {
            let verdict = self.monitor.validate(
                &call.name,
                &call.input,
                &self.working_directory,
                self.user_id,
            );
            if let Err(denial) = verdict {
                error!(
                    tool_name = %denial.tool_name,
                    reason = %denial.reason,
                    user_id = self.user_id,
                    "tool validation failed"
                );
                let blocked_now = {
                    let mut state = match self.state.lock() {
                        Ok(state) => state,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if !state.blocked.contains(&denial.tool_name) {
                        state.blocked.push(denial.tool_name.clone());
                    }
                    denial.critical.then(|| state.blocked.clone())
                };
                if let Some(blocked) = blocked_now {
                    return Err(CourierErr::ToolValidation(ToolValidationError {
                        blocked_tools: blocked,
                        allowed_tools: self.monitor.allowed_tools().to_vec(),
                    }));
                }
            }
        }

        if let Some(inner) = &self.inner {
            if let Err(e) = inner.on_update(update).await {
                warn!(error = %e, "stream callback failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::ConfigToml;

    fn facade_with_allowed(allowed: Vec<String>) -> AgentFacade {
        let config = Config::from_toml(ConfigToml {
            approved_directory: Some(PathBuf::from("/")),
            allowed_tools: Some(allowed),
            ..Default::default()
        })
        .unwrap();
        AgentFacade::new(Arc::new(config))
    }

    #[test]
    fn timeouts_translate_to_error_responses() {
        let facade = facade_with_allowed(vec![]);
        let response = facade
            .translate_error(CourierErr::Timeout { seconds: 42 })
            .unwrap();
        assert!(response.is_error);
        assert_eq!(response.error_kind, Some(ErrorKind::Timeout));
        assert!(response.content.contains("42 seconds"));
    }

    #[test]
    fn interrupted_runs_propagate_silently() {
        let facade = facade_with_allowed(vec![]);
        assert!(matches!(
            facade.translate_error(CourierErr::Interrupted),
            Err(CourierErr::Interrupted)
        ));
    }

    #[test]
    fn tool_error_message_names_blocked_and_allowed() {
        let facade = facade_with_allowed(vec!["Read".to_string(), "Bash".to_string()]);
        let message = facade.tool_error_message(&["Write".to_string()]);
        assert!(message.contains("`Write`"));
        assert!(message.contains("`Read`"));
        assert!(message.contains("`Bash`"));
    }

    #[tokio::test]
    async fn critical_denials_raise_through_the_sink() {
        let facade = facade_with_allowed(vec!["Bash".to_string()]);
        let sink = ValidatingSink {
            monitor: Arc::clone(facade.monitor()),
            inner: None,
            working_directory: PathBuf::from("/"),
            user_id: 1,
            state: StdMutex::new(ValidationState::default()),
        };

        let update = StreamUpdate::Assistant(courier_protocol::AssistantUpdate {
            content: None,
            tool_calls: vec![courier_protocol::ToolCallRequest {
                name: "Write".to_string(),
                id: Some("c1".to_string()),
                input: serde_json::json!({"file_path": "/etc/passwd"}),
            }],
            timestamp: None,
            session_id: None,
        });
        let err = sink.on_update(&update).await.unwrap_err();
        match err {
            CourierErr::ToolValidation(e) => {
                assert_eq!(e.blocked_tools, vec!["Write".to_string()]);
            }
            other => panic!("expected tool validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_critical_denials_are_recorded_without_raising() {
        let facade = facade_with_allowed(vec!["Read".to_string()]);
        let sink = ValidatingSink {
            monitor: Arc::clone(facade.monitor()),
            inner: None,
            working_directory: PathBuf::from("/"),
            user_id: 1,
            state: StdMutex::new(ValidationState::default()),
        };

        let update = StreamUpdate::ToolCall(courier_protocol::ToolCallUpdate {
            call_id: "c1".to_string(),
            tool_name: "WebSearch".to_string(),
            tool_args: serde_json::Value::Null,
            timestamp: None,
            session_id: None,
        });
        sink.on_update(&update).await.unwrap();
        assert_eq!(sink.blocked_tools(), vec!["WebSearch".to_string()]);
    }
}
