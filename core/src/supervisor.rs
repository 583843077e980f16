//! Shared agent-process engine used by every back-end.
//!
//! Owns the child for the duration of one run: spawn with stdin detached,
//! stream stdout through the parser under the wall-clock budget, apply the
//! sink to each update, and tear the child down with staged signals when
//! the run is cancelled, preempted, or out of time.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use courier_protocol::AgentResponse;
use courier_protocol::StreamUpdate;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::error::CourierErr;
use crate::error::Result;
use crate::error::parse_usage_limit;
use crate::sink::StreamSink;
use crate::stream::CancelFlag;
use crate::stream::LineReader;
use crate::stream::ReadEvent;
use crate::stream::StreamCollector;
use crate::telemetry::ToolSpanTracker;

/// Grace period after each of the first two cancellation signals.
const SIGNAL_GRACE: Duration = Duration::from_secs(2);

/// Stderr is only read for post-mortems, so a modest cap is plenty.
const MAX_STDERR_BYTES: usize = 16 * 1024;

/// Fully resolved invocation of an agent binary, produced by a back-end's
/// argument template.
#[derive(Debug, Clone)]
pub(crate) struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

enum StreamEnd {
    Eof,
    Cancelled,
    TimedOut,
    SinkAbort(CourierErr),
}

/// Process registries shared across runs: one engine instance per back-end.
pub(crate) struct ProcessSupervisor {
    timeout_seconds: u64,
    max_message_buffer: usize,
    active: Mutex<HashMap<Uuid, Option<u32>>>,
    user_processes: Mutex<HashMap<i64, HashSet<Uuid>>>,
    cancelled_users: Mutex<HashMap<i64, CancelFlag>>,
    shutdown: CancelFlag,
}

impl ProcessSupervisor {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            timeout_seconds: config.agent_timeout_seconds,
            max_message_buffer: config.max_message_buffer,
            active: Mutex::new(HashMap::new()),
            user_processes: Mutex::new(HashMap::new()),
            cancelled_users: Mutex::new(HashMap::new()),
            shutdown: CancelFlag::new(),
        }
    }

    /// Flag the user's in-flight run for cancellation. The stream reader
    /// observes the flag between chunks and the owning run escalates
    /// signals to its child.
    pub(crate) fn cancel_user(&self, user_id: i64) {
        if let Ok(map) = self.cancelled_users.lock() {
            if let Some(flag) = map.get(&user_id) {
                info!(user_id, "cancelling active agent run for user");
                flag.cancel();
            }
        }
    }

    /// Cancel every active run; used on shutdown.
    pub(crate) fn cancel_all(&self) {
        self.shutdown.cancel();
        if let Ok(map) = self.cancelled_users.lock() {
            for flag in map.values() {
                flag.cancel();
            }
        }
    }

    pub(crate) fn active_process_count(&self) -> usize {
        self.active.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub(crate) async fn run(
        &self,
        spec: SpawnSpec,
        sink: Arc<dyn StreamSink>,
        user_id: Option<i64>,
    ) -> Result<AgentResponse> {
        let process_id = Uuid::new_v4();
        let cancel = self.register(process_id, user_id);
        let outcome = self.run_inner(process_id, &spec, sink, &cancel).await;
        self.unregister(process_id, user_id);
        outcome
    }

    async fn run_inner(
        &self,
        process_id: Uuid,
        spec: &SpawnSpec,
        sink: Arc<dyn StreamSink>,
        cancel: &CancelFlag,
    ) -> Result<AgentResponse> {
        let started = Instant::now();
        let deadline = Duration::from_secs(self.timeout_seconds);

        info!(
            %process_id,
            program = %spec.program.display(),
            command = %render_command(spec),
            cwd = %spec.cwd.display(),
            "starting agent process"
        );
        let mut child = spawn_agent(spec)?;
        if let Ok(mut active) = self.active.lock() {
            active.insert(process_id, child.id());
        }

        let stdout = child.stdout.take().ok_or_else(|| CourierErr::Process {
            message: "stdout pipe was unexpectedly not available".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| CourierErr::Process {
            message: "stderr pipe was unexpectedly not available".to_string(),
        })?;
        let stderr_task = tokio::spawn(read_capped(BufReader::new(stderr), MAX_STDERR_BYTES));

        let mut reader = LineReader::new(stdout);
        let mut collector = StreamCollector::new(self.max_message_buffer);
        let mut spans = ToolSpanTracker::new();

        let end = loop {
            let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
                break StreamEnd::TimedOut;
            };
            let event = tokio::select! {
                event = reader.next_line(cancel) => event?,
                _ = tokio::time::sleep(remaining) => break StreamEnd::TimedOut,
            };
            match event {
                ReadEvent::Cancelled => break StreamEnd::Cancelled,
                ReadEvent::Eof => break StreamEnd::Eof,
                ReadEvent::Line(line) => {
                    let Some(update) = collector.ingest(&line) else {
                        continue;
                    };
                    match &update {
                        StreamUpdate::ToolCall(u) => {
                            spans.on_started(&u.call_id, &u.tool_name, &u.tool_args);
                        }
                        StreamUpdate::ToolResult(u) => {
                            spans.on_completed(
                                &u.call_id,
                                u.status,
                                u.result.as_ref(),
                                u.error.as_deref(),
                            );
                        }
                        _ => {}
                    }
                    if let Err(err) = sink.on_update(&update).await {
                        match err {
                            CourierErr::ToolValidation(_) => break StreamEnd::SinkAbort(err),
                            other => warn!(error = %other, "stream sink failed"),
                        }
                    }
                }
            }
        };

        // Deterministic close-out regardless of how the stream ended.
        spans.close_orphans();
        collector.tools.close_orphans();

        match end {
            StreamEnd::TimedOut => {
                warn!(%process_id, timeout_seconds = self.timeout_seconds, "agent run timed out");
                graceful_cancel(&mut child).await;
                Err(CourierErr::Timeout {
                    seconds: self.timeout_seconds,
                })
            }
            StreamEnd::Cancelled => {
                info!(%process_id, "agent run cancelled");
                graceful_cancel(&mut child).await;
                Err(CourierErr::Interrupted)
            }
            StreamEnd::SinkAbort(err) => {
                warn!(%process_id, error = %err, "cancelling agent after tool validation failure");
                graceful_cancel(&mut child).await;
                Err(err)
            }
            StreamEnd::Eof => {
                let status = child.wait().await?;
                let stderr_bytes = stderr_task
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .unwrap_or_default();
                debug!(
                    %process_id,
                    exit_code = status.code().unwrap_or(-1),
                    messages = collector.message_count(),
                    parse_errors = collector.parsing_errors,
                    "agent process finished"
                );
                build_response(collector, status.code(), &stderr_bytes, started)
            }
        }
    }

    fn register(&self, process_id: Uuid, user_id: Option<i64>) -> CancelFlag {
        let flag = CancelFlag::new();
        if self.shutdown.is_cancelled() {
            flag.cancel();
        }
        if let Ok(mut active) = self.active.lock() {
            active.insert(process_id, None);
        }
        if let Some(user_id) = user_id {
            if let Ok(mut users) = self.user_processes.lock() {
                users.entry(user_id).or_default().insert(process_id);
            }
            if let Ok(mut cancelled) = self.cancelled_users.lock() {
                cancelled.insert(user_id, flag.clone());
            }
        }
        flag
    }

    fn unregister(&self, process_id: Uuid, user_id: Option<i64>) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&process_id);
        }
        if let Some(user_id) = user_id {
            let last_for_user = if let Ok(mut users) = self.user_processes.lock() {
                match users.get_mut(&user_id) {
                    Some(set) => {
                        set.remove(&process_id);
                        if set.is_empty() {
                            users.remove(&user_id);
                            true
                        } else {
                            false
                        }
                    }
                    None => true,
                }
            } else {
                false
            };
            if last_for_user {
                if let Ok(mut cancelled) = self.cancelled_users.lock() {
                    cancelled.remove(&user_id);
                }
            }
        }
    }
}

fn spawn_agent(spec: &SpawnSpec) -> Result<Child> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    cmd.current_dir(&spec.cwd);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    // No stdin: agents must never wait for interactive input.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd.spawn().map_err(|e| CourierErr::Process {
        message: format!("failed to spawn agent {}: {e}", spec.program.display()),
    })
}

/// Three-step cancellation: SIGINT, SIGTERM, then SIGKILL, waiting up to
/// two seconds after each of the first two. Every step tolerates a process
/// that has already exited.
pub(crate) async fn graceful_cancel(child: &mut Child) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }

    #[cfg(unix)]
    for signal in [libc::SIGINT, libc::SIGTERM] {
        let Some(pid) = child.id() else {
            // Already reaped.
            return;
        };
        debug!(pid, signal, "signalling agent process");
        // A failed kill means the process is already gone; the wait below
        // settles it either way.
        unsafe {
            libc::kill(pid as i32, signal);
        }
        if timeout(SIGNAL_GRACE, child.wait()).await.is_ok() {
            debug!(pid, signal, "agent exited after signal");
            return;
        }
    }

    warn!("agent ignored graceful signals; killing");
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill failed (process already gone)");
    }
    let _ = child.wait().await;
}

/// Assemble the final [`AgentResponse`] once the stream has drained.
fn build_response(
    mut collector: StreamCollector,
    exit_code: Option<i32>,
    stderr_bytes: &[u8],
    started: Instant,
) -> Result<AgentResponse> {
    let tools_used = collector.tools.invocations();

    match collector.result.take() {
        Some(result) => {
            let content = if result.content.is_empty() {
                collector.assistant_content()
            } else {
                result.content
            };
            if result.is_error {
                if let Some(limit) = parse_usage_limit(&content) {
                    return Err(CourierErr::UsageLimitReached(limit));
                }
            }
            Ok(AgentResponse {
                content,
                session_id: result.session_id,
                cost: result.cost.unwrap_or(0.0),
                duration_ms: result
                    .duration_ms
                    .unwrap_or(started.elapsed().as_millis() as u64),
                num_turns: result.num_turns.unwrap_or(collector.assistant_turns),
                is_error: result.is_error,
                error_kind: result
                    .is_error
                    .then_some(courier_protocol::ErrorKind::Process),
                tools_used,
            })
        }
        None => {
            let stderr = String::from_utf8_lossy(stderr_bytes);
            if let Some(limit) = parse_usage_limit(&stderr) {
                return Err(CourierErr::UsageLimitReached(limit));
            }
            let code = exit_code.unwrap_or(-1);
            let detail = stderr.trim();
            if detail.is_empty() {
                Err(CourierErr::Parsing(format!("exit code {code}")))
            } else {
                Err(CourierErr::Parsing(format!("exit code {code}: {detail}")))
            }
        }
    }
}

fn render_command(spec: &SpawnSpec) -> String {
    let mut parts = vec![spec.program.to_string_lossy().to_string()];
    parts.extend(spec.args.iter().cloned());
    shlex::try_join(parts.iter().map(String::as_str)).unwrap_or_else(|_| parts.join(" "))
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, max_bytes: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(max_bytes.min(8 * 1024));
    let mut tmp = [0u8; 8192];
    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        let budget = max_bytes.saturating_sub(buf.len());
        if budget > 0 {
            buf.extend_from_slice(&tmp[..n.min(budget)]);
        }
        // Keep draining to EOF so the child never blocks on a full pipe.
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn read_capped_discards_beyond_the_budget() {
        let data = vec![b'x'; 64 * 1024];
        let out = read_capped(std::io::Cursor::new(data), 1024).await.unwrap();
        assert_eq!(out.len(), 1024);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn graceful_cancel_settles_a_stubborn_child_quickly() {
        // `sh -c` installs no INT/TERM handlers, so the first signal lands.
        let mut child = Command::new("sh")
            .args(["-c", "sleep 30"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let started = Instant::now();
        graceful_cancel(&mut child).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(child.try_wait(), Ok(Some(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn graceful_cancel_is_a_no_op_for_an_exited_child() {
        let mut child = Command::new("true")
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let _ = child.wait().await;
        graceful_cancel(&mut child).await;
    }
}
