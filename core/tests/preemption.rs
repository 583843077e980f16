//! Preemption and timeout behavior with real child processes.

#![allow(clippy::unwrap_used)]
#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use common::FacadeOptions;
use common::facade_for_script;
use common::write_agent_script;
use courier_core::CourierErr;
use courier_protocol::AgentRequest;
use tempfile::TempDir;

fn request(root: &TempDir, prompt: &str) -> AgentRequest {
    AgentRequest {
        prompt: prompt.to_string(),
        working_directory: root.path().to_path_buf(),
        user_id: 42,
        session_id: None,
        continue_session: false,
    }
}

/// The prompt is the script's last positional argument; `slow` hangs long
/// enough to be preempted, anything else completes immediately.
const BRANCHING_AGENT: &str = r#"
for last; do :; done
echo '{"type":"system","subtype":"init","model":"M"}'
if [ "$last" = "slow" ]; then
    sleep 20
fi
echo "{\"type\":\"result\",\"result\":\"$last done\",\"session_id\":\"S-$last\",\"is_error\":false}"
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_prompt_preempts_the_in_flight_run() {
    let root = TempDir::new().unwrap();
    let script = write_agent_script(root.path(), "agent.sh", BRANCHING_AGENT);
    let facade = facade_for_script(root.path(), &script, FacadeOptions::default());

    let first = tokio::spawn({
        let facade = Arc::clone(&facade);
        let request = request(&root, "slow");
        async move { facade.run(request, None).await }
    });

    // Let the first run spawn its child and register itself.
    tokio::time::sleep(Duration::from_millis(700)).await;

    let started = Instant::now();
    let second = facade.run(request(&root, "fast"), None).await.unwrap();
    assert!(!second.is_error);
    assert_eq!(second.content, "fast done");
    // Preemption waits ≤ cancellation escalation, not the slow child's 20s.
    assert!(started.elapsed() < Duration::from_secs(8));

    let first_outcome = first.await.unwrap();
    assert!(
        matches!(first_outcome, Err(CourierErr::Interrupted)),
        "preempted run must surface Interrupted, got {first_outcome:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hung_agents_time_out_and_are_torn_down() {
    let root = TempDir::new().unwrap();
    let script = write_agent_script(
        root.path(),
        "agent.sh",
        r#"
echo '{"type":"system","subtype":"init","model":"M"}'
sleep 30
"#,
    );
    let facade = facade_for_script(
        root.path(),
        &script,
        FacadeOptions {
            timeout_seconds: 2,
            ..Default::default()
        },
    );

    let started = Instant::now();
    let response = facade.run(request(&root, "hang"), None).await.unwrap();
    let elapsed = started.elapsed();

    assert!(response.is_error);
    assert_eq!(
        response.error_kind,
        Some(courier_protocol::ErrorKind::Timeout)
    );
    // Timeout plus the full signal escalation budget.
    assert!(
        elapsed < Duration::from_millis(6500),
        "teardown took {elapsed:?}"
    );
}
