//! End-to-end streaming tests against fake agent binaries.

#![allow(clippy::unwrap_used)]
#![cfg(unix)]

mod common;

use std::sync::Arc;

use common::FacadeOptions;
use common::facade_for_script;
use common::write_agent_script;
use courier_core::sink::ChannelSink;
use courier_protocol::AgentRequest;
use courier_protocol::StreamUpdate;
use tempfile::TempDir;

fn request(root: &TempDir, prompt: &str) -> AgentRequest {
    AgentRequest {
        prompt: prompt.to_string(),
        working_directory: root.path().to_path_buf(),
        user_id: 1,
        session_id: None,
        continue_session: false,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_prompt_without_tools() {
    let root = TempDir::new().unwrap();
    let script = write_agent_script(
        root.path(),
        "agent.sh",
        r#"
echo '{"type":"system","subtype":"init","model":"M","session_id":"S"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}'
echo '{"type":"result","result":"hello","session_id":"S","cost":0.01,"duration_ms":42,"num_turns":1,"is_error":false}'
"#,
    );
    let facade = facade_for_script(root.path(), &script, FacadeOptions::default());

    let (sink, mut rx) = ChannelSink::new();
    let response = facade
        .run(request(&root, "say hello"), Some(sink))
        .await
        .unwrap();

    assert!(!response.is_error);
    assert_eq!(response.content, "hello");
    assert_eq!(response.session_id, "S");
    assert!((response.cost - 0.01).abs() < f64::EPSILON);
    assert_eq!(response.duration_ms, 42);
    assert_eq!(response.num_turns, 1);
    assert!(response.tools_used.is_empty());

    // The session was rekeyed to the agent-issued id.
    let session = facade.sessions().get("S").await.unwrap();
    assert!(!session.is_new);
    assert_eq!(session.message_count, 1);

    // The caller's sink saw the stream in order.
    let mut kinds = Vec::new();
    while let Ok(update) = rx.try_recv() {
        kinds.push(match update {
            StreamUpdate::System(_) => "system",
            StreamUpdate::Assistant(_) => "assistant",
            StreamUpdate::Result(_) => "result",
            _ => "other",
        });
    }
    assert_eq!(kinds, vec!["system", "assistant", "result"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_tool_success_records_the_invocation() {
    let root = TempDir::new().unwrap();
    let script = write_agent_script(
        root.path(),
        "agent.sh",
        r#"
echo '{"type":"tool_call","subtype":"started","call_id":"A","tool_call":{"readToolCall":{"args":{"path":"x.txt"}}}}'
echo '{"type":"tool_call","subtype":"completed","call_id":"A","tool_call":{"readToolCall":{"args":{"path":"x.txt"},"result":"data"}}}'
echo '{"type":"result","result":"done","session_id":"S2","cost":0.002,"duration_ms":10,"num_turns":1,"is_error":false}'
"#,
    );
    let facade = facade_for_script(root.path(), &script, FacadeOptions::default());

    let response = facade.run(request(&root, "read x"), None).await.unwrap();

    assert!(!response.is_error);
    let names: Vec<&str> = response.tools_used.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["read"]);
    assert_eq!(response.tools_used[0].input["path"], "x.txt");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_lines_do_not_fail_the_run() {
    let root = TempDir::new().unwrap();
    let script = write_agent_script(
        root.path(),
        "agent.sh",
        r#"
echo 'this is not json'
echo '{"type":"result","result":"ok","session_id":"S3","is_error":false}'
"#,
    );
    let facade = facade_for_script(root.path(), &script, FacadeOptions::default());

    let response = facade.run(request(&root, "go"), None).await.unwrap();
    assert!(!response.is_error);
    assert_eq!(response.content, "ok");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_result_with_failure_exit_is_a_parsing_error() {
    let root = TempDir::new().unwrap();
    let script = write_agent_script(
        root.path(),
        "agent.sh",
        r#"
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}'
echo 'something went wrong' >&2
exit 3
"#,
    );
    let facade = facade_for_script(root.path(), &script, FacadeOptions::default());

    let response = facade.run(request(&root, "go"), None).await.unwrap();
    assert!(response.is_error);
    assert_eq!(
        response.error_kind,
        Some(courier_protocol::ErrorKind::Parsing)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn usage_limit_messages_are_recognized() {
    let root = TempDir::new().unwrap();
    let script = write_agent_script(
        root.path(),
        "agent.sh",
        r#"
echo '{"type":"result","result":"Usage limit reached. Your limit resets at 7pm (UTC).","session_id":"S","is_error":true}'
exit 1
"#,
    );
    let facade = facade_for_script(root.path(), &script, FacadeOptions::default());

    let response = facade.run(request(&root, "go"), None).await.unwrap();
    assert!(response.is_error);
    assert_eq!(
        response.error_kind,
        Some(courier_protocol::ErrorKind::UsageLimit)
    );
    assert!(response.content.contains("7pm"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_sink_failures_do_not_abort_the_run() {
    struct FailingSink;

    #[async_trait::async_trait]
    impl courier_core::sink::StreamSink for FailingSink {
        async fn on_update(
            &self,
            _update: &StreamUpdate,
        ) -> courier_core::Result<()> {
            Err(courier_core::CourierErr::Process {
                message: "sink exploded".to_string(),
            })
        }
    }

    let root = TempDir::new().unwrap();
    let script = write_agent_script(
        root.path(),
        "agent.sh",
        r#"
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}'
echo '{"type":"result","result":"hi","session_id":"S4","is_error":false}'
"#,
    );
    let facade = facade_for_script(root.path(), &script, FacadeOptions::default());

    let response = facade
        .run(request(&root, "go"), Some(Arc::new(FailingSink)))
        .await
        .unwrap();
    assert!(!response.is_error);
    assert_eq!(response.content, "hi");
}
