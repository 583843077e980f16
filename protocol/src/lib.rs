//! Types shared between the courier core and its front-ends.
//!
//! This crate is deliberately small: it defines the typed stream protocol
//! spoken by agent back-ends plus the request/response pair that crosses the
//! public API boundary, and nothing else.

mod protocol;

pub use protocol::AgentRequest;
pub use protocol::AgentResponse;
pub use protocol::AssistantUpdate;
pub use protocol::ErrorKind;
pub use protocol::ErrorUpdate;
pub use protocol::ResultUpdate;
pub use protocol::StreamUpdate;
pub use protocol::SystemUpdate;
pub use protocol::ThinkingPhase;
pub use protocol::ThinkingUpdate;
pub use protocol::ToolCallRequest;
pub use protocol::ToolCallStatus;
pub use protocol::ToolCallUpdate;
pub use protocol::ToolInvocation;
pub use protocol::ToolResultUpdate;
pub use protocol::UserUpdate;
