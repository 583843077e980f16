//! Agent execution core for a chat-driven code-assistant front-end.
//!
//! The crate supervises an agent binary as a child process, parses its
//! line-delimited streaming JSON, validates every tool call against a
//! security policy, renders throttled progress into a chat message, and
//! keeps per-user resumable sessions. Chat transports, durable storage and
//! rate limiting are collaborator traits in [`transport`]; this crate never
//! talks to a platform directly.

pub mod backend;
pub mod commands;
pub mod config;
pub mod error;
pub mod facade;
pub mod monitor;
pub mod render;
pub mod safety;
pub mod session;
pub mod sink;
mod stream;
mod supervisor;
mod telemetry;
pub mod transport;
pub mod util;

pub use error::CourierErr;
pub use error::Result;
pub use facade::AgentFacade;
pub use stream::CancelFlag;
pub use stream::ToolCallRecord;
