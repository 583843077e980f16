//! Stream-sink interface between the supervisor and update consumers.
//!
//! The supervisor applies the sink to every parsed update. Sink failures
//! are logged and swallowed, with one exception: a
//! [`CourierErr::ToolValidation`] error aborts the run and cancels the
//! agent.

use std::sync::Arc;

use async_trait::async_trait;
use courier_protocol::StreamUpdate;
use tokio::sync::mpsc;

use crate::error::Result;

#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn on_update(&self, update: &StreamUpdate) -> Result<()>;
}

/// Discards every update. Useful for headless runs and tests.
pub struct NullSink;

#[async_trait]
impl StreamSink for NullSink {
    async fn on_update(&self, _update: &StreamUpdate) -> Result<()> {
        Ok(())
    }
}

/// Forwards updates over an unbounded channel. A dropped receiver is not an
/// error; the run keeps going without an observer.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StreamUpdate>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<StreamUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl StreamSink for ChannelSink {
    async fn on_update(&self, update: &StreamUpdate) -> Result<()> {
        let _ = self.tx.send(update.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use courier_protocol::ErrorUpdate;

    #[tokio::test]
    async fn channel_sink_forwards_updates() {
        let (sink, mut rx) = ChannelSink::new();
        let update = StreamUpdate::Error(ErrorUpdate {
            message: "boom".to_string(),
        });
        sink.on_update(&update).await.unwrap();
        assert!(matches!(rx.recv().await, Some(StreamUpdate::Error(_))));
    }

    #[tokio::test]
    async fn channel_sink_tolerates_a_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let update = StreamUpdate::Error(ErrorUpdate {
            message: "boom".to_string(),
        });
        assert!(sink.on_update(&update).await.is_ok());
    }
}
