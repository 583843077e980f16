use std::sync::Arc;

use tokio::sync::Notify;
use tracing::debug;

/// Make a notifier that fires when SIGINT occurs. Front-ends use this to
/// drive a graceful shutdown of the facade (which in turn cancels any
/// active agent children).
pub fn notify_on_sigint() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());

    tokio::spawn({
        let notify = Arc::clone(&notify);
        async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                debug!("keyboard interrupt");
                notify.notify_waiters();
            }
        }
    });

    notify
}
