//! Owned background tasks with explicit shutdown.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A spawned loop plus the token that stops it.
///
/// Dropping the handle cancels the loop without waiting for it; `shutdown`
/// cancels and then joins.
#[derive(Debug)]
pub(crate) struct BackgroundTask {
    name: &'static str,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `body` with a fresh token. The body must return once
    /// the token is cancelled.
    pub(crate) fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(body(token.clone()));
        debug!(task = name, "Background cache task started");
        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    pub(crate) async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.await
        {
            warn!(task = self.name, error = %err, "Background cache task ended abnormally");
        }
        debug!(task = self.name, "Background cache task stopped");
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
