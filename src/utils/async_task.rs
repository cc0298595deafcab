use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::error;
use tracing::warn;

use crate::PipelineError;
use crate::Result;

/// Awaits an acknowledgement for at most `ack_timeout`.
///
/// Returns `None` when the subscriber did not answer in time; the caller logs
/// and proceeds instead of blocking on a slow or departed subscriber.
pub(crate) async fn wait_with_timeout<F, T>(
    what: &str,
    ack_timeout: Duration,
    fut: F,
) -> Option<T>
where
    F: Future<Output = T>,
{
    match timeout(ack_timeout, fut).await {
        Ok(r) => Some(r),
        Err(_) => {
            warn!("Timeout of {} ({:?})", what, ack_timeout);
            None
        }
    }
}

/// Sends into a bounded channel, giving up after `notify_timeout`.
pub(crate) async fn send_with_timeout<T>(
    name: &str,
    tx: &tokio::sync::mpsc::Sender<T>,
    msg: T,
    notify_timeout: Duration,
) -> Result<()> {
    match timeout(notify_timeout, tx.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(PipelineError::ChannelClosed(name.to_string()).into()),
        Err(_) => Err(PipelineError::AckTimeout {
            name: name.to_string(),
            timeout: notify_timeout,
        }
        .into()),
    }
}

// Helper function to spawn tasks and track their JoinHandles
pub(crate) fn spawn_task<F, Fut>(
    name: &str,
    task_fn: F,
    handles: Option<&mut Vec<tokio::task::JoinHandle<()>>>,
) where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    let handle = tokio::spawn(async move {
        if let Err(e) = task_fn().await {
            error!("spawned task: {name} stopped or encountered an error: {:?}", e);
        }
    });

    if let Some(h) = handles {
        h.push(handle);
    }
}
