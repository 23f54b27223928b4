//! Watch subscription handle
//!
//! Every watch owns one delivery task that drains an unbounded channel and
//! invokes the subscriber callback sequentially, so notifications reach the
//! callback in the order the store produced them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::model::WatchResponse;

/// Cancel reason reported when the store side of a stream went away without
/// a final notification.
pub const STREAM_CLOSED_REASON: &str = "watch stream closed";

/// Callback invoked for every notification of a watch.
///
/// Runs on the watch's delivery task, never on the task that opened the watch.
pub type WatchCallback = Arc<dyn Fn(WatchResponse) + Send + Sync + 'static>;

/// Handle to a live watch subscription.
///
/// Cancelling (explicitly or by dropping the handle) stops further deliveries.
/// It does not wait for a callback that is already running.
pub struct WatchHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Spawn the delivery task for a watch fed by `rx`.
    ///
    /// The task ends when the handle is cancelled, after a canceled
    /// notification, or when the sender side is dropped. A dropped sender is
    /// reported to the callback as a canceled notification.
    pub fn spawn(
        id: u64,
        mut rx: mpsc::UnboundedReceiver<WatchResponse>,
        callback: WatchCallback,
    ) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let task = tokio::spawn(async move {
            let mut last_revision = 0;
            loop {
                let Some(resp) = rx.recv().await else {
                    if !flag.load(Ordering::SeqCst) {
                        callback(WatchResponse::canceled(
                            id,
                            last_revision,
                            STREAM_CLOSED_REASON,
                        ));
                    }
                    break;
                };
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                last_revision = resp.revision;
                let last = resp.canceled;
                callback(resp);
                if last {
                    break;
                }
            }
            debug!(watch_id = id, "Watch delivery loop ended");
        });

        Self {
            id,
            cancelled,
            task,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop delivering notifications.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!(watch_id = self.id, "Cancelling watch");
            self.task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the delivery task has ended, by cancellation or because the
    /// store closed the stream.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
