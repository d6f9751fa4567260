use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Endpoint;

/// Handle returned from `Client::subscribe` for one running subscribe loop.
///
/// The loop keeps running if the handle is dropped; call `cancel` to stop
/// it. Cancellation is honoured at the next frame boundary: the loop sends
/// `RDY 0` and detaches from its connection.
pub struct Subscription {
    topic: String,
    channel: String,
    endpoint: Endpoint,
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

/// Cloneable way to cancel a subscription while its `Subscription` is
/// consumed by `stopped`.
#[derive(Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub(crate) fn new(tx: watch::Sender<bool>) -> Self {
        Self(Arc::new(tx))
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl Subscription {
    pub(crate) fn new(
        topic: String,
        channel: String,
        endpoint: Endpoint,
        cancel: CancelHandle,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            topic,
            channel,
            endpoint,
            cancel,
            task,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The nsqd endpoint this subscription is bound to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Ask the loop to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to exit (after `cancel`, or when its connection
    /// closes for good).
    pub async fn stopped(self) {
        let _ = self.task.await;
    }
}
