use bytes::Bytes;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, Endpoint};
use crate::connection::Connection;
use crate::error::NsqError;
use crate::frame::{Command, Frame, Message, MessageId};
use crate::pool::ConnectionPool;
use crate::subscription::{CancelHandle, Subscription};

/// Error type returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

const EVENT_CAPACITY: usize = 64;

/// Processes messages delivered to a subscription.
///
/// Returning `Err` (or panicking) requeues the message; returning `Ok`
/// finishes it. Closures of the right shape implement this trait.
pub trait Handler: Send + 'static {
    fn handle(&mut self, message: &Message) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: FnMut(&Message) -> Result<(), HandlerError> + Send + 'static,
{
    fn handle(&mut self, message: &Message) -> Result<(), HandlerError> {
        self(message)
    }
}

/// How a delivered message is settled with nsqd. Exactly one per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handler succeeded: `FIN` then `RDY 1`.
    Finished,
    /// Handler failed: `TOUCH` then `REQ` with the delay.
    Requeued(Duration),
}

impl Resolution {
    /// The commands that settle message `id`, in send order.
    ///
    /// A requeue does not re-send `RDY`: nsqd treats the ready count as a
    /// level, and the `REQ` already frees the in-flight slot.
    pub fn commands(&self, id: MessageId) -> Vec<Command> {
        match self {
            Resolution::Finished => vec![Command::Fin(id), Command::Rdy(1)],
            Resolution::Requeued(delay) => vec![
                Command::Touch(id),
                Command::Req { id, delay: *delay },
            ],
        }
    }
}

/// Failures the client swallows, published for operational tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    PublishFailed {
        command: &'static str,
        topic: String,
        reason: String,
    },
    SubscribeFailed {
        topic: String,
        channel: String,
        reason: String,
    },
    MessageRequeued {
        message_id: MessageId,
        attempts: u16,
        reason: String,
    },
    UnexpectedFrame {
        endpoint: String,
        frame: String,
    },
}

/// Publishes to and subscribes from nsqd through a `ConnectionPool`.
///
/// `publish*` and `subscribe` never return an error: failures are logged
/// and sent to `events()`. The `try_*` variants return them instead.
/// A publish completes once its command has been written to the socket.
#[derive(Clone)]
pub struct Client {
    pool: Arc<ConnectionPool>,
    config: ClientConfig,
    events: broadcast::Sender<ClientEvent>,
}

impl Client {
    /// Build the pool from `endpoints` and wrap it in a client.
    pub async fn connect<I>(endpoints: I, config: ClientConfig) -> Result<Self, NsqError>
    where
        I: IntoIterator<Item = Endpoint>,
    {
        let pool = ConnectionPool::connect(endpoints, &config).await?;
        Ok(Self::new(pool, config))
    }

    pub fn new(pool: ConnectionPool, config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pool: Arc::new(pool),
            config,
            events,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Subscribe to swallowed failures.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Bind a topic name for chained publish / subscribe calls.
    pub fn topic(&self, name: impl Into<String>) -> Topic<'_> {
        Topic {
            client: self,
            name: name.into(),
        }
    }

    pub async fn try_publish(&self, topic: &str, body: impl Into<Bytes>) -> Result<(), NsqError> {
        self.send_publish(Command::Pub {
            topic: topic.to_string(),
            body: body.into(),
        })
        .await
    }

    pub async fn try_publish_multi<I, B>(&self, topic: &str, bodies: I) -> Result<(), NsqError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.send_publish(Command::Mpub {
            topic: topic.to_string(),
            bodies: bodies.into_iter().map(Into::into).collect(),
        })
        .await
    }

    pub async fn try_publish_defer(
        &self,
        topic: &str,
        body: impl Into<Bytes>,
        delay: Duration,
    ) -> Result<(), NsqError> {
        self.send_publish(Command::Dpub {
            topic: topic.to_string(),
            delay,
            body: body.into(),
        })
        .await
    }

    /// Publish one message; fire-and-forget.
    pub async fn publish(&self, topic: &str, body: impl Into<Bytes>) {
        if let Err(e) = self.try_publish(topic, body).await {
            self.publish_failed("PUB", topic, e);
        }
    }

    /// Publish several messages in one `MPUB`; fire-and-forget.
    pub async fn publish_multi<I, B>(&self, topic: &str, bodies: I)
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        if let Err(e) = self.try_publish_multi(topic, bodies).await {
            self.publish_failed("MPUB", topic, e);
        }
    }

    /// Publish one message that nsqd holds back for `delay`; fire-and-forget.
    pub async fn publish_defer(&self, topic: &str, body: impl Into<Bytes>, delay: Duration) {
        if let Err(e) = self.try_publish_defer(topic, body, delay).await {
            self.publish_failed("DPUB", topic, e);
        }
    }

    async fn send_publish(&self, command: Command) -> Result<(), NsqError> {
        let conn = self.pool.select()?;
        debug!(endpoint = %conn.endpoint(), command = %command, "publish");
        conn.write(command).await
    }

    fn publish_failed(&self, command: &'static str, topic: &str, err: NsqError) {
        error!(%topic, command, error = %err, "publish error");
        self.emit(ClientEvent::PublishFailed {
            command,
            topic: topic.to_string(),
            reason: err.to_string(),
        });
    }

    fn emit(&self, event: ClientEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Start a subscribe loop for `topic` / `channel`.
    ///
    /// Returns `None` (after logging and emitting `SubscribeFailed`) when no
    /// connection is available, the names cannot be framed, or the initial
    /// `SUB` / `RDY` could not be sent.
    pub async fn subscribe<H: Handler>(
        &self,
        topic: &str,
        channel: &str,
        handler: H,
    ) -> Option<Subscription> {
        match self.try_subscribe(topic, channel, handler).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                error!(%topic, %channel, error = %e, "subscribe error");
                self.emit(ClientEvent::SubscribeFailed {
                    topic: topic.to_string(),
                    channel: channel.to_string(),
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    /// Like `subscribe`, returning the setup error instead of swallowing it.
    ///
    /// The loop is bound to one connection for its whole lifetime, chosen
    /// among the pooled connections not already carrying a subscription
    /// (`PoolExhausted` when there is none). Frames are handled as follows:
    /// - heartbeat: `NOP`
    /// - message: handler, then the commands of its `Resolution`
    /// - `OK`: logged
    /// - error or other response: logged, the loop keeps going
    pub async fn try_subscribe<H: Handler>(
        &self,
        topic: &str,
        channel: &str,
        handler: H,
    ) -> Result<Subscription, NsqError> {
        let sub = Command::Sub {
            topic: topic.to_string(),
            channel: channel.to_string(),
        };
        sub.validate(self.config.max_frame_bytes)?;

        let (conn, frames) = self.claim_connection(topic, channel).await?;
        let armed = match conn.send(sub).await {
            Ok(()) => conn.send(Command::Rdy(1)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = armed {
            conn.detach().await;
            return Err(e);
        }
        info!(endpoint = %conn.endpoint(), %topic, %channel, "subscribed");

        let endpoint = conn.endpoint().clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel = CancelHandle::new(cancel_tx);
        let sub_loop = SubscribeLoop {
            conn,
            topic: topic.to_string(),
            channel: channel.to_string(),
            handler,
            requeue_delay: self.config.requeue_delay,
            events: self.events.clone(),
        };
        let task = tokio::spawn(sub_loop.run(frames, cancel_rx));

        Ok(Subscription::new(
            topic.to_string(),
            channel.to_string(),
            endpoint,
            cancel,
            task,
        ))
    }

    /// Attach to a free connection, retrying when a concurrent subscribe
    /// claims the chosen one first.
    async fn claim_connection(
        &self,
        topic: &str,
        channel: &str,
    ) -> Result<(Connection, mpsc::Receiver<Frame>), NsqError> {
        let mut attempts = self.pool.len();
        loop {
            let conn = self.pool.select_free().await?;
            match conn.attach(topic, channel).await {
                Ok(frames) => return Ok((conn, frames)),
                Err(NsqError::Transport(e))
                    if e.kind() == io::ErrorKind::AddrInUse && attempts > 1 =>
                {
                    attempts -= 1;
                    debug!(endpoint = %conn.endpoint(), "connection claimed concurrently; picking another");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Shut down every pooled connection.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// A topic bound to a client; see `Client::topic`.
pub struct Topic<'a> {
    client: &'a Client,
    name: String,
}

impl<'a> Topic<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn publish(&self, body: impl Into<Bytes>) {
        self.client.publish(&self.name, body).await
    }

    pub async fn publish_multi<I, B>(&self, bodies: I)
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.client.publish_multi(&self.name, bodies).await
    }

    pub async fn publish_defer(&self, body: impl Into<Bytes>, delay: Duration) {
        self.client.publish_defer(&self.name, body, delay).await
    }

    pub fn channel(&self, name: impl Into<String>) -> Channel<'a> {
        Channel {
            client: self.client,
            topic: self.name.clone(),
            name: name.into(),
        }
    }
}

/// A topic / channel pair bound to a client.
pub struct Channel<'a> {
    client: &'a Client,
    topic: String,
    name: String,
}

impl Channel<'_> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn subscribe<H: Handler>(&self, handler: H) -> Option<Subscription> {
        self.client.subscribe(&self.topic, &self.name, handler).await
    }
}

struct SubscribeLoop<H> {
    conn: Connection,
    topic: String,
    channel: String,
    handler: H,
    requeue_delay: Duration,
    events: broadcast::Sender<ClientEvent>,
}

impl<H: Handler> SubscribeLoop<H> {
    async fn run(mut self, mut frames: mpsc::Receiver<Frame>, mut cancel_rx: watch::Receiver<bool>) {
        // Disarmed once the Subscription handle is dropped.
        let mut cancel_armed = true;
        loop {
            tokio::select! {
                biased;
                changed = cancel_rx.changed(), if cancel_armed => {
                    match changed {
                        Ok(()) if *cancel_rx.borrow() => {
                            info!(endpoint = %self.conn.endpoint(), topic = %self.topic, channel = %self.channel, "subscription cancelled");
                            if let Err(e) = self.conn.send(Command::Rdy(0)).await {
                                debug!(error = %e, "could not send RDY 0 on cancel");
                            }
                            self.conn.detach().await;
                            return;
                        }
                        Ok(()) => {}
                        Err(_) => cancel_armed = false,
                    }
                }
                frame = frames.recv() => {
                    match frame {
                        Some(frame) => self.dispatch(frame).await,
                        None => {
                            warn!(endpoint = %self.conn.endpoint(), topic = %self.topic, channel = %self.channel, "connection closed; subscription loop ending");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) {
        for command in self.react(frame) {
            if let Err(e) = self.conn.send(command).await {
                warn!(endpoint = %self.conn.endpoint(), error = %e, "failed to send command from subscribe loop");
                break;
            }
        }
    }

    /// Decide which commands answer `frame`.
    fn react(&mut self, frame: Frame) -> Vec<Command> {
        match frame {
            Frame::Heartbeat => {
                debug!(endpoint = %self.conn.endpoint(), "heartbeat");
                vec![Command::Nop]
            }
            Frame::Message(message) => {
                let resolution = self.resolve(&message);
                resolution.commands(message.id)
            }
            Frame::Ok => {
                info!(endpoint = %self.conn.endpoint(), "ignoring OK frame in subscribe loop");
                Vec::new()
            }
            other => {
                error!(endpoint = %self.conn.endpoint(), frame = %other, "error/unexpected frame received");
                let _ = self.events.send(ClientEvent::UnexpectedFrame {
                    endpoint: self.conn.endpoint().key(),
                    frame: other.to_string(),
                });
                Vec::new()
            }
        }
    }

    fn resolve(&mut self, message: &Message) -> Resolution {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(message)));
        let reason = match outcome {
            Ok(Ok(())) => return Resolution::Finished,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_reason(payload.as_ref()),
        };

        let _ = self.events.send(ClientEvent::MessageRequeued {
            message_id: message.id,
            attempts: message.attempts,
            reason: reason.clone(),
        });
        let failure = NsqError::Callback {
            message_id: message.id,
            reason,
        };
        warn!(
            topic = %self.topic,
            channel = %self.channel,
            attempts = message.attempts,
            error = %failure,
            "will be requeued"
        );
        Resolution::Requeued(self.requeue_delay)
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
