use futures::{Sink, SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{MAGIC_V2, NsqCodec};
use crate::config::{ClientConfig, Endpoint};
use crate::error::NsqError;
use crate::frame::{Command, Frame};

/// Health of a connection's background session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Session is up; commands are accepted.
    Connected,
    /// Session was lost; waiting out the backoff before the next attempt.
    Failed,
    /// A reconnect attempt is in progress.
    Reconnecting,
    /// Closed by `close()` or because every handle was dropped.
    Closed,
}

/// Sender for the subscription attached to this connection, if any.
pub(crate) type Route = Arc<Mutex<Option<mpsc::Sender<Frame>>>>;

/// `(topic, channel)` replayed as `SUB` + `RDY 1` after a reconnect.
pub(crate) type Binding = Arc<Mutex<Option<(String, String)>>>;

/// Resolved by the session once the command has been written, or failed.
type Written = oneshot::Sender<Result<(), NsqError>>;

/// A queued command plus, for `write`, the caller waiting on it.
pub(crate) struct Outbound {
    pub(crate) command: Command,
    written: Option<Written>,
}

impl Outbound {
    fn resolve(self, result: Result<(), NsqError>) {
        if let Some(tx) = self.written {
            let _ = tx.send(result);
        }
    }
}

/// Handle on one nsqd connection.
///
/// `Connection` is cheap to clone. A background task owns the socket,
/// writes queued commands in order, decodes inbound frames with `NsqCodec`
/// and forwards them to the attached subscription. With no subscription
/// attached it answers heartbeats itself. Connections created with
/// `connect` reconnect with exponential backoff.
#[derive(Clone)]
pub struct Connection {
    endpoint: Endpoint,
    outbound_tx: mpsc::Sender<Outbound>,
    route: Route,
    binding: Binding,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: broadcast::Sender<()>,
    max_frame_bytes: usize,
    queue_depth: usize,
}

/// State owned by the background task.
struct Session {
    endpoint: Endpoint,
    route: Route,
    binding: Binding,
    state_tx: watch::Sender<ConnectionState>,
    max_frame_bytes: usize,
}

enum SessionEnd {
    Shutdown,
    Lost,
}

impl Connection {
    /// Open a TCP connection to `endpoint` and spawn its background task.
    ///
    /// The first connect attempt happens before this returns, so an
    /// unreachable nsqd is reported as `NsqError::Transport`. Later losses
    /// are handled by the task: it retries after `config.reconnect_backoff`,
    /// doubling up to `config.max_backoff`, and replays the bound
    /// subscription once it is back.
    pub async fn connect(endpoint: Endpoint, config: &ClientConfig) -> Result<Self, NsqError> {
        let stream = open_stream(&endpoint, config.connect_timeout).await?;
        info!(endpoint = %endpoint, "connected to nsqd");

        let (conn, session, out_rx, shutdown_rx) = Self::parts(endpoint, config);
        tokio::spawn(session.run_with_reconnect(stream, out_rx, shutdown_rx, config.clone()));
        Ok(conn)
    }

    /// Run a single session over an already-established transport.
    ///
    /// There is no reconnect: once the transport fails the connection moves
    /// to `Failed` for good. Useful for custom transports (a TLS stream, an
    /// in-memory pipe) and must be called from within a tokio runtime.
    pub fn from_transport<T>(endpoint: Endpoint, io: T, config: &ClientConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (conn, session, mut out_rx, mut shutdown_rx) = Self::parts(endpoint, config);
        tokio::spawn(async move {
            let end = session.drive(io, &mut out_rx, &mut shutdown_rx, false).await;
            let last = match end {
                SessionEnd::Shutdown => ConnectionState::Closed,
                SessionEnd::Lost => {
                    session.fail_pending(&mut out_rx);
                    ConnectionState::Failed
                }
            };
            session.finish(last).await;
        });
        conn
    }

    fn parts(
        endpoint: Endpoint,
        config: &ClientConfig,
    ) -> (
        Self,
        Session,
        mpsc::Receiver<Outbound>,
        broadcast::Receiver<()>,
    ) {
        let (outbound_tx, out_rx) = mpsc::channel::<Outbound>(config.queue_depth);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let route: Route = Arc::new(Mutex::new(None));
        let binding: Binding = Arc::new(Mutex::new(None));

        let session = Session {
            endpoint: endpoint.clone(),
            route: route.clone(),
            binding: binding.clone(),
            state_tx,
            max_frame_bytes: config.max_frame_bytes,
        };
        let conn = Connection {
            endpoint,
            outbound_tx,
            route,
            binding,
            state_rx,
            shutdown_tx,
            max_frame_bytes: config.max_frame_bytes,
            queue_depth: config.queue_depth,
        };
        (conn, session, out_rx, shutdown_rx)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Wait until the connection reaches `wanted`.
    ///
    /// Returns a transport error if the background task ends first.
    pub async fn wait_for_state(&self, wanted: ConnectionState) -> Result<(), NsqError> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|state| *state == wanted)
            .await
            .map(|_| ())
            .map_err(|_| NsqError::closed())
    }

    /// Queue a command for the background writer.
    ///
    /// The command is validated here so framing problems come back to the
    /// caller as `NsqError::Encode`. Commands are refused with
    /// `ErrorKind::NotConnected` while the session is down.
    pub async fn send(&self, command: Command) -> Result<(), NsqError> {
        self.enqueue(command, None).await
    }

    /// Like `send`, but wait until the command has been written to the
    /// socket. Write failures and sessions lost with the command still
    /// queued come back as `NsqError::Transport`.
    pub async fn write(&self, command: Command) -> Result<(), NsqError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(command, Some(tx)).await?;
        rx.await.unwrap_or_else(|_| Err(NsqError::closed()))
    }

    async fn enqueue(&self, command: Command, written: Option<Written>) -> Result<(), NsqError> {
        command.validate(self.max_frame_bytes)?;
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(not_connected(&self.endpoint, state));
        }
        self.outbound_tx
            .send(Outbound { command, written })
            .await
            .map_err(|_| NsqError::closed())
    }

    /// True while a live subscription is attached.
    pub async fn is_attached(&self) -> bool {
        self.route
            .lock()
            .await
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Attach a subscription and return the receiver for its frames.
    ///
    /// nsqd allows one `SUB` per connection, so a second attach while the
    /// first receiver is alive fails with `ErrorKind::AddrInUse`.
    pub async fn attach(
        &self,
        topic: &str,
        channel: &str,
    ) -> Result<mpsc::Receiver<Frame>, NsqError> {
        if self.state() == ConnectionState::Closed {
            return Err(NsqError::closed());
        }
        let mut route = self.route.lock().await;
        if route.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(NsqError::Transport(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("connection to {} already carries a subscription", self.endpoint),
            )));
        }
        let (tx, rx) = mpsc::channel::<Frame>(self.queue_depth);
        *route = Some(tx);
        *self.binding.lock().await = Some((topic.to_string(), channel.to_string()));
        Ok(rx)
    }

    /// Drop the attached subscription, if any.
    pub async fn detach(&self) {
        *self.route.lock().await = None;
        *self.binding.lock().await = None;
    }

    /// Signal the background task to close the socket and stop.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Session {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    async fn run_with_reconnect(
        self,
        first: TcpStream,
        mut out_rx: mpsc::Receiver<Outbound>,
        mut shutdown_rx: broadcast::Receiver<()>,
        config: ClientConfig,
    ) {
        let mut stream = Some(first);
        let mut replay = false;
        let mut backoff = config.reconnect_backoff;

        loop {
            if let Some(io) = stream.take() {
                match self.drive(io, &mut out_rx, &mut shutdown_rx, replay).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost => {
                        self.set_state(ConnectionState::Failed);
                        warn!(endpoint = %self.endpoint, "connection to nsqd lost");
                        self.fail_pending(&mut out_rx);
                    }
                }
                replay = true;
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(backoff) => {}
            }

            self.set_state(ConnectionState::Reconnecting);
            match open_stream(&self.endpoint, config.connect_timeout).await {
                Ok(s) => {
                    info!(endpoint = %self.endpoint, "reconnected to nsqd");
                    stream = Some(s);
                    backoff = config.reconnect_backoff;
                }
                Err(e) => {
                    warn!(
                        endpoint = %self.endpoint,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "reconnect failed"
                    );
                    self.set_state(ConnectionState::Failed);
                    backoff = (backoff * 2).min(config.max_backoff);
                }
            }
        }

        self.finish(ConnectionState::Closed).await;
    }

    /// Fail everything still queued for a lost session. Acks and RDY
    /// counts belong to that session, so nothing is carried over.
    fn fail_pending(&self, out_rx: &mut mpsc::Receiver<Outbound>) {
        let mut dropped = 0usize;
        while let Ok(out) = out_rx.try_recv() {
            dropped += 1;
            out.resolve(Err(not_connected(&self.endpoint, ConnectionState::Failed)));
        }
        if dropped > 0 {
            warn!(endpoint = %self.endpoint, dropped, "discarded commands queued for a lost session");
        }
    }

    async fn finish(&self, last: ConnectionState) {
        // Dropping the route sender ends any subscription loop on this connection.
        *self.route.lock().await = None;
        self.set_state(last);
        debug!(endpoint = %self.endpoint, state = ?last, "connection task finished");
    }

    async fn drive<T>(
        &self,
        mut io: T,
        out_rx: &mut mpsc::Receiver<Outbound>,
        shutdown_rx: &mut broadcast::Receiver<()>,
        replay: bool,
    ) -> SessionEnd
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(e) = io.write_all(MAGIC_V2).await {
            warn!(endpoint = %self.endpoint, error = %e, "failed to write protocol magic");
            return SessionEnd::Lost;
        }

        let framed = Framed::new(io, NsqCodec::with_max_frame_bytes(self.max_frame_bytes));
        let (mut sink, mut stream) = framed.split();
        self.set_state(ConnectionState::Connected);

        if replay {
            let bound = self.binding.lock().await.clone();
            if let Some((topic, channel)) = bound {
                info!(endpoint = %self.endpoint, %topic, %channel, "resubscribing after reconnect");
                for cmd in [Command::Sub { topic, channel }, Command::Rdy(1)] {
                    if sink.send(cmd).await.is_err() {
                        return SessionEnd::Lost;
                    }
                }
            }
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    // Commands queued before close() still go out.
                    while let Ok(out) = out_rx.try_recv() {
                        let result = sink.send(out.command.clone()).await;
                        let failed = result.is_err();
                        out.resolve(result);
                        if failed {
                            break;
                        }
                    }
                    if self.binding.lock().await.is_some() {
                        let _ = sink.send(Command::Cls).await;
                    }
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
                maybe = out_rx.recv() => {
                    match maybe {
                        Some(out) => {
                            trace!(endpoint = %self.endpoint, command = %out.command, "send");
                            match sink.send(out.command.clone()).await {
                                Ok(()) => out.resolve(Ok(())),
                                Err(NsqError::Encode(reason)) => {
                                    error!(endpoint = %self.endpoint, %reason, "dropping command that cannot be framed");
                                    out.resolve(Err(NsqError::Encode(reason)));
                                }
                                Err(e) => {
                                    warn!(endpoint = %self.endpoint, command = out.command.name(), error = %e, "write to nsqd failed");
                                    out.resolve(Err(e));
                                    return SessionEnd::Lost;
                                }
                            }
                        }
                        None => {
                            let _ = sink.close().await;
                            return SessionEnd::Shutdown;
                        }
                    }
                }
                item = stream.next() => {
                    match item {
                        Some(Ok(frame)) => {
                            if let Err(e) = self.route_frame(frame, &mut sink).await {
                                warn!(endpoint = %self.endpoint, error = %e, "write to nsqd failed");
                                return SessionEnd::Lost;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(endpoint = %self.endpoint, error = %e, "failed to decode frame from nsqd");
                            return SessionEnd::Lost;
                        }
                        None => {
                            debug!(endpoint = %self.endpoint, "nsqd closed the connection");
                            return SessionEnd::Lost;
                        }
                    }
                }
            }
        }
    }

    /// Forward `frame` to the attached subscription, or handle it here.
    async fn route_frame<S>(&self, frame: Frame, sink: &mut S) -> Result<(), NsqError>
    where
        S: Sink<Command, Error = NsqError> + Unpin,
    {
        let sender = self.route.lock().await.clone();
        let Some(tx) = sender else {
            return self.handle_unrouted(frame, sink).await;
        };
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) => {
                warn!(endpoint = %self.endpoint, frame = %frame, "subscription queue full; handling frame on connection task");
                self.handle_unrouted(frame, sink).await
            }
            Err(TrySendError::Closed(frame)) => {
                {
                    let mut route = self.route.lock().await;
                    if route.as_ref().is_some_and(|cur| cur.same_channel(&tx)) {
                        *route = None;
                    }
                }
                self.handle_unrouted(frame, sink).await
            }
        }
    }

    async fn handle_unrouted<S>(&self, frame: Frame, sink: &mut S) -> Result<(), NsqError>
    where
        S: Sink<Command, Error = NsqError> + Unpin,
    {
        match frame {
            Frame::Heartbeat => {
                debug!(endpoint = %self.endpoint, "answering heartbeat");
                sink.send(Command::Nop).await
            }
            Frame::Ok => {
                trace!(endpoint = %self.endpoint, "OK");
                Ok(())
            }
            Frame::Response(data) => {
                debug!(endpoint = %self.endpoint, response = %String::from_utf8_lossy(&data), "response");
                Ok(())
            }
            Frame::Error(data) => {
                warn!(endpoint = %self.endpoint, error = %String::from_utf8_lossy(&data), "nsqd returned an error");
                Ok(())
            }
            Frame::Message(m) => {
                // Nobody can take it: hand it straight back.
                warn!(endpoint = %self.endpoint, message_id = %m.id, "requeueing message no subscription could take");
                sink.send(Command::Req {
                    id: m.id,
                    delay: Duration::ZERO,
                })
                .await
            }
        }
    }
}

fn not_connected(endpoint: &Endpoint, state: ConnectionState) -> NsqError {
    NsqError::Transport(io::Error::new(
        io::ErrorKind::NotConnected,
        format!("connection to {} is {:?}", endpoint, state),
    ))
}

async fn open_stream(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream, NsqError> {
    match tokio::time::timeout(timeout, TcpStream::connect((endpoint.host(), endpoint.port())))
        .await
    {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(NsqError::Transport(e)),
        Err(_) => Err(NsqError::Transport(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {} timed out after {:?}", endpoint, timeout),
        ))),
    }
}

#[cfg(test)]
impl Connection {
    /// A connection with no background task: commands land in the `Outbox`.
    pub(crate) fn detached(endpoint: Endpoint, depth: usize) -> (Self, Outbox) {
        let (outbound_tx, out_rx) = mpsc::channel::<Outbound>(depth);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let conn = Connection {
            endpoint,
            outbound_tx,
            route: Arc::new(Mutex::new(None)),
            binding: Arc::new(Mutex::new(None)),
            state_rx,
            shutdown_tx,
            max_frame_bytes: crate::codec::DEFAULT_MAX_FRAME_BYTES,
            queue_depth: 8,
        };
        (conn, Outbox(out_rx))
    }

    /// Push a frame to the attached subscription as if nsqd had sent it.
    pub(crate) async fn inject(&self, frame: Frame) -> bool {
        let tx = self.route.lock().await.clone();
        match tx {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }
}

/// Receiving end of a detached connection. Every command taken out of it
/// counts as written.
#[cfg(test)]
pub(crate) struct Outbox(mpsc::Receiver<Outbound>);

#[cfg(test)]
impl Outbox {
    pub(crate) async fn recv(&mut self) -> Option<Command> {
        let out = self.0.recv().await?;
        let command = out.command.clone();
        out.resolve(Ok(()));
        Some(command)
    }

    pub(crate) fn try_recv(&mut self) -> Result<Command, mpsc::error::TryRecvError> {
        let out = self.0.try_recv()?;
        let command = out.command.clone();
        out.resolve(Ok(()));
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_test_connection() -> (Connection, Outbox) {
        Connection::detached(Endpoint::new("a", 4150), 8)
    }

    #[tokio::test]
    async fn send_rejects_unframeable_command_before_queueing() {
        let (conn, mut out_rx) = setup_test_connection();
        let err = conn
            .send(Command::Pub {
                topic: "no spaces allowed".into(),
                body: "x".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, NsqError::Encode(_)));
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_preserves_issue_order() {
        let (conn, mut out_rx) = setup_test_connection();
        conn.send(Command::Rdy(1)).await.unwrap();
        conn.send(Command::Nop).await.unwrap();
        assert_eq!(out_rx.recv().await, Some(Command::Rdy(1)));
        assert_eq!(out_rx.recv().await, Some(Command::Nop));
    }

    #[tokio::test]
    async fn second_attach_is_refused_until_detach() {
        let (conn, _out_rx) = setup_test_connection();
        let _frames = conn.attach("t", "c").await.expect("first attach");

        match conn.attach("t", "c2").await {
            Err(NsqError::Transport(e)) => assert_eq!(e.kind(), io::ErrorKind::AddrInUse),
            other => panic!("expected AddrInUse, got {:?}", other.map(|_| ())),
        }

        conn.detach().await;
        assert!(conn.attach("t", "c2").await.is_ok());
        assert_eq!(
            conn.binding.lock().await.clone(),
            Some(("t".to_string(), "c2".to_string()))
        );
    }

    #[tokio::test]
    async fn attach_after_receiver_dropped_succeeds() {
        let (conn, _out_rx) = setup_test_connection();
        drop(conn.attach("t", "c").await.unwrap());
        assert!(conn.attach("t", "c").await.is_ok());
    }

    #[tokio::test]
    async fn send_fails_when_writer_is_gone() {
        let (conn, out_rx) = setup_test_connection();
        drop(out_rx);
        let err = conn.send(Command::Nop).await.unwrap_err();
        assert!(matches!(err, NsqError::Transport(_)));
    }

    #[tokio::test]
    async fn write_waits_for_the_writer() {
        let (conn, mut out_rx) = setup_test_connection();
        let (written, seen) = tokio::join!(conn.write(Command::Nop), out_rx.recv());
        assert!(written.is_ok());
        assert_eq!(seen, Some(Command::Nop));
    }

    #[tokio::test]
    async fn write_fails_when_command_is_discarded() {
        let (conn, out_rx) = setup_test_connection();
        let writer = conn.clone();
        let pending = tokio::spawn(async move { writer.write(Command::Nop).await });
        // let the command reach the queue, then drop it unwritten
        while out_rx.0.is_empty() {
            tokio::task::yield_now().await;
        }
        drop(out_rx);
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, NsqError::Transport(_)));
    }

    #[tokio::test]
    async fn is_attached_follows_the_route() {
        let (conn, _out_rx) = setup_test_connection();
        assert!(!conn.is_attached().await);
        let frames = conn.attach("t", "c").await.unwrap();
        assert!(conn.is_attached().await);
        drop(frames);
        assert!(!conn.is_attached().await);
    }
}
