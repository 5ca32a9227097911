//! Multiplexed connection to a proxy mediator.
//!
//! # Architecture
//!
//! ```text
//!  callers                         Connection                       mediator
//!  ───────                         ──────────                       ────────
//!  send_cmd ──► request(id=n) ──► write queue ──► writer task ─────►
//!     ▲                                                               │
//!     └── oneshot ◄── pending[n] ◄── reader task ◄────────────────────┘
//!                                      │
//!  stdout/stderr ◄── pipe ◄── pump ◄───┴── routes[stream id] / parked
//!  stdin ──► pipe ──► pump ──► write queue (StreamData / StreamClose)
//! ```
//!
//! One reader task owns the read half and demultiplexes every incoming
//! frame. One writer task owns the write half; everything else queues whole
//! frames for it, so a cancelled caller never leaves a partial frame on the
//! wire.
//!
//! Output for stream ids announced in a control reply is parked until
//! [`Connection::attach`] claims it, so data the mediator sends right after
//! the handshake is not lost.

use crate::config::ProxyConfig;
use crate::constants::{
    MAX_PARKED_OUTPUT, OUTPUT_BACKLOG, STREAM_CHUNK_SIZE, STREAM_PIPE_CAPACITY, WRITE_QUEUE_DEPTH,
};
use crate::error::{Error, Result};
use crate::pod::{Endpoint, PodId};
use crate::protocol::{
    ControlRequest, ControlResponse, ErrorCode, Frame, FrameError, FrameKind, SessionPayload,
};
use crate::proxy::{Command, Reply};
use crate::stream::{IoStream, StreamIds};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

// =============================================================================
// Dialing
// =============================================================================

/// Byte stream usable as a mediator transport.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TransportStream for T {}

/// Boxed transport returned by a [`Dialer`].
pub type BoxedTransport = Box<dyn TransportStream>;

/// Opens transports to mediator endpoints.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connects to `endpoint`.
    async fn dial(&self, endpoint: &Endpoint) -> Result<BoxedTransport>;
}

/// Dials Unix, TCP, and vsock endpoints with tokio sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketDialer;

#[async_trait]
impl Dialer for SocketDialer {
    async fn dial(&self, endpoint: &Endpoint) -> Result<BoxedTransport> {
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| Error::transport(endpoint, e))?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(Error::transport(
                endpoint,
                "unix sockets not supported on this platform",
            )),
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr)
                    .await
                    .map_err(|e| Error::transport(endpoint, e))?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(not(target_os = "windows"))]
            Endpoint::Vsock { cid, port } => {
                let addr = tokio_vsock::VsockAddr::new(*cid, *port);
                let stream = tokio_vsock::VsockStream::connect(addr)
                    .await
                    .map_err(|e| Error::transport(endpoint, e))?;
                Ok(Box::new(stream))
            }
            #[cfg(target_os = "windows")]
            Endpoint::Vsock { .. } => Err(Error::transport(
                endpoint,
                "vsock not supported on this platform",
            )),
        }
    }
}

// =============================================================================
// Shared State
// =============================================================================

#[derive(Default)]
struct State {
    /// Requests awaiting a reply, by request id.
    pending: HashMap<u64, oneshot::Sender<Frame>>,
    /// Output streams, by stream id.
    routes: HashMap<u64, mpsc::Sender<Vec<u8>>>,
    /// Announced output streams not yet attached.
    parked: HashMap<u64, Parked>,
    /// Stdin pumps, aborted on shutdown.
    inputs: Vec<JoinHandle<()>>,
    /// Set once the connection is unusable.
    closed: Option<String>,
}

#[derive(Default)]
struct Parked {
    chunks: Vec<Vec<u8>>,
    bytes: usize,
    /// End of stream seen, or the buffer overflowed.
    closed: bool,
}

type SharedState = Arc<Mutex<State>>;

fn lock(state: &SharedState) -> std::sync::MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Marks the connection closed and wakes everything waiting on it.
fn close_state(state: &SharedState, reason: &str) {
    let mut st = lock(state);
    if st.closed.is_none() {
        st.closed = Some(reason.to_string());
    }
    // Dropping senders fails pending requests and ends output pipes.
    st.pending.clear();
    st.routes.clear();
    st.parked.clear();
    for pump in st.inputs.drain(..) {
        pump.abort();
    }
}

enum Outbound {
    Frame(Frame),
    /// Flush what is queued, then shut the write half down.
    Shutdown(oneshot::Sender<()>),
}

/// Queue in front of the writer task.
#[derive(Clone)]
struct FrameSink {
    tx: mpsc::Sender<Outbound>,
    state: SharedState,
    endpoint: Arc<str>,
    max_payload: usize,
}

impl FrameSink {
    /// Queues `frame` for the writer task.
    ///
    /// Dropping the returned future either queues the whole frame or
    /// nothing.
    async fn send(&self, frame: Frame) -> Result<()> {
        if frame.payload.len() > self.max_payload {
            return Err(FrameError::TooLarge {
                len: frame.payload.len(),
                max: self.max_payload,
            }
            .into());
        }
        if lock(&self.state).closed.is_some() {
            return Err(self.closed_error());
        }
        self.tx
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> Error {
        let reason = lock(&self.state)
            .closed
            .clone()
            .unwrap_or_else(|| "connection writer stopped".to_string());
        Error::transport(&self.endpoint, reason)
    }
}

/// Removes a pending entry when the waiting future finishes or is dropped.
struct PendingGuard<'a> {
    state: &'a SharedState,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.state).pending.remove(&self.id);
    }
}

// =============================================================================
// Connection
// =============================================================================

/// A live, multiplexed connection to a mediator.
pub struct Connection {
    sink: FrameSink,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    next_request: AtomicU64,
    request_timeout: Duration,
}

impl Connection {
    /// Dials `endpoint` and starts the reader and writer tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if dialing exceeds the configured dial
    /// timeout, or the dialer's error.
    pub async fn open(
        dialer: &dyn Dialer,
        endpoint: &Endpoint,
        config: &ProxyConfig,
    ) -> Result<Arc<Self>> {
        let transport = timeout(config.dial_timeout, dialer.dial(endpoint))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("dial {endpoint}"),
                duration: config.dial_timeout,
            })??;
        debug!(endpoint = %endpoint, "connected to proxy mediator");
        Ok(Self::new(transport, endpoint.to_string(), config))
    }

    /// Wraps an established transport and starts the reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        transport: BoxedTransport,
        endpoint: impl Into<String>,
        config: &ProxyConfig,
    ) -> Arc<Self> {
        let endpoint: Arc<str> = endpoint.into().into();
        let max_payload = config.max_frame_payload.min(u32::MAX as usize);
        let (read_half, write_half) = tokio::io::split(transport);
        let state: SharedState = Arc::default();
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

        let reader = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&state),
            Arc::clone(&endpoint),
            max_payload,
        ));
        let writer = tokio::spawn(write_loop(
            write_half,
            rx,
            Arc::clone(&state),
            Arc::clone(&endpoint),
        ));

        Arc::new(Self {
            sink: FrameSink {
                tx,
                state,
                endpoint,
                max_payload,
            },
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            next_request: AtomicU64::new(1),
            request_timeout: config.request_timeout,
        })
    }

    /// Returns the endpoint label used in errors and logs.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.sink.endpoint
    }

    /// Returns true once the connection can no longer carry requests.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.sink.state).closed.is_some()
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        lock(&self.sink.state).pending.len()
    }

    /// Sends a request frame and waits for the frame answering it.
    async fn request(&self, kind: FrameKind, payload: Vec<u8>, operation: &str) -> Result<Frame> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut st = lock(&self.sink.state);
            if let Some(reason) = &st.closed {
                return Err(Error::transport(&self.sink.endpoint, reason));
            }
            st.pending.insert(id, tx);
        }
        let _guard = PendingGuard {
            state: &self.sink.state,
            id,
        };

        self.sink.send(Frame::new(kind, id, payload)).await?;

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(self.sink.closed_error()),
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                duration: self.request_timeout,
            }),
        }
    }

    /// Performs a control handshake.
    ///
    /// # Errors
    ///
    /// Mediator error codes map to [`Error::SessionAlreadyExists`],
    /// [`Error::SessionNotFound`], [`Error::Protocol`] (bad request), or
    /// [`Error::Transport`] (mediator-internal failure).
    pub async fn control(&self, request: &ControlRequest) -> Result<SessionPayload> {
        let pod = request.pod();
        let payload = serde_json::to_vec(request)?;
        let frame = self
            .request(FrameKind::Control, payload, request.action())
            .await?;
        if frame.kind != FrameKind::ControlReply {
            return Err(Error::Protocol(format!(
                "expected ControlReply, got {:?}",
                frame.kind
            )));
        }
        match serde_json::from_slice::<ControlResponse>(&frame.payload)? {
            ControlResponse::Ok(payload) => Ok(payload),
            ControlResponse::Error(err) => Err(map_control_error(
                pod,
                err.code,
                err.message,
                self.endpoint(),
            )),
        }
    }

    /// Forwards an opaque command and returns the agent's reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the command exceeds the frame limit
    /// and [`Error::Agent`] if the agent answered with an error.
    pub async fn command(&self, cmd: Command) -> Result<Reply> {
        let frame = self.request(FrameKind::Command, cmd.0, "send_cmd").await?;
        match frame.kind {
            FrameKind::CommandReply => Ok(Reply(frame.payload)),
            FrameKind::CommandError => Err(Error::Agent(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            )),
            other => Err(Error::Protocol(format!(
                "expected CommandReply, got {other:?}"
            ))),
        }
    }

    /// Opens local pipes for `ids` and routes them over this connection.
    ///
    /// Output parked for these ids is delivered first. An existing route
    /// for the same output id is replaced; its previous reader sees end of
    /// stream.
    #[must_use]
    pub fn attach(&self, ids: StreamIds) -> IoStream {
        let stdin = self.open_input(ids.stdin);
        let stdout = self.open_output(ids.stdout);
        let stderr = self.open_output(ids.stderr);
        IoStream::new(ids, Box::pin(stdin), Box::pin(stdout), Box::pin(stderr))
    }

    fn open_output(&self, stream_id: u64) -> DuplexStream {
        let (caller_end, mut proxy_end) = tokio::io::duplex(STREAM_PIPE_CAPACITY);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTPUT_BACKLOG);
        {
            let mut st = lock(&self.sink.state);
            if st.closed.is_some() {
                // Dropping proxy_end leaves the caller at EOF.
                return caller_end;
            }
            let parked = st.parked.remove(&stream_id).unwrap_or_default();
            for chunk in parked.chunks {
                // Parked chunks never exceed the backlog.
                let _ = tx.try_send(chunk);
            }
            if !parked.closed && st.routes.insert(stream_id, tx).is_some() {
                debug!(stream_id, "replaced existing output route");
            }
        }
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if proxy_end.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            let _ = proxy_end.shutdown().await;
        });
        caller_end
    }

    fn open_input(&self, stream_id: u64) -> DuplexStream {
        let (caller_end, proxy_end) = tokio::io::duplex(STREAM_PIPE_CAPACITY);
        let mut st = lock(&self.sink.state);
        if st.closed.is_none() {
            st.inputs.retain(|pump| !pump.is_finished());
            let pump = tokio::spawn(pump_input(self.sink.clone(), stream_id, proxy_end));
            st.inputs.push(pump);
        }
        caller_end
    }

    /// Closes the connection.
    ///
    /// Pending requests fail, output streams end, and stdin pumps stop.
    /// Frames already queued are flushed before the write half is shut
    /// down, waiting at most the request timeout.
    pub async fn shutdown(&self) {
        close_state(&self.sink.state, "connection shut down");
        if let Some(reader) = take_handle(&self.reader) {
            reader.abort();
        }
        let (done_tx, done_rx) = oneshot::channel();
        let flushed = timeout(self.request_timeout, async {
            if self.sink.tx.send(Outbound::Shutdown(done_tx)).await.is_ok() {
                let _ = done_rx.await;
            }
        })
        .await;
        if flushed.is_err() {
            debug!(endpoint = %self.sink.endpoint, "writer did not drain before shutdown");
        }
        if let Some(writer) = take_handle(&self.writer) {
            writer.abort();
        }
    }
}

fn take_handle(slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

impl Drop for Connection {
    fn drop(&mut self) {
        close_state(&self.sink.state, "connection dropped");
        for handle in [take_handle(&self.reader), take_handle(&self.writer)]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.sink.endpoint)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn map_control_error(pod: PodId, code: ErrorCode, message: String, endpoint: &str) -> Error {
    match code {
        ErrorCode::SessionExists => Error::SessionAlreadyExists(pod),
        ErrorCode::SessionNotFound => Error::SessionNotFound(pod),
        ErrorCode::InvalidRequest => {
            Error::Protocol(format!("mediator rejected request: {message}"))
        }
        ErrorCode::Internal => Error::transport(endpoint, message),
    }
}

impl ControlRequest {
    /// Pod the request is about.
    #[must_use]
    pub fn pod(&self) -> PodId {
        match self {
            Self::Register { pod, .. } | Self::Connect { pod } | Self::Unregister { pod } => *pod,
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Connect { .. } => "connect",
            Self::Unregister { .. } => "unregister",
        }
    }
}

// =============================================================================
// Tasks
// =============================================================================

async fn read_loop(
    mut reader: ReadHalf<BoxedTransport>,
    state: SharedState,
    endpoint: Arc<str>,
    max_payload: usize,
) {
    let reason = loop {
        match Frame::read_from(&mut reader, max_payload).await {
            Ok(Some(frame)) => dispatch(&state, frame),
            Ok(None) => break "connection closed by peer".to_string(),
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "proxy connection failed");
                break e.to_string();
            }
        }
    };
    debug!(endpoint = %endpoint, reason = %reason, "proxy reader stopped");
    close_state(&state, &reason);
}

async fn write_loop(
    mut writer: WriteHalf<BoxedTransport>,
    mut queue: mpsc::Receiver<Outbound>,
    state: SharedState,
    endpoint: Arc<str>,
) {
    while let Some(outbound) = queue.recv().await {
        match outbound {
            Outbound::Frame(frame) => {
                if let Err(e) = frame.write_to(&mut writer).await {
                    warn!(endpoint = %endpoint, error = %e, "proxy write failed");
                    close_state(&state, &e.to_string());
                    return;
                }
            }
            Outbound::Shutdown(done) => {
                if let Err(e) = writer.shutdown().await {
                    debug!(endpoint = %endpoint, error = %e, "transport shutdown failed");
                }
                let _ = done.send(());
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}

fn dispatch(state: &SharedState, frame: Frame) {
    let mut st = lock(state);
    match frame.kind {
        FrameKind::ControlReply | FrameKind::CommandReply | FrameKind::CommandError => {
            if frame.kind == FrameKind::ControlReply {
                park_announced(&mut st, &frame.payload);
            }
            match st.pending.remove(&frame.id) {
                Some(tx) => {
                    // Receiver may have given up; the reply is discarded.
                    let _ = tx.send(frame);
                }
                None => debug!(request_id = frame.id, "discarding reply with no waiter"),
            }
        }
        FrameKind::StreamData => route_output(&mut st, frame.id, frame.payload),
        FrameKind::StreamClose => {
            if st.routes.remove(&frame.id).is_none() {
                if let Some(parked) = st.parked.get_mut(&frame.id) {
                    parked.closed = true;
                }
            }
        }
        FrameKind::Control | FrameKind::Command => {
            warn!(kind = ?frame.kind, id = frame.id, "ignoring request frame from mediator");
        }
    }
}

/// Starts holding output for every unrouted stream a control reply names.
fn park_announced(st: &mut State, payload: &[u8]) {
    let Ok(ControlResponse::Ok(session)) = serde_json::from_slice::<ControlResponse>(payload)
    else {
        return;
    };
    for ids in session.streams.iter().chain(session.primary.iter()) {
        for id in [ids.stdout, ids.stderr] {
            if !st.routes.contains_key(&id) {
                st.parked.entry(id).or_default();
            }
        }
    }
}

fn route_output(st: &mut State, id: u64, bytes: Vec<u8>) {
    if let Some(tx) = st.routes.get(&id) {
        match tx.try_send(bytes) {
            Ok(()) => return,
            Err(TrySendError::Full(_)) => {
                warn!(stream_id = id, "output backlog full, closing stream");
            }
            Err(TrySendError::Closed(_)) => {}
        }
        st.routes.remove(&id);
        return;
    }
    let Some(parked) = st.parked.get_mut(&id) else {
        debug!(stream_id = id, "discarding data for unknown stream");
        return;
    };
    if parked.closed {
        return;
    }
    if parked.chunks.len() >= OUTPUT_BACKLOG || parked.bytes + bytes.len() > MAX_PARKED_OUTPUT {
        warn!(stream_id = id, "unclaimed output overflowed, closing stream");
        parked.closed = true;
        return;
    }
    parked.bytes += bytes.len();
    parked.chunks.push(bytes);
}

async fn pump_input(sink: FrameSink, stream_id: u64, mut source: DuplexStream) {
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE.min(sink.max_payload)];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let frame = Frame::stream_data(stream_id, buf[..n].to_vec());
                if sink.send(frame).await.is_err() {
                    return;
                }
            }
        }
    }
    let _ = sink.send(Frame::stream_close(stream_id)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_FRAME_PAYLOAD;

    fn pair(config: &ProxyConfig) -> (Arc<Connection>, DuplexStream) {
        let (host, remote) = tokio::io::duplex(1 << 16);
        (Connection::new(Box::new(host), "test", config), remote)
    }

    async fn next(remote: &mut DuplexStream) -> Frame {
        Frame::read_from(remote, MAX_FRAME_PAYLOAD).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_replies_matched_by_id() {
        let (conn, mut remote) = pair(&ProxyConfig::default());

        let a = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.command(Command::from("a")).await }
        });
        let first = next(&mut remote).await;
        let b = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.command(Command::from("b")).await }
        });
        let second = next(&mut remote).await;

        // Answer in reverse order.
        for req in [&second, &first] {
            let mut body = b"re:".to_vec();
            body.extend(&req.payload);
            Frame::new(FrameKind::CommandReply, req.id, body)
                .write_to(&mut remote)
                .await
                .unwrap();
        }

        assert_eq!(a.await.unwrap().unwrap(), Reply(b"re:a".to_vec()));
        assert_eq!(b.await.unwrap().unwrap(), Reply(b"re:b".to_vec()));
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_timeout_discards_late_reply() {
        let config = ProxyConfig::default().with_request_timeout(Duration::from_millis(50));
        let (conn, mut remote) = pair(&config);

        let err = conn.command(Command::from("slow")).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(conn.pending_requests(), 0);

        let stale = next(&mut remote).await;
        Frame::new(FrameKind::CommandReply, stale.id, b"late".to_vec())
            .write_to(&mut remote)
            .await
            .unwrap();

        let pending = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.command(Command::from("fresh")).await }
        });
        let fresh = next(&mut remote).await;
        assert_ne!(fresh.id, stale.id);
        Frame::new(FrameKind::CommandReply, fresh.id, b"ok".to_vec())
            .write_to(&mut remote)
            .await
            .unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), Reply(b"ok".to_vec()));
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending() {
        let (conn, mut remote) = pair(&ProxyConfig::default());
        let waiting = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.command(Command::from("x")).await }
        });
        let _ = next(&mut remote).await;
        drop(remote);

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert!(conn.is_closed());
        assert!(matches!(
            conn.command(Command::from("y")).await,
            Err(Error::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn test_agent_error_frame() {
        let (conn, mut remote) = pair(&ProxyConfig::default());
        let waiting = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.command(Command::from("bad")).await }
        });
        let req = next(&mut remote).await;
        Frame::new(FrameKind::CommandError, req.id, b"unknown command".to_vec())
            .write_to(&mut remote)
            .await
            .unwrap();
        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Agent(ref m) if m == "unknown command"));
    }

    #[tokio::test]
    async fn test_stream_routing() {
        let (conn, mut remote) = pair(&ProxyConfig::default());
        let ids = StreamIds { stdin: 1, stdout: 2, stderr: 3 };
        let mut io = conn.attach(ids);

        io.stdin.write_all(b"input").await.unwrap();
        let frame = next(&mut remote).await;
        assert_eq!(frame, Frame::stream_data(1, b"input".to_vec()));

        Frame::stream_data(3, b"oops".to_vec()).write_to(&mut remote).await.unwrap();
        Frame::stream_close(3).write_to(&mut remote).await.unwrap();
        let mut err_out = Vec::new();
        io.stderr.read_to_end(&mut err_out).await.unwrap();
        assert_eq!(err_out, b"oops");

        drop(io.stdin);
        assert_eq!(next(&mut remote).await, Frame::stream_close(1));
    }

    #[tokio::test]
    async fn test_shutdown_ends_streams() {
        let (conn, _remote) = pair(&ProxyConfig::default());
        let mut io = conn.attach(StreamIds { stdin: 4, stdout: 5, stderr: 6 });
        conn.shutdown().await;

        let mut out = Vec::new();
        io.stdout.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_cancelled_command_keeps_framing() {
        let (host, mut remote) = tokio::io::duplex(64);
        let conn = Connection::new(Box::new(host), "test", &ProxyConfig::default());

        // The peer is not reading yet, so the frame cannot be written in time.
        let big = Command::new(vec![b'A'; 4096]);
        let cancelled = timeout(Duration::from_millis(50), conn.command(big)).await;
        assert!(cancelled.is_err());

        let ping = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.command(Command::from("ping")).await }
        });

        let first = next(&mut remote).await;
        assert_eq!(first.payload.len(), 4096);
        let second = next(&mut remote).await;
        assert_eq!(second.payload, b"ping");
        Frame::new(FrameKind::CommandReply, second.id, b"pong".to_vec())
            .write_to(&mut remote)
            .await
            .unwrap();
        assert_eq!(ping.await.unwrap().unwrap(), Reply(b"pong".to_vec()));
    }

    #[tokio::test]
    async fn test_output_right_after_handshake_is_kept() {
        let (conn, mut remote) = pair(&ProxyConfig::default());
        let pod = PodId::new("web");
        let control = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.control(&ControlRequest::Connect { pod }).await }
        });

        let req = next(&mut remote).await;
        let primary = StreamIds { stdin: 1, stdout: 2, stderr: 3 };
        let reply = ControlResponse::Ok(SessionPayload {
            streams: Vec::new(),
            primary: Some(primary),
        });
        // Reply, output and close arrive in a single write.
        let mut burst = Frame::control_reply(req.id, &reply).unwrap().encode();
        burst.extend(Frame::stream_data(2, b"banner\n".to_vec()).encode());
        burst.extend(Frame::stream_close(2).encode());
        remote.write_all(&burst).await.unwrap();

        let payload = control.await.unwrap().unwrap();
        let mut io = conn.attach(payload.primary.unwrap());
        let mut out = Vec::new();
        timeout(Duration::from_secs(1), io.stdout.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, b"banner\n");
    }

    #[tokio::test]
    async fn test_unread_output_is_bounded() {
        let (conn, mut remote) = pair(&ProxyConfig::default());
        let mut io = conn.attach(StreamIds { stdin: 1, stdout: 2, stderr: 3 });

        let chunk = vec![b'x'; 4096];
        let frames = OUTPUT_BACKLOG * 4;
        for _ in 0..frames {
            Frame::stream_data(2, chunk.clone())
                .write_to(&mut remote)
                .await
                .unwrap();
        }

        // The stream was closed once its backlog filled.
        let mut out = Vec::new();
        timeout(Duration::from_secs(1), io.stdout.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert!(out.len() < frames * chunk.len());

        // Other traffic is unaffected.
        let waiting = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.command(Command::from("still")).await }
        });
        let req = next(&mut remote).await;
        Frame::new(FrameKind::CommandReply, req.id, b"ok".to_vec())
            .write_to(&mut remote)
            .await
            .unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), Reply(b"ok".to_vec()));
    }

    #[tokio::test]
    async fn test_oversized_command_rejected_before_write() {
        let config = ProxyConfig::default().with_max_frame_payload(16);
        let (conn, mut remote) = pair(&config);

        let err = conn.command(Command::new(vec![0u8; 17])).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
        assert_eq!(conn.pending_requests(), 0);

        let waiting = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.command(Command::from("small")).await }
        });
        let req = next(&mut remote).await;
        assert_eq!(req.payload, b"small", "nothing of the oversized command was sent");
        Frame::new(FrameKind::CommandReply, req.id, Vec::new())
            .write_to(&mut remote)
            .await
            .unwrap();
        assert!(waiting.await.unwrap().is_ok());
        assert!(!conn.is_closed());
    }
}
