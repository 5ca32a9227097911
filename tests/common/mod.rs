//! In-process mediator used by the integration tests.
//!
//! `FakeMediator` is a [`Dialer`]: every dial hands back one end of a
//! `tokio::io::duplex` pipe and spawns a task serving the other end with
//! the real frame codec.

#![allow(dead_code)]

use async_trait::async_trait;
use podproxy::protocol::{
    ControlRequest, ControlResponse, ErrorCode, Frame, FrameKind, SessionPayload,
};
use podproxy::{BoxedTransport, Dialer, Endpoint, Pod, PodId, StreamIds, MAX_FRAME_PAYLOAD};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};

/// Command payloads starting with this prefix are answered after a delay.
pub const SLOW_PREFIX: &[u8] = b"slow:";
pub const SLOW_DELAY: Duration = Duration::from_millis(250);

#[derive(Default)]
struct MediatorState {
    sessions: HashMap<PodId, SessionPayload>,
    /// stdin id -> (stdout id, stderr id)
    echo_routes: HashMap<u64, (u64, u64)>,
    next_id: u64,
    dials: usize,
    duplicate_ids: bool,
}

impl MediatorState {
    fn triple(&mut self) -> StreamIds {
        let base = self.next_id;
        self.next_id += 3;
        let ids = StreamIds {
            stdin: base + 1,
            stdout: base + 2,
            stderr: base + 3,
        };
        self.echo_routes.insert(ids.stdin, (ids.stdout, ids.stderr));
        ids
    }

    fn handle(&mut self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Register { pod, containers, .. } => {
                if self.sessions.contains_key(&pod) {
                    return ControlResponse::error(ErrorCode::SessionExists, "session exists");
                }
                let primary = self.triple();
                let streams = if self.duplicate_ids {
                    containers.iter().map(|_| primary).collect()
                } else {
                    containers.iter().map(|_| self.triple()).collect()
                };
                let payload = SessionPayload {
                    streams,
                    primary: Some(primary),
                };
                self.sessions.insert(pod, payload.clone());
                ControlResponse::Ok(payload)
            }
            ControlRequest::Connect { pod } => match self.sessions.get(&pod) {
                Some(payload) => ControlResponse::Ok(payload.clone()),
                None => ControlResponse::error(ErrorCode::SessionNotFound, "no such session"),
            },
            ControlRequest::Unregister { pod } => match self.sessions.remove(&pod) {
                Some(_) => ControlResponse::ok(),
                None => ControlResponse::error(ErrorCode::SessionNotFound, "no such session"),
            },
        }
    }
}

/// Mediator stand-in shared by every connection it accepts.
#[derive(Clone, Default)]
pub struct FakeMediator {
    state: Arc<Mutex<MediatorState>>,
}

impl FakeMediator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mediator that hands every container the primary stream's ids.
    pub fn with_duplicate_ids() -> Arc<Self> {
        let mediator = Self::default();
        mediator.state.lock().unwrap().duplicate_ids = true;
        Arc::new(mediator)
    }

    pub fn dials(&self) -> usize {
        self.state.lock().unwrap().dials
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn has_session(&self, pod: PodId) -> bool {
        self.state.lock().unwrap().sessions.contains_key(&pod)
    }

    /// Accepts connections on a Unix socket until the task is dropped.
    #[cfg(unix)]
    pub fn listen_unix(&self, listener: tokio::net::UnixListener) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                state.lock().unwrap().dials += 1;
                tokio::spawn(serve(stream, Arc::clone(&state)));
            }
        })
    }
}

#[async_trait]
impl Dialer for FakeMediator {
    async fn dial(&self, _endpoint: &Endpoint) -> podproxy::Result<BoxedTransport> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.state.lock().unwrap().dials += 1;
        tokio::spawn(serve(server, Arc::clone(&self.state)));
        Ok(Box::new(client))
    }
}

type Writer<S> = Arc<tokio::sync::Mutex<WriteHalf<S>>>;

async fn send<S: AsyncWrite>(writer: &Writer<S>, frame: Frame) {
    let mut w = writer.lock().await;
    let _ = frame.write_to(&mut *w).await;
}

async fn serve<S>(stream: S, state: Arc<Mutex<MediatorState>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer: Writer<S> = Arc::new(tokio::sync::Mutex::new(writer));

    while let Ok(Some(frame)) = Frame::read_from(&mut reader, MAX_FRAME_PAYLOAD).await {
        match frame.kind {
            FrameKind::Control => {
                let response = match serde_json::from_slice::<ControlRequest>(&frame.payload) {
                    Ok(request) => state.lock().unwrap().handle(request),
                    Err(e) => ControlResponse::error(ErrorCode::InvalidRequest, e.to_string()),
                };
                send(&writer, Frame::control_reply(frame.id, &response).unwrap()).await;
            }
            FrameKind::Command => {
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    if frame.payload.starts_with(SLOW_PREFIX) {
                        tokio::time::sleep(SLOW_DELAY).await;
                    }
                    let reply = if frame.payload == b"fail" {
                        Frame::new(FrameKind::CommandError, frame.id, b"agent refused".to_vec())
                    } else {
                        Frame::new(FrameKind::CommandReply, frame.id, frame.payload)
                    };
                    send(&writer, reply).await;
                });
            }
            FrameKind::StreamData => {
                let route = state.lock().unwrap().echo_routes.get(&frame.id).copied();
                if let Some((stdout, _)) = route {
                    send(&writer, Frame::stream_data(stdout, frame.payload)).await;
                }
            }
            FrameKind::StreamClose => {
                let route = state.lock().unwrap().echo_routes.get(&frame.id).copied();
                if let Some((stdout, stderr)) = route {
                    send(&writer, Frame::stream_close(stdout)).await;
                    send(&writer, Frame::stream_close(stderr)).await;
                }
            }
            _ => {}
        }
    }
}

/// Pod served by the fake mediator with the given IO containers.
pub fn pod(name: &str, containers: &[&str]) -> Pod {
    let endpoint: Endpoint = "unix:/run/podproxy/test.sock".parse().unwrap();
    containers
        .iter()
        .fold(Pod::new("default", name), |pod, c| pod.with_container(*c))
        .with_endpoint(endpoint)
}
