//! Inert proxy.
//!
//! Used when the pod has no out-of-process guest transport to mediate, and
//! for deterministic tests. Sessions are tracked so lifecycle misuse is
//! still reported, but streams are inert and commands are echoed back.

use crate::error::{Error, Result};
use crate::kind::ProxyKind;
use crate::pod::Pod;
use crate::proxy::{Command, Proxy, Reply};
use crate::session::{SessionTable, StreamIdAllocator};
use crate::stream::{IoStream, StreamIds};
use async_trait::async_trait;
use tracing::debug;

struct NoopSession {
    ids: StreamIdAllocator,
    primary: StreamIds,
}

/// Proxy that talks to nothing.
pub struct NoopProxy {
    sessions: SessionTable<NoopSession>,
}

impl NoopProxy {
    /// Creates a proxy with no sessions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: SessionTable::new(),
        }
    }
}

impl Default for NoopProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Proxy for NoopProxy {
    fn kind(&self) -> ProxyKind {
        ProxyKind::Noop
    }

    async fn register(&self, pod: &Pod) -> Result<Vec<IoStream>> {
        pod.validate()?;
        let id = pod.id();
        let mut slot = self.sessions.lock(id).await;
        if slot.is_some() {
            return Err(Error::SessionAlreadyExists(id));
        }

        let mut ids = StreamIdAllocator::new();
        let primary = ids.allocate();
        let streams: Vec<IoStream> = pod
            .containers_needing_io()
            .map(|_| IoStream::inert(ids.allocate()))
            .collect();

        *slot = Some(NoopSession { ids, primary });
        self.sessions.set_current(id);
        debug!(pod = %id, streams = streams.len(), "registered noop session");
        Ok(streams)
    }

    async fn unregister(&self, pod: &Pod) -> Result<()> {
        let id = pod.id();
        {
            let mut slot = self.sessions.lock(id).await;
            let session = slot.take().ok_or(Error::SessionNotFound(id))?;
            debug!(pod = %id, released = session.ids.live_count(), "unregistered noop session");
        }
        self.sessions.clear_current_if(id);
        Ok(())
    }

    async fn connect(&self, pod: &Pod) -> Result<IoStream> {
        let id = pod.id();
        let slot = self.sessions.lock(id).await;
        let session = slot.as_ref().ok_or(Error::SessionNotFound(id))?;
        self.sessions.set_current(id);
        Ok(IoStream::inert(session.primary))
    }

    async fn disconnect(&self) -> Result<()> {
        self.sessions.clear_current();
        Ok(())
    }

    async fn send_cmd(&self, cmd: Command) -> Result<Reply> {
        if self.sessions.current().is_none() {
            return Err(Error::NotConnected);
        }
        Ok(Reply(cmd.0))
    }
}
