//! # podproxy
//!
//! **Proxy Abstraction Layer for VM-Isolated Pods**
//!
//! Containers in a VM-based runtime run inside a lightweight guest, driven
//! by an agent process in that guest. The host-side runtime reaches the
//! agent through a proxy: this crate provides the proxy contract and its
//! strategies.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Host runtime                                 │
//! │      ProxyConfig ──► ProxyKind::create() ──► Arc<dyn Proxy>         │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                       Proxy Trait                           │    │
//! │  │  register(pod) → send_cmd(cmd)* → unregister(pod)           │    │
//! │  │  connect(pod) / disconnect()                                │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │          │                                   │                      │
//! │  ┌───────┴────────┐               ┌──────────┴──────────────┐       │
//! │  │   NoopProxy    │               │     ExternalProxy       │       │
//! │  │ inert streams  │               │ SessionTable + Connection│      │
//! │  │ echo commands  │               │ frames, stream routing  │       │
//! │  └────────────────┘               └──────────┬──────────────┘       │
//! └──────────────────────────────────────────────┼──────────────────────┘
//!                                                │ unix / tcp / vsock
//!                                     ┌──────────▼──────────┐
//!                                     │  mediator process   │──► guest agent
//!                                     └─────────────────────┘
//! ```
//!
//! # Session Model
//!
//! Each proxy instance keeps at most one session per pod. Lifecycle calls on
//! the same pod are serialized; different pods proceed in parallel. Every
//! container registered gets an [`IoStream`] whose three stream ids are
//! unique within the session for as long as the session lives.
//!
//! # Example
//!
//! ```rust,ignore
//! use podproxy::{Command, Endpoint, Pod, ProxyKind};
//!
//! #[tokio::main]
//! async fn main() -> podproxy::Result<()> {
//!     let proxy = ProxyKind::parse("ccProxy")?.create();
//!     let pod = Pod::new("default", "web")
//!         .with_container("nginx")
//!         .with_endpoint("unix:/run/vc/web/proxy.sock".parse()?);
//!
//!     let streams = proxy.register(&pod).await?;
//!     let reply = proxy.send_cmd(Command::from("{\"id\":\"ping\"}")).await?;
//!     proxy.unregister(&pod).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod kind;
pub mod pod;
pub mod protocol;
pub mod proxies;
pub mod proxy;
pub mod session;
pub mod stream;
pub mod transport;

// Re-exports
pub use config::ProxyConfig;
pub use constants::*;
pub use error::{Error, Result};
pub use kind::{CC_PROXY, NOOP_PROXY, ProxyKind, create, create_from_str};
pub use pod::{ContainerIo, Endpoint, Pod, PodId};
pub use proxies::{ExternalProxy, NoopProxy};
pub use proxy::{Command, Proxy, Reply};
pub use stream::{IoStream, StreamIds, StreamReader, StreamWriter};
pub use transport::{BoxedTransport, Connection, Dialer, SocketDialer};
