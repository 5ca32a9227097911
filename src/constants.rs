//! # Proxy Constants
//!
//! Limits, timeouts, and environment keys for the proxy layer. These are
//! the single source of truth for bounds enforced by the frame codec, the
//! pod validator, and the default configuration.

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum payload size of a single frame (4 MiB).
///
/// **Security**: A frame header is read before its payload is allocated. A
/// hostile or broken mediator announcing a huge length is rejected instead of
/// driving the host into a multi-gigabyte allocation.
pub const MAX_FRAME_PAYLOAD: usize = 4 * 1024 * 1024;

/// Size of the fixed frame header: kind (1) + id (8) + length (4).
pub const FRAME_HEADER_LEN: usize = 13;

/// Maximum number of containers a single pod may expose streams for.
///
/// Every container consumes three stream ids and two pump tasks.
pub const MAX_CONTAINERS_PER_POD: usize = 64;

/// Maximum container name length (DNS label).
pub const MAX_CONTAINER_NAME_LEN: usize = 63;

/// Maximum pod name/namespace length.
pub const MAX_POD_NAME_LEN: usize = 253;

/// Read buffer used by stdin pumps.
pub const STREAM_CHUNK_SIZE: usize = 32 * 1024;

/// Capacity of the in-memory pipe handed to callers for each direction.
pub const STREAM_PIPE_CAPACITY: usize = 64 * 1024;

/// Frames queued per output stream before the stream is closed.
///
/// **Security**: A caller that never reads its stdout/stderr cannot make
/// the host buffer unbounded guest output.
pub const OUTPUT_BACKLOG: usize = 64;

/// Bytes held for an announced stream before `attach` claims it.
pub const MAX_PARKED_OUTPUT: usize = 256 * 1024;

/// Frames queued for the connection writer task.
pub const WRITE_QUEUE_DEPTH: usize = 64;

// =============================================================================
// Timeouts
// =============================================================================

/// Default time allowed to dial the mediator endpoint.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for a control handshake or command round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Transport Defaults
// =============================================================================

/// Default vsock port the mediator listens on.
pub const DEFAULT_VSOCK_PORT: u32 = 1024;

/// First stream id handed out by local allocators. Zero is reserved.
pub const FIRST_STREAM_ID: u64 = 1;

// =============================================================================
// Configuration Keys
// =============================================================================

/// Environment variable selecting the proxy kind.
pub const ENV_PROXY_KIND: &str = "PODPROXY_KIND";

/// Environment variable overriding the request timeout, in seconds.
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "PODPROXY_TIMEOUT_SECS";

/// Environment variable overriding the dial timeout, in seconds.
pub const ENV_DIAL_TIMEOUT_SECS: &str = "PODPROXY_DIAL_TIMEOUT_SECS";
