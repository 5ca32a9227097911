//! Proxy strategy implementations.
//!
//! | Strategy | Kind | Transport | Stream ids |
//! |----------|------|-----------|------------|
//! | [`NoopProxy`] | `noopProxy` | none | local counter |
//! | [`ExternalProxy`] | `ccProxy` | framed, multiplexed socket | assigned by mediator |

mod external;
mod noop;

pub use external::ExternalProxy;
pub use noop::NoopProxy;
