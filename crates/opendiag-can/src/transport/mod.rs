//! Transport boundary
//!
//! The core does not implement a transport. A host supplies one (typically
//! a PassThru/J2534 driver wrapper) and the framing layer owns the receive
//! loop, polling [`CanTransport::recv`] with a short timeout.

mod error;
pub mod mock;

pub use error::TransportError;
pub use mock::MockTransport;

use std::time::Duration;

use async_trait::async_trait;

use crate::frame::CanFrame;

/// Polling-based transport contract consumed by the framing layer.
///
/// The framing layer serializes all access to a transport; implementations
/// are not required to be internally thread-safe beyond `Send + Sync`
/// object safety.
#[async_trait]
pub trait CanTransport: Send + Sync {
    /// Enqueue one outbound frame.
    ///
    /// May block briefly, but must not block for a whole request timeout.
    async fn send(&self, frame: CanFrame) -> Result<(), TransportError>;

    /// Drain zero or more inbound frames, waiting at most `timeout`.
    ///
    /// Returning an empty vector on timeout is not an error.
    async fn recv(&self, timeout: Duration) -> Result<Vec<CanFrame>, TransportError>;

    /// Idempotent teardown.
    async fn close(&self);
}
