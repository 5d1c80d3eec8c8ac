//! opendiag-can - CAN framing and request/response plumbing
//!
//! This crate is the bottom of the opendiag stack. It models CAN frames and
//! filters, drives a background dispatch worker over an externally supplied
//! [`CanTransport`], and provides the [`ExchangeClient`] rendezvous used by
//! the UDS and OBD-II layers to pair requests with responses.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ExchangeClient                       │
//! │   awaiter map keyed by response id, 0x78 absorption      │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │ FrameSink (non-owning, by sink id)
//! ┌───────────────┴──────────────────────────────────────────┐
//! │                      CanProtocol                         │
//! │   filters · statistics · dispatch worker (10 ms poll)    │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │
//!        ┌────────┴────────┐
//!        │  CanTransport   │   (PassThru driver wrapper,
//!        │  (send/recv)    │    supplied by the host)
//!        └─────────────────┘
//! ```

pub mod config;
pub mod exchange;
pub mod filter;
pub mod frame;
pub mod protocol;
pub mod transport;

pub use config::CanConfig;
pub use exchange::{ExchangeClient, ExchangeError};
pub use filter::{CanFilter, FilterAction, FilterId, FilterSet};
pub use frame::{CanFrame, CanId, FrameError};
pub use protocol::{CanProtocol, CanProtocolError, CanStatistics, FrameSink, SinkId};
pub use transport::{CanTransport, MockTransport, TransportError};
