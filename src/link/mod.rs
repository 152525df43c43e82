//! # Link Module
//!
//! Line protocol and connection management for the slot machine cabinet.
//!
//! ## Data Flow
//! ```text
//! serial bytes → LineCodec → Command → SerialLinkController → RollGate → RollRequest
//!                                              ↓
//!                           OutboundMessage → LineCodec → serial bytes
//! ```
//!
//! The controller is the only public entry point with behaviour; the other
//! modules hold the protocol vocabulary, the wire framing, the roll gate and
//! the typestate used while opening a port.

pub mod codec;
pub mod controller;
pub mod error;
pub mod gate;
pub mod protocol;
pub mod session;
pub mod status;

pub use controller::SerialLinkController;
pub use error::{ConnectError, LinkError};
pub use gate::{RollGate, RollOutcome};
pub use protocol::{Command, OutboundMessage};
pub use status::{ConnectionState, LinkStatus, RollRequest};
