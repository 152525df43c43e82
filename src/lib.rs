//! # slotlink
//!
//! Host side of the serial link between a slot machine game and its cabinet
//! controller board. The board reports physical roll presses; the host answers
//! with the result of each roll and keeps the connection alive.
//!
//! Start with [`link::SerialLinkController`] and a [`transport::PortProvider`]
//! such as [`transport::serial::SerialPortProvider`].

pub mod config;
pub mod console;
pub mod link;
pub mod transport;
