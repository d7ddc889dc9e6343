//! STM32 serial firmware update agent.
//!
//! Device side: the [`agent::Agent`] dispatcher, frame integrity checking,
//! flash and option byte sequencing and the application launcher, all
//! generic over the traits in [`hal`].
//!
//! Host side: the [`programmer::Programmer`] speaks the same protocol over
//! any serial port, and with `std` the [`emulator`] runs the agent against
//! an in-memory device.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
extern crate log;

pub mod agent;
pub mod config;
pub mod flash;
pub mod hal;
pub mod integrity;
pub mod launch;
pub mod memory;
pub mod programmer;
pub mod protection;
pub mod protocol;

#[cfg(feature = "std")]
pub mod emulator;

#[cfg(feature = "linux")]
pub mod linux;

pub use agent::{Agent, ExchangeOutcome, Fault};
pub use config::Config;
pub use programmer::{Error, Options, Programmer, SerialPort};
pub use protocol::{Command, Status, Version, UART_ACK, UART_NACK};
