/*!
 * actorlink Devices
 *
 * This crate provides the device layer of an instrument-control actor:
 * line connections to remote devices, the device lifecycle, connect and
 * disconnect orchestration, command submission and command lists, and
 * the device registry.
 */

#![warn(missing_docs)]

// Re-export core types
pub use actorlink_core::prelude;

pub mod chain;
pub mod command;
pub mod connection;
pub mod device;
pub mod error;
pub mod registry;
pub mod tcp;

mod orchestrator;

#[cfg(test)]
mod testing;

pub use chain::{ChainCallback, CommandChain};
pub use command::{CommandState, CompletionHandle, DeviceExchange};
pub use connection::{
    Connection, ConnectionCore, ConnectionState, ConnectionStatus, ReadCallback, StateCallback,
    StateListener,
};
pub use device::{
    CommandInfo, ConnCallback, Device, DeviceBuilder, DeviceHandler, DeviceState, Operation,
    StateChange, UnwiredWriter, UserWriter,
};
pub use error::{DeviceError, Result};
pub use registry::DeviceRegistry;
pub use tcp::TcpConnection;

/// actorlink devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
