/*!
 * Error type for device operations.
 */
use thiserror::Error;

/// Error type for device operations
///
/// Configuration errors are returned synchronously at the call that broke
/// the contract. Transport and timeout failures of running operations are
/// not returned as errors; they resolve the operation's completion handle
/// as failed instead.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The device is not connected
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// Another connect or disconnect is already running on the device
    #[error("Device {device} busy: {operation} in progress")]
    Busy {
        /// The device name
        device: String,
        /// The operation holding the device
        operation: String,
    },

    /// A completion handle was resolved twice or reused after resolution
    #[error("Command already resolved: {0}")]
    AlreadyResolved(String),

    /// A command list had no commands
    #[error("No commands to run on device {0}")]
    EmptyCommandList(String),

    /// A device name is empty, reserved, or otherwise unusable
    #[error("Invalid device name: {0}")]
    InvalidName(String),

    /// Two devices share a name
    #[error("Duplicate device name: {0}")]
    DuplicateName(String),

    /// Two devices share one connection
    #[error("A device already uses this connection; new device={new:?}; old device={existing:?}")]
    SharedConnection {
        /// The device being added
        new: String,
        /// The device already using the connection
        existing: String,
    },

    /// A lookup found nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// An unknown device state label
    #[error("Unknown device state: {0:?}")]
    UnknownState(String),

    /// Writing to the connection failed
    #[error("Write failed: {0}")]
    Write(String),

    /// Messages to users have nowhere to go
    #[error("User output not wired up: {0}")]
    NotWired(String),

    /// No async runtime is available to drive the operation
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Whether this error reports a broken usage contract rather than a
    /// failure of the device or transport
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DeviceError::Busy { .. }
                | DeviceError::AlreadyResolved(_)
                | DeviceError::EmptyCommandList(_)
                | DeviceError::InvalidName(_)
                | DeviceError::DuplicateName(_)
                | DeviceError::SharedConnection { .. }
                | DeviceError::UnknownState(_)
        )
    }
}
