/*!
 * Core data types for actorlink.
 */
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Identity token issued to a connection when it is created
///
/// Devices and registries key connections by this token instead of by
/// object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Issue a fresh, random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConnectionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Severity code attached to messages written to users of an actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageCode {
    /// Debug output
    Debug,
    /// Informational output
    Info,
    /// Something unexpected happened but work continues
    Warning,
    /// An error that did not end a command
    Error,
}

impl MessageCode {
    /// Single-character form used on the wire by actors
    pub fn as_char(&self) -> char {
        match self {
            MessageCode::Debug => 'd',
            MessageCode::Info => 'i',
            MessageCode::Warning => 'w',
            MessageCode::Error => 'e',
        }
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl FromStr for MessageCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "d" => Ok(MessageCode::Debug),
            "i" => Ok(MessageCode::Info),
            "w" => Ok(MessageCode::Warning),
            "e" => Ok(MessageCode::Error),
            other => Err(Error::config(format!("Unknown message code {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(format!("{}", a), a.as_uuid().to_string());
    }

    #[test]
    fn test_message_code_round_trip() {
        for code in [
            MessageCode::Debug,
            MessageCode::Info,
            MessageCode::Warning,
            MessageCode::Error,
        ] {
            let parsed: MessageCode = code.to_string().parse().unwrap();
            assert_eq!(parsed, code);
        }
        assert!("x".parse::<MessageCode>().is_err());
    }
}
