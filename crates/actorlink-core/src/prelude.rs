/*!
 * Prelude module for actorlink core.
 *
 * This module re-exports commonly used types and functions from the core
 * crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{ConnectionId, MessageCode};

// Re-export observer types
pub use crate::observable::{Observable, Subscription};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, DeviceConfig, SharedConfig, TimeoutConfig};

// Re-export utility functions
pub use crate::utils::{lock, millis_to_limit, nonzero, with_optional_limit};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::{init, init_with_config};
