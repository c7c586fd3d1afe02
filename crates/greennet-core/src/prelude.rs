/*!
 * Prelude module for GreenNet Core.
 *
 * Re-exports the commonly used types so downstream crates can glob-import
 * them.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::Value;

// Re-export event types
pub use crate::event::{EventBus, SharedEventBus};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export utility functions
pub use crate::utils::{join_topic, spawn_and_log, with_timeout};

pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
