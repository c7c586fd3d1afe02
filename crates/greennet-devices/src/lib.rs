/*!
 * GreenNet Devices
 *
 * Rebuilds EnOcean device records from the fragmented MQTT streams of a
 * GreenNet gateway, keeps their channel state current and encodes
 * commands back to the gateway.
 */

#![warn(missing_docs)]

// Re-export core types
pub use greennet_core::prelude;

pub mod assembler;
pub mod command;
pub mod correlator;
pub mod device;
pub mod discovery;
pub mod path_tree;
pub mod payload;
pub mod profile;
pub mod registry;
pub mod topics;
pub mod transport;

#[cfg(feature = "mqtt")]
pub mod protocols;

pub use command::{Command, Intent};
pub use device::{Channel, Device, DeviceError, DeviceInfo, HvacMode};
pub use discovery::{Coordinator, CoordinatorSettings, DiscoveryStatus, GatewayStatus, Notification};
pub use profile::EntityCategory;
pub use transport::{MemoryTransport, Message, Qos, Transport};

#[cfg(feature = "mqtt")]
pub use protocols::MqttTransport;

/// GreenNet devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> Result<(), greennet_core::error::Error> {
    tracing::info!("GreenNet Devices {} initialized", VERSION);
    Ok(())
}

/// Transports compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = vec!["memory"];

    #[cfg(feature = "mqtt")]
    transports.push("mqtt");

    transports
}
