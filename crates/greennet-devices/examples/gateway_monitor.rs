use std::sync::Arc;

use greennet_core::config::ConfigBuilder;
use greennet_core::event::SharedEventBus;
use greennet_core::logging;
use greennet_devices::{Coordinator, CoordinatorSettings, MqttTransport, Notification};

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // greennet.toml is optional, GREENNET__GATEWAY__GATEWAY_ID etc. override it
    let config = ConfigBuilder::new()
        .with_config_file("greennet.toml")
        .with_environment_prefix("GREENNET")
        .build()?;
    logging::init_from_config(&config.logging)?;
    greennet_devices::init()?;

    let settings = CoordinatorSettings::from_config(&config)?;
    let transport = Arc::new(MqttTransport::connect(&config.mqtt)?);
    let coordinator = Coordinator::start(settings, transport.clone(), SharedEventBus::new()).await?;
    let mut notifications = coordinator.subscribe()?;

    coordinator.refresh_gateway_info().await?;

    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Ok(Notification::DeviceDiscovered { device, .. }) => {
                    info!(
                        "New device {} ({}) eep={} category={}",
                        device.key(),
                        device.device_id,
                        device.primary_eep().unwrap_or("-"),
                        device.category().map(|c| c.as_str()).unwrap_or("unknown"),
                    );
                }
                Ok(Notification::DeviceStateUpdated { device_key, device, .. }) => {
                    for channel in device.channels.values() {
                        info!(
                            "{} ch{}: on={} brightness={:?} position={:?}",
                            device_key, channel.index, channel.is_on, channel.brightness, channel.position
                        );
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("Missed {} notifications", missed),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let status = coordinator.gateway_status().await?;
    info!("Gateway info: {:?}", status.system_info);

    coordinator.stop().await;
    transport.disconnect().await?;
    Ok(())
}
