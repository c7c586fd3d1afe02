/*!
 * Broker-backed transports.
 */

pub mod mqtt;

pub use mqtt::MqttTransport;
