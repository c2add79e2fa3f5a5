//! LoRa adapter - relays LoRa Server device uplinks to an IoT platform broker
//!
//! Subscribes to `application/+/node/+/rx` on the sensor-network broker,
//! decodes the base64 `Data` field of every uplink record and publishes the
//! raw bytes to `/lora` on the platform broker.

pub mod adapter;
pub mod config;
pub mod metrics;
pub mod relay;
pub mod supervisor;
pub mod topic;

pub use adapter::{
    Adapter, AdapterError, ConnectionState, LoraSource, MessageHandler, PlatformTarget,
    RelayTarget,
};
pub use config::Config;
pub use metrics::{Metrics, MetricsServer};
pub use relay::{decode_uplink, DecodeError, Relay, UplinkMessage};
pub use supervisor::{ShutdownCause, Supervisor};
