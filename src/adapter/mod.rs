//! Broker Adapters
//!
//! Each adapter owns exactly one MQTT session. The two sides of the relay
//! are distinct types sharing the [`Adapter`] lifecycle:
//!
//! - [`LoraSource`]: subscribes to device uplinks on the LoRa Server broker
//!   and hands every message to a [`MessageHandler`]
//! - [`PlatformTarget`]: publish-only session on the platform broker,
//!   exposed to the handler through [`RelayTarget`]

mod error;
mod reconnect;
mod session;
mod source;
mod target;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

pub use error::AdapterError;
pub use reconnect::{Backoff, ConnectionState, ReconnectMachine};
pub use session::MqttSession;
pub use source::{LoraSource, LORA_ROLE};
pub use target::{PlatformTarget, PLATFORM_ROLE};

/// Lifecycle shared by both adapters
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Role label used in logs and metrics
    fn name(&self) -> &str;

    /// Current connection state
    fn status(&self) -> ConnectionState;

    /// Run until `shutdown` fires (returns `Ok`) or the session fails
    async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<(), AdapterError>;

    /// Disconnect, giving in-flight work a grace period. Safe to call twice.
    async fn close(&self);
}

/// Outbound publish capability of the relay
#[async_trait]
pub trait RelayTarget: Send + Sync {
    /// Publish at most once, not retained, waiting for the write to complete
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), AdapterError>;
}

/// Receives every publish delivered on a subscribing session
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: Bytes);
}
