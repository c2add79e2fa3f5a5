//! Sensor-network side: subscribes to device uplinks

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{error, info};

use super::{Adapter, AdapterError, ConnectionState, MessageHandler, MqttSession};
use crate::config::BrokerConfig;
use crate::metrics::Metrics;

pub const LORA_ROLE: &str = "lora";

/// Session on the LoRa Server broker
pub struct LoraSource {
    session: MqttSession,
    uplink_topic: String,
}

impl LoraSource {
    /// Connect and install `handler` for every message received.
    /// Fails fast when the broker is unreachable or the URL is invalid.
    pub async fn connect(
        config: &BrokerConfig,
        uplink_topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        dispatch_capacity: usize,
        metrics: Arc<Metrics>,
    ) -> Result<Self, AdapterError> {
        let session =
            MqttSession::connect(LORA_ROLE, config, Some(handler), dispatch_capacity, metrics)
                .await?;

        Ok(Self {
            session,
            uplink_topic: uplink_topic.into(),
        })
    }

    /// Subscribe to the uplink filter and wait for the broker to confirm
    pub async fn subscribe(&self) -> Result<(), AdapterError> {
        self.session.subscribe(&self.uplink_topic).await?;
        info!(
            "Broker '{}': Subscribed to {}",
            LORA_ROLE, self.uplink_topic
        );
        Ok(())
    }

    pub fn session(&self) -> &MqttSession {
        &self.session
    }
}

#[async_trait]
impl Adapter for LoraSource {
    fn name(&self) -> &str {
        LORA_ROLE
    }

    fn status(&self) -> ConnectionState {
        self.session.status()
    }

    async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), AdapterError> {
        // A broker that never acknowledges must not hold up shutdown
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            result = self.subscribe() => {
                if let Err(e) = result {
                    error!("Broker '{}': {}", LORA_ROLE, e);
                    return Err(e);
                }
            }
        }

        tokio::select! {
            _ = shutdown.recv() => Ok(()),
            e = self.session.terminated() => Err(e),
        }
    }

    async fn close(&self) {
        self.session.close().await;
    }
}
