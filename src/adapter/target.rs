//! Platform side: publish-only session

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, error};

use super::{Adapter, AdapterError, ConnectionState, MqttSession, RelayTarget};
use crate::config::BrokerConfig;
use crate::metrics::Metrics;

pub const PLATFORM_ROLE: &str = "platform";

/// Session on the platform broker. Never subscribes.
pub struct PlatformTarget {
    session: MqttSession,
}

impl PlatformTarget {
    pub async fn connect(
        config: &BrokerConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self, AdapterError> {
        let session = MqttSession::connect(PLATFORM_ROLE, config, None, 0, metrics).await?;
        Ok(Self { session })
    }

    pub fn session(&self) -> &MqttSession {
        &self.session
    }
}

#[async_trait]
impl RelayTarget for PlatformTarget {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), AdapterError> {
        let len = payload.len();
        match self.session.publish(topic, payload).await {
            Ok(()) => {
                debug!("Broker '{}': Published {} bytes to {}", PLATFORM_ROLE, len, topic);
                Ok(())
            }
            Err(e) => {
                error!(
                    "Broker '{}': Publish to {} failed: {}",
                    PLATFORM_ROLE, topic, e
                );
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Adapter for PlatformTarget {
    fn name(&self) -> &str {
        PLATFORM_ROLE
    }

    fn status(&self) -> ConnectionState {
        self.session.status()
    }

    /// Nothing to set up; stays alive until shutdown or session failure
    async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), AdapterError> {
        tokio::select! {
            _ = shutdown.recv() => Ok(()),
            e = self.session.terminated() => Err(e),
        }
    }

    async fn close(&self) {
        self.session.close().await;
    }
}
