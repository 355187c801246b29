//! Downstream broker seam.
//!
//! The supervisor dials through a [`BrokerConnector`] and every processor
//! publishes through the resulting [`BrokerPublisher`] handle, so integration
//! tests can substitute a capture implementation without a running broker.
//! The production implementation is NATS.

use crate::config::BrokerSettings;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connect: {0}")]
    Connect(String),
    #[error("broker publish: {0}")]
    Publish(String),
}

/// An established broker connection.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Whether the connection can accept publishes.  A closed handle turns
    /// publish attempts into counted drops.
    fn is_open(&self) -> bool;

    /// Flush buffered publishes; called once during shutdown.
    async fn flush(&self) -> Result<(), BrokerError>;
}

/// Dials a broker; invoked under the broker circuit breaker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, settings: &BrokerSettings) -> Result<Arc<dyn BrokerPublisher>, BrokerError>;
}

// ---------------------------------------------------------------------------
// NATS implementation
// ---------------------------------------------------------------------------

pub struct NatsConnector;

#[async_trait]
impl BrokerConnector for NatsConnector {
    async fn connect(
        &self,
        settings: &BrokerSettings,
    ) -> Result<Arc<dyn BrokerPublisher>, BrokerError> {
        let client = async_nats::ConnectOptions::new()
            .name(&settings.client_name)
            .connect(settings.url.as_str())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        info!(url = %settings.url, client_name = %settings.client_name, "connected to broker");
        Ok(Arc::new(NatsPublisher { client }))
    }
}

pub struct NatsPublisher {
    client: async_nats::Client,
}

#[async_trait]
impl BrokerPublisher for NatsPublisher {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .publish(subject.to_owned(), payload.into())
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    fn is_open(&self) -> bool {
        // The client reconnects on its own; only a definitive disconnect
        // counts as closed, mirroring drop accounting at the processor.
        !matches!(
            self.client.connection_state(),
            async_nats::connection::State::Disconnected
        )
    }

    async fn flush(&self) -> Result<(), BrokerError> {
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }
}
