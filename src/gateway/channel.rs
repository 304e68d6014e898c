//! In-memory `SlaveGateway` test double.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::info;

use super::{GatewayError, InboundMessage, SlaveGateway};

/// Records every publish for assertions, and lets tests inject inbound
/// messages / connect events without a real transport.
pub struct ChannelGateway {
    endpoint: Option<String>,
    published: Mutex<Vec<(String, String)>>,
    inbound_tx: broadcast::Sender<InboundMessage>,
    connect_tx: broadcast::Sender<()>,
}

impl Default for ChannelGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelGateway {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(256);
        let (connect_tx, _) = broadcast::channel(16);
        Self {
            endpoint: None,
            published: Mutex::new(Vec::new()),
            inbound_tx,
            connect_tx,
        }
    }

    /// Construct with a configured endpoint, logged at startup since this
    /// in-memory gateway never actually dials it (the real wire transport is
    /// a Non-goal; `endpoint` stays a recognized, validated config field for
    /// whichever transport eventually replaces this one).
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        info!(%endpoint, "gateway endpoint configured (in-memory gateway does not dial it)");
        Self {
            endpoint: Some(endpoint),
            ..Self::new()
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Snapshot of everything published so far, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    pub fn last_published(&self, topic: &str) -> Option<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
    }

    /// Deliver an inbound message to every current subscriber, as a real
    /// transport would on receipt.
    pub fn inject_inbound(&self, topic: impl Into<String>, payload: impl Into<String>) {
        let _ = self.inbound_tx.send(InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
        });
    }

    pub fn simulate_connect(&self) {
        let _ = self.connect_tx.send(());
    }
}

#[async_trait]
impl SlaveGateway for ChannelGateway {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), GatewayError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }

    fn subscribe_inbound(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound_tx.subscribe()
    }

    fn subscribe_connect(&self) -> broadcast::Receiver<()> {
        self.connect_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_recorded() {
        let gw = ChannelGateway::new();
        gw.publish("master/uptime", "42").await.unwrap();
        assert_eq!(gw.last_published("master/uptime"), Some("42".to_string()));
    }

    #[test]
    fn with_endpoint_retains_configured_value() {
        let gw = ChannelGateway::with_endpoint("mqtt://localhost:1883");
        assert_eq!(gw.endpoint(), Some("mqtt://localhost:1883"));
    }

    #[test]
    fn new_has_no_endpoint() {
        let gw = ChannelGateway::new();
        assert_eq!(gw.endpoint(), None);
    }

    #[tokio::test]
    async fn inbound_injection_reaches_subscriber() {
        let gw = ChannelGateway::new();
        let mut rx = gw.subscribe_inbound();
        gw.inject_inbound("esp-total/total_voltage", "400.1");
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "esp-total/total_voltage");
        assert_eq!(msg.payload, "400.1");
    }
}
