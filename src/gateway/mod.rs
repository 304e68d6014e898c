//! Narrow interface to the slave transport. The transport itself (an MQTT
//! broker client) is out of scope; this module only defines the seam and a
//! test double, matching spec.md §6's "accessed through narrow interfaces."

pub mod topics;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
}

/// One decoded (not yet classified) inbound bus message.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

/// The seam the scheduler and balancer publish through, and the seam the
/// dispatch loop reads inbound messages and connect notifications from.
#[async_trait]
pub trait SlaveGateway: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), GatewayError>;

    /// A fresh receiver over every inbound message from the moment of the
    /// call onward. Broadcast, not queue: late subscribers miss history.
    fn subscribe_inbound(&self) -> broadcast::Receiver<InboundMessage>;

    /// Fires once per underlying transport (re)connection, used by the
    /// balancer to republish its config.
    fn subscribe_connect(&self) -> broadcast::Receiver<()>;
}

pub mod channel;
pub use channel::ChannelGateway;
