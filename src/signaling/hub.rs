use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::registry::Registry;
use super::{EnvelopeStream, SignalingEnvelope, SignalingTransport};
use crate::error::TransportError;

/// In-process rendezvous: every endpoint holding a clone shares one
/// routing table. Used by tests and single-process demos.
#[derive(Clone, Default)]
pub struct SignalingHub {
    registry: Arc<Mutex<Registry>>,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_attached(&self, party: &str) -> bool {
        self.registry.lock().await.is_attached(party)
    }
}

#[async_trait]
impl SignalingTransport for SignalingHub {
    async fn send(&self, envelope: &SignalingEnvelope) -> Result<(), TransportError> {
        self.registry.lock().await.route(envelope.clone());
        Ok(())
    }

    async fn subscribe(&self, party_id: &str) -> Result<EnvelopeStream, TransportError> {
        let (_, rx) = self.registry.lock().await.attach(party_id);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EndReason, SessionId};

    #[tokio::test]
    async fn routes_to_subscriber_and_queues_for_absent_party() {
        let hub = SignalingHub::new();
        let mut alice = hub.subscribe("alice").await.unwrap();

        let to_alice = SignalingEnvelope::hangup(SessionId::new(), "bob", "alice", EndReason::Normal);
        hub.send(&to_alice).await.unwrap();
        assert_eq!(alice.recv().await.unwrap(), to_alice);

        let to_bob = SignalingEnvelope::hangup(SessionId::new(), "alice", "bob", EndReason::Busy);
        hub.send(&to_bob).await.unwrap();
        let mut bob = hub.subscribe("bob").await.unwrap();
        assert_eq!(bob.recv().await.unwrap(), to_bob);
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_stream() {
        let hub = SignalingHub::new();
        let mut first = hub.subscribe("alice").await.unwrap();
        let mut second = hub.subscribe("alice").await.unwrap();

        let env = SignalingEnvelope::hangup(SessionId::new(), "bob", "alice", EndReason::Normal);
        hub.send(&env).await.unwrap();
        assert_eq!(second.recv().await.unwrap(), env);
        assert!(first.recv().await.is_none());
    }
}
