use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::SignalingEnvelope;
use crate::models::PartyId;

/// Max envelopes held for a party with no live subscription.
const MAILBOX_CAPACITY: usize = 256;
/// Buffer of a live subscription channel.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Routing table shared by the in-process hub and the rendezvous server:
/// live subscriptions keyed by recipient, plus a store-and-forward mailbox
/// for recipients that are not currently attached.
#[derive(Default)]
pub struct Registry {
    live: HashMap<PartyId, (u64, mpsc::Sender<SignalingEnvelope>)>,
    mailboxes: HashMap<PartyId, VecDeque<SignalingEnvelope>>,
    next_generation: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscription for `party`, replacing any previous one. Mailbox
    /// contents are flushed into the new channel first, in arrival order.
    /// Returns the subscription generation, used to detach only this one.
    pub fn attach(&mut self, party: &str) -> (u64, mpsc::Receiver<SignalingEnvelope>) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        if let Some(pending) = self.mailboxes.remove(party) {
            debug!("Flushing {} queued envelopes to {}", pending.len(), party);
            for envelope in pending {
                if tx.try_send(envelope).is_err() {
                    warn!("Subscription buffer full while flushing mailbox for {}", party);
                    break;
                }
            }
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.live.insert(party.to_string(), (generation, tx));
        (generation, rx)
    }

    pub fn detach(&mut self, party: &str, generation: u64) {
        if matches!(self.live.get(party), Some((g, _)) if *g == generation) {
            self.live.remove(party);
        }
    }

    pub fn is_attached(&self, party: &str) -> bool {
        self.live.get(party).is_some_and(|(_, tx)| !tx.is_closed())
    }

    /// Deliver to the live subscriber if there is one, otherwise queue.
    pub fn route(&mut self, envelope: SignalingEnvelope) {
        let to = envelope.to.clone();
        let envelope = match self.live.get(&to) {
            Some((_, tx)) => match tx.try_send(envelope) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(envelope)) => {
                    warn!("Subscription for {} is full, queueing envelope", to);
                    envelope
                }
                Err(mpsc::error::TrySendError::Closed(envelope)) => {
                    debug!("Subscription for {} closed, queueing envelope", to);
                    self.live.remove(&to);
                    envelope
                }
            },
            None => envelope,
        };
        self.enqueue(to, envelope);
    }

    fn enqueue(&mut self, to: PartyId, envelope: SignalingEnvelope) {
        let mailbox = self.mailboxes.entry(to.clone()).or_default();
        if mailbox.len() >= MAILBOX_CAPACITY {
            warn!("Mailbox for {} full, dropping oldest envelope", to);
            mailbox.pop_front();
        }
        mailbox.push_back(envelope);
    }

    /// Take everything queued for `party` (the polling variant of delivery).
    pub fn drain(&mut self, party: &str) -> Vec<SignalingEnvelope> {
        self.mailboxes
            .remove(party)
            .map(Vec::from)
            .unwrap_or_default()
    }
}
