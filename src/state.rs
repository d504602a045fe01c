use crate::events::EventSender;
use crate::models::PartyId;
use crate::session::CallHandle;

/// Transport-agnostic context shared by the API routes and the WebSocket bridge.
#[derive(Clone)]
pub struct ServiceContext {
    pub party_id: PartyId,
    pub calls: CallHandle,
    pub event_tx: EventSender,
}

impl ServiceContext {
    pub fn new(calls: CallHandle, event_tx: EventSender) -> Self {
        Self {
            party_id: calls.party_id().to_string(),
            calls,
            event_tx,
        }
    }
}
