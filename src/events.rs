use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{CallMedia, EndReason, PartyId, Phase, SessionId, TrackKind};

/// UI-facing call events. Emitted by the session controller, consumed by the
/// WebSocket API and by anything else holding a receiver.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum CallEvent {
    #[serde(rename_all = "camelCase")]
    SessionStateChanged {
        session_id: SessionId,
        phase: Phase,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<EndReason>,
    },
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        session_id: SessionId,
        from: PartyId,
        media: CallMedia,
    },
    #[serde(rename_all = "camelCase")]
    RemoteTrackAvailable { session_id: SessionId, kind: TrackKind },
    #[serde(rename_all = "camelCase")]
    MediaStateChanged {
        session_id: SessionId,
        muted: bool,
        video_enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    CallError {
        session_id: SessionId,
        kind: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionEnded {
        session_id: SessionId,
        elapsed_seconds: u64,
        reason: EndReason,
    },
}

impl CallEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            CallEvent::SessionStateChanged { session_id, .. }
            | CallEvent::IncomingCall { session_id, .. }
            | CallEvent::RemoteTrackAvailable { session_id, .. }
            | CallEvent::MediaStateChanged { session_id, .. }
            | CallEvent::CallError { session_id, .. }
            | CallEvent::SessionEnded { session_id, .. } => *session_id,
        }
    }
}

pub type EventSender = broadcast::Sender<CallEvent>;
pub type EventReceiver = broadcast::Receiver<CallEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_for_the_ui() {
        let sid = SessionId::new();
        let json = serde_json::to_value(CallEvent::SessionEnded {
            session_id: sid,
            elapsed_seconds: 12,
            reason: EndReason::Timeout,
        })
        .unwrap();
        assert_eq!(json["type"], "sessionEnded");
        assert_eq!(json["data"]["elapsedSeconds"], 12);
        assert_eq!(json["data"]["reason"], "timeout");
        assert_eq!(json["data"]["sessionId"], sid.to_string());
    }

    #[test]
    fn state_change_omits_absent_reason() {
        let json = serde_json::to_value(CallEvent::SessionStateChanged {
            session_id: SessionId::new(),
            phase: Phase::Ringing,
            reason: None,
        })
        .unwrap();
        assert_eq!(json["data"]["phase"], "ringing");
        assert!(json["data"].get("reason").is_none());
    }
}
