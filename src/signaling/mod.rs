pub mod hub;
pub mod registry;
pub mod websocket;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{CallError, TransportError};
use crate::models::{CallMedia, EndReason, PartyId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Offer,
    Answer,
    Candidate,
    Hangup,
}

/// Session description in the `{type, sdp}` shape browsers and the `webrtc`
/// crate both use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Connectivity candidate, mirroring `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl Candidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferPayload {
    pub description: Description,
    pub media: CallMedia,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub description: Description,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HangupPayload {
    pub reason: EndReason,
}

/// One signaling message unit exchanged via the rendezvous channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    pub kind: EnvelopeKind,
    pub session_id: SessionId,
    pub from: PartyId,
    pub to: PartyId,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SignalingEnvelope {
    fn with_payload<T: Serialize>(
        kind: EnvelopeKind,
        session_id: SessionId,
        from: &str,
        to: &str,
        payload: &T,
    ) -> Self {
        Self {
            kind,
            session_id,
            from: from.to_string(),
            to: to.to_string(),
            // Payload types are plain structs of strings and enums.
            payload: serde_json::to_value(payload).unwrap_or_default(),
        }
    }

    pub fn offer(session_id: SessionId, from: &str, to: &str, description: Description, media: CallMedia) -> Self {
        Self::with_payload(
            EnvelopeKind::Offer,
            session_id,
            from,
            to,
            &OfferPayload { description, media },
        )
    }

    pub fn answer(session_id: SessionId, from: &str, to: &str, description: Description) -> Self {
        Self::with_payload(EnvelopeKind::Answer, session_id, from, to, &AnswerPayload { description })
    }

    pub fn candidate(session_id: SessionId, from: &str, to: &str, candidate: &Candidate) -> Self {
        Self::with_payload(EnvelopeKind::Candidate, session_id, from, to, candidate)
    }

    pub fn hangup(session_id: SessionId, from: &str, to: &str, reason: EndReason) -> Self {
        Self::with_payload(EnvelopeKind::Hangup, session_id, from, to, &HangupPayload { reason })
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, CallError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            CallError::ProtocolViolation(format!(
                "malformed {:?} payload for session {}: {}",
                self.kind, self.session_id, e
            ))
        })
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Encode(e.to_string()))
    }
}

pub type EnvelopeStream = mpsc::Receiver<SignalingEnvelope>;

/// Delivers envelopes between endpoints through a rendezvous channel.
///
/// Session correlation travels in-band (`session_id`), so a subscription can
/// be dropped and re-established without losing track of any call.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, envelope: &SignalingEnvelope) -> Result<(), TransportError>;

    /// Envelopes addressed to `party_id`, until the channel drops.
    async fn subscribe(&self, party_id: &str) -> Result<EnvelopeStream, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let sid = SessionId::new();
        let env = SignalingEnvelope::hangup(sid, "alice", "bob", EndReason::Busy);
        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();

        assert_eq!(json["kind"], "hangup");
        assert_eq!(json["sessionId"], sid.to_string());
        assert_eq!(json["from"], "alice");
        assert_eq!(json["to"], "bob");
        assert_eq!(json["payload"]["reason"], "busy");
    }

    #[test]
    fn candidate_payload_uses_browser_field_names() {
        let mut c = Candidate::new("candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host");
        c.sdp_mid = Some("0".into());
        c.sdp_mline_index = Some(0);
        let env = SignalingEnvelope::candidate(SessionId::new(), "a", "b", &c);

        assert_eq!(env.payload["sdpMid"], "0");
        assert_eq!(env.payload["sdpMLineIndex"], 0);
        assert_eq!(env.decode_payload::<Candidate>().unwrap(), c);
    }

    #[test]
    fn malformed_payload_is_a_protocol_violation() {
        let mut env = SignalingEnvelope::hangup(SessionId::new(), "a", "b", EndReason::Normal);
        env.kind = EnvelopeKind::Offer;
        let err = env.decode_payload::<OfferPayload>().unwrap_err();
        assert!(matches!(err, CallError::ProtocolViolation(_)));
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let raw = format!(
            r#"{{"kind":"hangup","sessionId":"{}","from":"a","to":"b"}}"#,
            SessionId::new()
        );
        let env: SignalingEnvelope = serde_json::from_str(&raw).unwrap();
        assert!(env.payload.is_null());
        assert!(env.decode_payload::<HangupPayload>().is_err());
    }
}
