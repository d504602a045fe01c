use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CallError;

pub type PartyId = String;

// ============================================================
// Identifiers & media
// ============================================================

/// Signaling correlation key. Created once per call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMedia {
    AudioOnly,
    AudioVideo,
}

impl CallMedia {
    pub fn has_video(self) -> bool {
        matches!(self, CallMedia::AudioVideo)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

// ============================================================
// Lifecycle
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Negotiating,
    Ringing,
    Connecting,
    Connected,
    Ending,
    Ended,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Ended | Phase::Failed)
    }

    /// The legal edges of the call state machine. `Failed` is reachable from
    /// every non-terminal phase; nothing leaves a terminal phase.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Negotiating)
                | (Idle, Ringing)
                | (Negotiating, Ringing)
                | (Negotiating, Connecting)
                | (Ringing, Connecting)
                | (Connecting, Connected)
                | (Negotiating, Ending)
                | (Ringing, Ending)
                | (Connecting, Ending)
                | (Connected, Ending)
                | (Ending, Ended)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Negotiating => "negotiating",
            Phase::Ringing => "ringing",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Ending => "ending",
            Phase::Ended => "ended",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a session reached a terminal phase. Each one is rendered differently
/// by the UI ("no answer" for `Timeout`, "busy" for `Busy`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Normal,
    Declined,
    Cancelled,
    Timeout,
    Busy,
    Failed,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndReason::Normal => "normal",
            EndReason::Declined => "declined",
            EndReason::Cancelled => "cancelled",
            EndReason::Timeout => "timeout",
            EndReason::Busy => "busy",
            EndReason::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ============================================================
// Session
// ============================================================

/// One call attempt between the local party and a remote party.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: SessionId,
    pub local_party_id: PartyId,
    pub remote_party_id: PartyId,
    pub direction: Direction,
    pub media: CallMedia,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    pub muted: bool,
    pub video_enabled: bool,
}

impl Session {
    pub fn new(
        session_id: SessionId,
        local_party_id: PartyId,
        remote_party_id: PartyId,
        direction: Direction,
        media: CallMedia,
    ) -> Self {
        Self {
            session_id,
            local_party_id,
            remote_party_id,
            direction,
            media,
            phase: Phase::Idle,
            started_at: None,
            ended_at: None,
            end_reason: None,
            muted: false,
            video_enabled: media.has_video(),
        }
    }

    /// Move to `next`, stamping `started_at` on the first entry into
    /// Connected and `ended_at` on entry into a terminal phase.
    pub fn transition(&mut self, next: Phase) -> Result<(), CallError> {
        if !self.phase.can_transition_to(next) {
            return Err(CallError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        let now = Utc::now();
        match next {
            Phase::Connected if self.started_at.is_none() => self.started_at = Some(now),
            Phase::Ended | Phase::Failed => self.ended_at = Some(now),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> Session {
        Session::new(
            SessionId::new(),
            "alice".into(),
            "bob".into(),
            Direction::Outgoing,
            CallMedia::AudioVideo,
        )
    }

    #[test]
    fn happy_path_stamps_timestamps() {
        let mut s = outgoing();
        for phase in [Phase::Negotiating, Phase::Connecting, Phase::Connected] {
            s.transition(phase).unwrap();
        }
        let started = s.started_at.expect("started_at set on connect");
        assert!(s.ended_at.is_none());

        s.transition(Phase::Ending).unwrap();
        s.transition(Phase::Ended).unwrap();
        assert_eq!(s.started_at, Some(started));
        assert!(s.ended_at.is_some());
    }

    #[test]
    fn connected_teardown_cannot_skip_ending() {
        let mut s = outgoing();
        s.transition(Phase::Negotiating).unwrap();
        s.transition(Phase::Connecting).unwrap();
        s.transition(Phase::Connected).unwrap();
        assert!(s.transition(Phase::Ended).is_err());
        assert_eq!(s.phase, Phase::Connected);
    }

    #[test]
    fn terminal_phases_are_final() {
        let mut s = outgoing();
        s.transition(Phase::Failed).unwrap();
        for next in [Phase::Idle, Phase::Connected, Phase::Ending, Phase::Failed] {
            assert!(s.transition(next).is_err());
        }
    }

    #[test]
    fn rejected_transition_leaves_phase_untouched() {
        let mut s = outgoing();
        assert!(matches!(
            s.transition(Phase::Connected),
            Err(CallError::InvalidTransition { from: Phase::Idle, to: Phase::Connected })
        ));
        assert_eq!(s.phase, Phase::Idle);
        assert!(s.started_at.is_none());
    }

    #[test]
    fn audio_only_starts_with_video_disabled() {
        let s = Session::new(
            SessionId::new(),
            "a".into(),
            "b".into(),
            Direction::Incoming,
            CallMedia::AudioOnly,
        );
        assert!(!s.video_enabled);
        assert!(!s.muted);
    }

    #[test]
    fn session_serializes_camel_case() {
        let s = outgoing();
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["remotePartyId"], "bob");
        assert_eq!(json["phase"], "idle");
        assert_eq!(json["media"], "audio_video");
        assert!(json.get("startedAt").is_none());
    }
}
