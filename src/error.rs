use thiserror::Error;

use crate::models::{Phase, SessionId, TrackKind};

/// Local media device failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
    #[error("media acquisition cancelled")]
    Cancelled,
    #[error("no local {0} track")]
    NoSuchTrack(TrackKind),
    #[error("failed to write media sample: {0}")]
    Write(String),
    #[error("media codec error: {0}")]
    Codec(String),
}

/// Signaling channel failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("signaling network error: {0}")]
    Network(String),
    #[error("signaling channel closed")]
    Closed,
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

/// Peer transport negotiation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid connectivity candidate: {0}")]
    InvalidCandidate(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("connectivity lost")]
    Lost,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no party id configured")]
    MissingPartyId,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    MediaAcquisition(#[from] MediaError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("cannot {command} while session is {phase}")]
    InvalidState { phase: Phase, command: &'static str },
    #[error("illegal phase transition {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("a call with {0} is already active")]
    PairBusy(String),
    #[error("cannot call yourself")]
    SelfCall,
    #[error("session has no video track")]
    NoVideoTrack,
    #[error("call engine stopped")]
    EngineStopped,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CallError {
    /// Short machine-readable tag used in UI-facing error events.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::MediaAcquisition(_) => "media_acquisition",
            CallError::Transport(_) => "transport",
            CallError::Connectivity(_) => "connectivity",
            CallError::ProtocolViolation(_) => "protocol_violation",
            CallError::InvalidState { .. } | CallError::InvalidTransition { .. } => "invalid_state",
            CallError::UnknownSession(_) => "unknown_session",
            CallError::PairBusy(_) => "busy",
            CallError::SelfCall => "self_call",
            CallError::NoVideoTrack => "no_video_track",
            CallError::EngineStopped => "engine_stopped",
            CallError::Config(_) => "config",
            CallError::Io(_) => "io",
        }
    }
}
