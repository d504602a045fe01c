pub mod controller;
pub mod timer;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

pub use controller::{ControllerDeps, SessionController};
pub use timer::{format_duration, CallTimer};

use crate::error::CallError;
use crate::events::{EventReceiver, EventSender};
use crate::models::{CallMedia, PartyId, Session, SessionId};

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// Commands sent to the session controller from the API / UI layer.
#[derive(Debug)]
pub enum CallCommand {
    PlaceCall {
        remote_party_id: PartyId,
        media: CallMedia,
        reply: Reply<SessionId>,
    },
    Accept {
        session_id: SessionId,
        reply: Reply<()>,
    },
    Decline {
        session_id: SessionId,
        reply: Reply<()>,
    },
    Cancel {
        session_id: SessionId,
        reply: Reply<()>,
    },
    End {
        session_id: SessionId,
        reply: Reply<()>,
    },
    ToggleMute {
        session_id: SessionId,
        reply: Reply<bool>,
    },
    ToggleVideo {
        session_id: SessionId,
        reply: Reply<bool>,
    },
}

/// Snapshot returned by GET /calls.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionsView {
    pub active: Vec<Session>,
    /// Most recent first.
    pub recent: Vec<Session>,
}

impl SessionsView {
    pub fn find(&self, session_id: SessionId) -> Option<&Session> {
        self.active
            .iter()
            .chain(self.recent.iter())
            .find(|s| s.session_id == session_id)
    }
}

/// Handle for sending commands to the session controller.
#[derive(Clone)]
pub struct CallHandle {
    party_id: PartyId,
    command_tx: mpsc::Sender<CallCommand>,
    sessions_rx: watch::Receiver<SessionsView>,
    event_tx: EventSender,
}

impl CallHandle {
    pub(crate) fn new(
        party_id: PartyId,
        command_tx: mpsc::Sender<CallCommand>,
        sessions_rx: watch::Receiver<SessionsView>,
        event_tx: EventSender,
    ) -> Self {
        Self {
            party_id,
            command_tx,
            sessions_rx,
            event_tx,
        }
    }

    pub fn party_id(&self) -> &str {
        &self.party_id
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }

    pub fn sessions(&self) -> SessionsView {
        self.sessions_rx.borrow().clone()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> CallCommand) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .await
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)?
    }

    pub async fn place_call(&self, remote_party_id: impl Into<PartyId>, media: CallMedia) -> Result<SessionId, CallError> {
        let remote_party_id = remote_party_id.into();
        self.request(|reply| CallCommand::PlaceCall {
            remote_party_id,
            media,
            reply,
        })
        .await
    }

    pub async fn accept_call(&self, session_id: SessionId) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Accept { session_id, reply }).await
    }

    pub async fn decline_call(&self, session_id: SessionId) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Decline { session_id, reply }).await
    }

    pub async fn cancel_call(&self, session_id: SessionId) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Cancel { session_id, reply }).await
    }

    pub async fn end_call(&self, session_id: SessionId) -> Result<(), CallError> {
        self.request(|reply| CallCommand::End { session_id, reply }).await
    }

    /// Returns the new muted flag.
    pub async fn toggle_mute(&self, session_id: SessionId) -> Result<bool, CallError> {
        self.request(|reply| CallCommand::ToggleMute { session_id, reply }).await
    }

    /// Returns the new video-enabled flag.
    pub async fn toggle_video(&self, session_id: SessionId) -> Result<bool, CallError> {
        self.request(|reply| CallCommand::ToggleVideo { session_id, reply }).await
    }
}
