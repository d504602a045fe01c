use async_trait::async_trait;
use tracing::debug;

use super::{
    ConnectivityEngine, ConnectivityEvent, ConnectivityFactory, ConnectivityState, EngineEvents,
};
use crate::error::ConnectivityError;
use crate::media::LocalTracks;
use crate::models::{CallMedia, TrackKind};
use crate::signaling::{Candidate, Description, DescriptionKind};

/// Engine that needs no network: it reports Connected as soon as both a
/// local and a remote description are in place, and announces remote tracks
/// for the media the remote side offered. For headless runs and tests.
pub struct LoopbackEngine {
    events: EngineEvents,
    local: Option<Description>,
    remote: Option<Description>,
    remote_candidates: Vec<Candidate>,
    connected: bool,
    stall: bool,
}

fn media_tag(media: CallMedia) -> &'static str {
    match media {
        CallMedia::AudioOnly => "audio_only",
        CallMedia::AudioVideo => "audio_video",
    }
}

impl LoopbackEngine {
    pub fn new(events: EngineEvents) -> Self {
        Self {
            events,
            local: None,
            remote: None,
            remote_candidates: Vec::new(),
            connected: false,
            stall: false,
        }
    }

    fn describe(&self, kind: DescriptionKind, media: CallMedia) -> Description {
        Description {
            kind,
            sdp: format!(
                "v=0\r\ns=chatr-loopback\r\na=session:{}\r\na=media:{}\r\n",
                self.events.session_id(),
                media_tag(media)
            ),
        }
    }

    fn gather(&self) {
        self.events.emit(ConnectivityEvent::CandidateDiscovered(Candidate {
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }

    fn maybe_connect(&mut self) {
        let (Some(_), Some(remote)) = (&self.local, &self.remote) else {
            return;
        };
        if self.connected {
            return;
        }
        let remote_video = remote.sdp.contains("a=media:audio_video");
        self.events.emit(ConnectivityEvent::StateChanged(ConnectivityState::Checking));
        if self.stall {
            return;
        }
        self.connected = true;
        self.events.emit(ConnectivityEvent::StateChanged(ConnectivityState::Connected));
        self.events.emit(ConnectivityEvent::RemoteTrack(TrackKind::Audio));
        if remote_video {
            self.events.emit(ConnectivityEvent::RemoteTrack(TrackKind::Video));
        }
    }

    fn media_of(desc: &Description) -> CallMedia {
        if desc.sdp.contains("a=media:audio_video") {
            CallMedia::AudioVideo
        } else {
            CallMedia::AudioOnly
        }
    }
}

#[async_trait]
impl ConnectivityEngine for LoopbackEngine {
    async fn create_local_description(
        &mut self,
        media: CallMedia,
        _tracks: &LocalTracks,
    ) -> Result<Description, ConnectivityError> {
        let offer = self.describe(DescriptionKind::Offer, media);
        self.local = Some(offer.clone());
        self.gather();
        self.maybe_connect();
        Ok(offer)
    }

    async fn create_answer(
        &mut self,
        offer: Description,
        tracks: &LocalTracks,
    ) -> Result<Description, ConnectivityError> {
        if offer.kind != DescriptionKind::Offer {
            return Err(ConnectivityError::InvalidDescription("expected an offer".into()));
        }
        // Answer with what we actually hold, never more than was offered.
        let media = match (Self::media_of(&offer), tracks.video.is_some()) {
            (CallMedia::AudioVideo, true) => CallMedia::AudioVideo,
            _ => CallMedia::AudioOnly,
        };
        self.remote = Some(offer);
        let answer = self.describe(DescriptionKind::Answer, media);
        self.local = Some(answer.clone());
        self.gather();
        self.maybe_connect();
        Ok(answer)
    }

    async fn set_remote_description(&mut self, description: Description) -> Result<(), ConnectivityError> {
        if description.kind != DescriptionKind::Answer {
            return Err(ConnectivityError::InvalidDescription("expected an answer".into()));
        }
        self.remote = Some(description);
        self.maybe_connect();
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: Candidate) -> Result<(), ConnectivityError> {
        if candidate.candidate.is_empty() {
            return Err(ConnectivityError::InvalidCandidate("empty candidate".into()));
        }
        self.remote_candidates.push(candidate);
        debug!(
            "Loopback {} has {} remote candidates",
            self.events.session_id(),
            self.remote_candidates.len()
        );
        Ok(())
    }

    async fn close(&mut self) {
        self.connected = false;
    }
}

/// Creates [`LoopbackEngine`]s. A stalled factory's engines stop at
/// Checking and never connect.
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    stall: bool,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stalled() -> Self {
        Self { stall: true }
    }
}

#[async_trait]
impl ConnectivityFactory for LoopbackFactory {
    async fn create(&self, events: EngineEvents) -> Result<Box<dyn ConnectivityEngine>, ConnectivityError> {
        let mut engine = LoopbackEngine::new(events);
        engine.stall = self.stall;
        Ok(Box::new(engine))
    }
}
