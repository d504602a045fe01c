use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as WrtcMediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use super::{
    ConnectivityEngine, ConnectivityEvent, ConnectivityFactory, ConnectivityState, EngineEvents,
};
use crate::error::ConnectivityError;
use crate::media::LocalTracks;
use crate::models::{CallMedia, TrackKind};
use crate::signaling::{Candidate, Description, DescriptionKind};

fn negotiation(context: &str) -> impl Fn(webrtc::Error) -> ConnectivityError + '_ {
    move |e| ConnectivityError::Negotiation(format!("{}: {}", context, e))
}

fn to_rtc(description: Description) -> Result<RTCSessionDescription, ConnectivityError> {
    let parsed = match description.kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp),
        DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| ConnectivityError::InvalidDescription(e.to_string()))
}

fn from_rtc(description: &RTCSessionDescription) -> Result<Description, ConnectivityError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => DescriptionKind::Offer,
        RTCSdpType::Answer => DescriptionKind::Answer,
        other => {
            return Err(ConnectivityError::InvalidDescription(format!(
                "unsupported local description type {}",
                other
            )))
        }
    };
    Ok(Description {
        kind,
        sdp: description.sdp.clone(),
    })
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
            Some(ConnectivityState::Checking)
        }
        RTCPeerConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectivityState::Failed),
        // Closed only follows our own close(); the session is already gone.
        RTCPeerConnectionState::Closed | RTCPeerConnectionState::Unspecified => None,
    }
}

/// Negotiates one peer connection with the `webrtc` crate.
pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    events: EngineEvents,
    tracks_added: bool,
}

impl WebRtcEngine {
    pub async fn new(ice_servers: &[String], events: EngineEvents) -> Result<Self, ConnectivityError> {
        let mut media_engine = WrtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(negotiation("register codecs"))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(negotiation("register interceptors"))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(negotiation("create peer connection"))?,
        );

        let engine = Self {
            pc,
            events,
            tracks_added: false,
        };
        engine.install_handlers();
        info!("Created WebRTC peer connection for {}", engine.events.session_id());
        Ok(engine)
    }

    fn install_handlers(&self) {
        let events_state = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events_state.clone();
                Box::pin(async move {
                    info!("WebRTC session {} state: {}", events.session_id(), state);
                    if let Some(mapped) = map_state(state) {
                        events.emit(ConnectivityEvent::StateChanged(mapped));
                    }
                })
            }));

        let events_track = self.events.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events_track.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    RTPCodecType::Unspecified => return,
                };
                info!("Remote {} track on {}", kind, events.session_id());
                events.emit(ConnectivityEvent::RemoteTrack(kind));
            })
        }));

        let events_ice = self.events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let events = events_ice.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.emit(ConnectivityEvent::CandidateDiscovered(Candidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));
    }

    async fn add_tracks(&mut self, tracks: &LocalTracks) -> Result<(), ConnectivityError> {
        if self.tracks_added {
            return Ok(());
        }
        for local in tracks.iter() {
            let rtp_sender = self
                .pc
                .add_track(local.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(negotiation("add local track"))?;

            // Read incoming RTCP packets (needed by webrtc crate for proper operation)
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while rtp_sender.read(&mut buf).await.is_ok() {}
            });
        }
        self.tracks_added = true;
        Ok(())
    }
}

#[async_trait]
impl ConnectivityEngine for WebRtcEngine {
    async fn create_local_description(
        &mut self,
        _media: CallMedia,
        tracks: &LocalTracks,
    ) -> Result<Description, ConnectivityError> {
        self.add_tracks(tracks).await?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(negotiation("create offer"))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation("set local description"))?;
        debug!("Created WebRTC offer for {}", self.events.session_id());
        from_rtc(&offer)
    }

    async fn create_answer(
        &mut self,
        offer: Description,
        tracks: &LocalTracks,
    ) -> Result<Description, ConnectivityError> {
        if offer.kind != DescriptionKind::Offer {
            return Err(ConnectivityError::InvalidDescription("expected an offer".into()));
        }
        self.add_tracks(tracks).await?;
        self.pc
            .set_remote_description(to_rtc(offer)?)
            .await
            .map_err(negotiation("set remote description"))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(negotiation("create answer"))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation("set local description"))?;
        debug!("Created WebRTC answer for {}", self.events.session_id());
        from_rtc(&answer)
    }

    async fn set_remote_description(&mut self, description: Description) -> Result<(), ConnectivityError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(negotiation("set remote description"))?;
        info!("Applied WebRTC answer for {}", self.events.session_id());
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: Candidate) -> Result<(), ConnectivityError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| ConnectivityError::InvalidCandidate(e.to_string()))?;
        debug!("Added ICE candidate for {}", self.events.session_id());
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection for {}: {}", self.events.session_id(), e);
        }
        info!("Closed peer connection for {}", self.events.session_id());
    }
}

/// Builds a fresh [`WebRtcEngine`] per session against the configured STUN
/// servers.
#[derive(Clone)]
pub struct WebRtcFactory {
    ice_servers: Arc<Vec<String>>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers: Arc::new(ice_servers),
        }
    }
}

#[async_trait]
impl ConnectivityFactory for WebRtcFactory {
    async fn create(&self, events: EngineEvents) -> Result<Box<dyn ConnectivityEngine>, ConnectivityError> {
        Ok(Box::new(WebRtcEngine::new(&self.ice_servers, events).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_states_map_onto_connectivity_states() {
        assert_eq!(map_state(RTCPeerConnectionState::Connecting), Some(ConnectivityState::Checking));
        assert_eq!(map_state(RTCPeerConnectionState::Connected), Some(ConnectivityState::Connected));
        assert_eq!(
            map_state(RTCPeerConnectionState::Disconnected),
            Some(ConnectivityState::Disconnected)
        );
        assert_eq!(map_state(RTCPeerConnectionState::Failed), Some(ConnectivityState::Failed));
        assert_eq!(map_state(RTCPeerConnectionState::Closed), None);
    }

    #[test]
    fn garbage_sdp_is_an_invalid_description() {
        let err = to_rtc(Description {
            kind: DescriptionKind::Offer,
            sdp: "not sdp".into(),
        });
        assert!(matches!(err, Err(ConnectivityError::InvalidDescription(_))));
    }
}
