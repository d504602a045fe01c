pub mod loopback;
pub mod peer;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ConnectivityError;
use crate::media::LocalTracks;
use crate::models::{CallMedia, SessionId, TrackKind};
use crate::signaling::{Candidate, Description};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Checking,
    Connected,
    Disconnected,
    Failed,
}

/// Typed replacement for the peer connection's callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectivityEvent {
    /// Locally gathered candidate, to be forwarded to the remote party.
    CandidateDiscovered(Candidate),
    StateChanged(ConnectivityState),
    RemoteTrack(TrackKind),
}

/// Sink through which an engine reports events, tagged with its session.
///
/// Unbounded so that an engine emitting from inside a controller call can
/// never block on the controller's own queue.
#[derive(Clone)]
pub struct EngineEvents {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<(SessionId, ConnectivityEvent)>,
}

impl EngineEvents {
    pub fn new(session_id: SessionId, tx: mpsc::UnboundedSender<(SessionId, ConnectivityEvent)>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn emit(&self, event: ConnectivityEvent) {
        if self.tx.send((self.session_id, event)).is_err() {
            debug!("Dropping connectivity event for {}: controller gone", self.session_id);
        }
    }
}

/// Peer transport negotiation for a single session.
///
/// `add_remote_candidate` is only called once a remote description has been
/// applied; [`NegotiationLeg`] does the buffering before that point.
#[async_trait]
pub trait ConnectivityEngine: Send + Sync {
    async fn create_local_description(
        &mut self,
        media: CallMedia,
        tracks: &LocalTracks,
    ) -> Result<Description, ConnectivityError>;

    /// Apply a remote offer and produce the local answer.
    async fn create_answer(
        &mut self,
        offer: Description,
        tracks: &LocalTracks,
    ) -> Result<Description, ConnectivityError>;

    async fn set_remote_description(&mut self, description: Description) -> Result<(), ConnectivityError>;

    async fn add_remote_candidate(&mut self, candidate: Candidate) -> Result<(), ConnectivityError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait ConnectivityFactory: Send + Sync {
    async fn create(&self, events: EngineEvents) -> Result<Box<dyn ConnectivityEngine>, ConnectivityError>;
}

/// Remote candidates held until a remote description exists, in receipt order.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<Candidate>,
}

impl CandidateBuffer {
    pub fn push(&mut self, candidate: Candidate) {
        self.pending.push(candidate);
    }

    pub fn extend(&mut self, candidates: impl IntoIterator<Item = Candidate>) {
        self.pending.extend(candidates);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn take(&mut self) -> Vec<Candidate> {
        std::mem::take(&mut self.pending)
    }
}

/// One session's side of the negotiation: the engine (created lazily, once
/// local media exists) plus the buffer for candidates that arrive early.
pub struct NegotiationLeg {
    factory: Arc<dyn ConnectivityFactory>,
    events: EngineEvents,
    engine: Option<Box<dyn ConnectivityEngine>>,
    buffer: CandidateBuffer,
    remote_set: bool,
}

impl NegotiationLeg {
    pub fn new(factory: Arc<dyn ConnectivityFactory>, events: EngineEvents) -> Self {
        Self {
            factory,
            events,
            engine: None,
            buffer: CandidateBuffer::default(),
            remote_set: false,
        }
    }

    async fn engine(&mut self) -> Result<&mut Box<dyn ConnectivityEngine>, ConnectivityError> {
        if self.engine.is_none() {
            self.engine = Some(self.factory.create(self.events.clone()).await?);
        }
        // Populated just above.
        self.engine
            .as_mut()
            .ok_or_else(|| ConnectivityError::Negotiation("engine unavailable".into()))
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub async fn create_offer(
        &mut self,
        media: CallMedia,
        tracks: &LocalTracks,
    ) -> Result<Description, ConnectivityError> {
        self.engine().await?.create_local_description(media, tracks).await
    }

    /// Incoming side: apply the stored offer, answer it, then drain any
    /// candidates that were waiting for it.
    pub async fn answer(
        &mut self,
        offer: Description,
        tracks: &LocalTracks,
    ) -> Result<Description, ConnectivityError> {
        let answer = self.engine().await?.create_answer(offer, tracks).await?;
        self.remote_set = true;
        self.flush().await;
        Ok(answer)
    }

    /// Outgoing side: apply the remote answer and drain buffered candidates.
    pub async fn apply_answer(&mut self, answer: Description) -> Result<(), ConnectivityError> {
        self.engine().await?.set_remote_description(answer).await?;
        self.remote_set = true;
        self.flush().await;
        Ok(())
    }

    pub async fn add_candidate(&mut self, candidate: Candidate) -> Result<(), ConnectivityError> {
        if !self.remote_set {
            self.buffer.push(candidate);
            debug!(
                "Buffered candidate for {} ({} pending)",
                self.events.session_id(),
                self.buffer.len()
            );
            return Ok(());
        }
        self.engine().await?.add_remote_candidate(candidate).await
    }

    pub fn park(&mut self, candidates: impl IntoIterator<Item = Candidate>) {
        self.buffer.extend(candidates);
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let pending = self.buffer.take();
        let session_id = self.events.session_id();
        debug!("Applying {} buffered candidates for {}", pending.len(), session_id);
        let Ok(engine) = self.engine().await else {
            return;
        };
        for candidate in pending {
            if let Err(e) = engine.add_remote_candidate(candidate).await {
                warn!("Buffered candidate rejected for {}: {}", session_id, e);
            }
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.close().await;
        }
        self.buffer.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::media::MediaCapture;
    use crate::signaling::DescriptionKind;

    #[derive(Default, Clone)]
    struct Recorder {
        applied: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingEngine(Recorder);

    #[async_trait]
    impl ConnectivityEngine for RecordingEngine {
        async fn create_local_description(
            &mut self,
            _media: CallMedia,
            _tracks: &LocalTracks,
        ) -> Result<Description, ConnectivityError> {
            Ok(Description { kind: DescriptionKind::Offer, sdp: "offer".into() })
        }

        async fn create_answer(
            &mut self,
            _offer: Description,
            _tracks: &LocalTracks,
        ) -> Result<Description, ConnectivityError> {
            Ok(Description { kind: DescriptionKind::Answer, sdp: "answer".into() })
        }

        async fn set_remote_description(&mut self, _d: Description) -> Result<(), ConnectivityError> {
            Ok(())
        }

        async fn add_remote_candidate(&mut self, c: Candidate) -> Result<(), ConnectivityError> {
            self.0.applied.lock().unwrap().push(c.candidate);
            Ok(())
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl ConnectivityFactory for Recorder {
        async fn create(&self, _events: EngineEvents) -> Result<Box<dyn ConnectivityEngine>, ConnectivityError> {
            Ok(Box::new(RecordingEngine(self.clone())))
        }
    }

    fn leg(recorder: &Recorder) -> NegotiationLeg {
        let (tx, _rx) = mpsc::unbounded_channel();
        NegotiationLeg::new(Arc::new(recorder.clone()), EngineEvents::new(SessionId::new(), tx))
    }

    #[tokio::test]
    async fn early_candidates_apply_in_receipt_order_after_answer() {
        let recorder = Recorder::default();
        let mut leg = leg(&recorder);
        let tracks = MediaCapture::headless().acquire(CallMedia::AudioOnly).await.unwrap();

        leg.create_offer(CallMedia::AudioOnly, &tracks).await.unwrap();
        for c in ["c1", "c2", "c3"] {
            leg.add_candidate(Candidate::new(c)).await.unwrap();
        }
        assert_eq!(leg.buffered(), 3);
        assert!(recorder.applied.lock().unwrap().is_empty());

        leg.apply_answer(Description { kind: DescriptionKind::Answer, sdp: "a".into() })
            .await
            .unwrap();
        leg.add_candidate(Candidate::new("c4")).await.unwrap();

        assert_eq!(leg.buffered(), 0);
        assert_eq!(*recorder.applied.lock().unwrap(), vec!["c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn parked_candidates_precede_later_ones() {
        let recorder = Recorder::default();
        let mut leg = leg(&recorder);
        leg.park(vec![Candidate::new("early")]);
        leg.add_candidate(Candidate::new("ringing")).await.unwrap();

        let tracks = MediaCapture::headless().acquire(CallMedia::AudioOnly).await.unwrap();
        leg.answer(Description { kind: DescriptionKind::Offer, sdp: "o".into() }, &tracks)
            .await
            .unwrap();
        assert_eq!(*recorder.applied.lock().unwrap(), vec!["early", "ringing"]);
    }
}
