#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Semaphore;

use chatr_call::config::CallConfig;
use chatr_call::connectivity::{
    ConnectivityEngine, ConnectivityEvent, ConnectivityFactory, EngineEvents,
};
use chatr_call::error::{ConnectivityError, MediaError, TransportError};
use chatr_call::events::{create_event_bus, CallEvent, EventReceiver};
use chatr_call::media::{CaptureBackend, DeviceHandle, LocalTracks, MediaCapture};
use chatr_call::models::{CallMedia, EndReason, Phase, SessionId, TrackKind};
use chatr_call::session::{CallHandle, ControllerDeps, SessionController};
use chatr_call::signaling::{
    Candidate, Description, DescriptionKind, EnvelopeKind, EnvelopeStream, SignalingEnvelope,
    SignalingTransport,
};

/// Longer than any session timeout, so waits only give up on real hangs.
pub const WAIT: Duration = Duration::from_secs(120);

pub struct Endpoint {
    pub calls: CallHandle,
    pub events: EventReceiver,
    pub media: MediaCapture,
}

pub async fn endpoint(
    party: &str,
    transport: Arc<dyn SignalingTransport>,
    connectivity: Arc<dyn ConnectivityFactory>,
) -> Endpoint {
    endpoint_with(CallConfig::for_party(party), transport, connectivity, MediaCapture::headless()).await
}

pub async fn endpoint_with(
    config: CallConfig,
    transport: Arc<dyn SignalingTransport>,
    connectivity: Arc<dyn ConnectivityFactory>,
    media: MediaCapture,
) -> Endpoint {
    let (event_tx, events) = create_event_bus();
    let calls = SessionController::start(ControllerDeps {
        config,
        transport,
        media: media.clone(),
        connectivity,
        events: event_tx,
    })
    .await
    .expect("controller starts");
    Endpoint { calls, events, media }
}

// ------------------------------------------------------------------
// Waiting
// ------------------------------------------------------------------

pub async fn next_event<F>(rx: &mut EventReceiver, mut pred: F) -> CallEvent
where
    F: FnMut(&CallEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn wait_phase(rx: &mut EventReceiver, session_id: SessionId, phase: Phase) -> Option<EndReason> {
    match next_event(rx, |e| {
        matches!(e, CallEvent::SessionStateChanged { session_id: s, phase: p, .. } if *s == session_id && *p == phase)
    })
    .await
    {
        CallEvent::SessionStateChanged { reason, .. } => reason,
        _ => unreachable!(),
    }
}

pub async fn wait_incoming(rx: &mut EventReceiver) -> SessionId {
    next_event(rx, |e| matches!(e, CallEvent::IncomingCall { .. }))
        .await
        .session_id()
}

/// Returns (elapsed seconds, reason).
pub async fn wait_ended(rx: &mut EventReceiver, session_id: SessionId) -> (u64, EndReason) {
    match next_event(rx, |e| {
        matches!(e, CallEvent::SessionEnded { session_id: s, .. } if *s == session_id)
    })
    .await
    {
        CallEvent::SessionEnded { elapsed_seconds, reason, .. } => (elapsed_seconds, reason),
        _ => unreachable!(),
    }
}

pub async fn wait_error(rx: &mut EventReceiver, session_id: SessionId) -> String {
    match next_event(rx, |e| {
        matches!(e, CallEvent::CallError { session_id: s, .. } if *s == session_id)
    })
    .await
    {
        CallEvent::CallError { kind, .. } => kind,
        _ => unreachable!(),
    }
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true")
}

/// Next envelope of `kind`, skipping the rest (candidates, mostly).
pub async fn next_envelope(rx: &mut EnvelopeStream, kind: EnvelopeKind) -> SignalingEnvelope {
    tokio::time::timeout(WAIT, async {
        loop {
            let envelope = rx.recv().await.expect("signaling stream open");
            if envelope.kind == kind {
                return envelope;
            }
        }
    })
    .await
    .expect("timed out waiting for envelope")
}

// ------------------------------------------------------------------
// Raw parties: drive the protocol by hand
// ------------------------------------------------------------------

pub fn offer(session_id: SessionId, from: &str, to: &str, media: CallMedia) -> SignalingEnvelope {
    let description = Description {
        kind: DescriptionKind::Offer,
        sdp: "v=0\r\ns=raw\r\n".into(),
    };
    SignalingEnvelope::offer(session_id, from, to, description, media)
}

pub fn answer(session_id: SessionId, from: &str, to: &str) -> SignalingEnvelope {
    let description = Description {
        kind: DescriptionKind::Answer,
        sdp: "v=0\r\ns=raw\r\n".into(),
    };
    SignalingEnvelope::answer(session_id, from, to, description)
}

pub fn candidate(session_id: SessionId, from: &str, to: &str, name: &str) -> SignalingEnvelope {
    SignalingEnvelope::candidate(session_id, from, to, &Candidate::new(name))
}

// ------------------------------------------------------------------
// Fakes
// ------------------------------------------------------------------

/// Fails the first `failures` sends, then delegates.
pub struct FlakyTransport {
    inner: Arc<dyn SignalingTransport>,
    failures: AtomicUsize,
    pub attempts: AtomicUsize,
}

impl FlakyTransport {
    pub fn new(inner: Arc<dyn SignalingTransport>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SignalingTransport for FlakyTransport {
    async fn send(&self, envelope: &SignalingEnvelope) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Network("injected failure".into()));
        }
        self.inner.send(envelope).await
    }

    async fn subscribe(&self, party_id: &str) -> Result<EnvelopeStream, TransportError> {
        self.inner.subscribe(party_id).await
    }
}

/// Never completes a send addressed to `stalled`; everything else passes
/// through.
pub struct StallingTransport {
    inner: Arc<dyn SignalingTransport>,
    stalled: String,
    pub stuck: AtomicUsize,
}

impl StallingTransport {
    pub fn new(inner: Arc<dyn SignalingTransport>, stalled: &str) -> Self {
        Self {
            inner,
            stalled: stalled.to_string(),
            stuck: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SignalingTransport for StallingTransport {
    async fn send(&self, envelope: &SignalingEnvelope) -> Result<(), TransportError> {
        if envelope.to == self.stalled {
            self.stuck.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
        self.inner.send(envelope).await
    }

    async fn subscribe(&self, party_id: &str) -> Result<EnvelopeStream, TransportError> {
        self.inner.subscribe(party_id).await
    }
}

/// Counts devices that are currently open.
pub struct LiveDevice(Arc<AtomicUsize>);

impl LiveDevice {
    fn open(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for LiveDevice {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Microphone opens at once; the camera waits for a permit.
#[derive(Clone)]
pub struct SlowBackend {
    pub live: Arc<AtomicUsize>,
    pub camera_gate: Arc<Semaphore>,
}

impl SlowBackend {
    pub fn new() -> Self {
        Self {
            live: Arc::new(AtomicUsize::new(0)),
            camera_gate: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureBackend for SlowBackend {
    async fn open(&self, kind: TrackKind) -> Result<DeviceHandle, MediaError> {
        if kind == TrackKind::Video {
            let permit = self.camera_gate.acquire().await.map_err(|_| MediaError::Cancelled)?;
            permit.forget();
        }
        Ok(DeviceHandle::with_inner(format!("slow-{}", kind), LiveDevice::open(&self.live)))
    }
}

pub struct NoCameraBackend;

#[async_trait]
impl CaptureBackend for NoCameraBackend {
    async fn open(&self, kind: TrackKind) -> Result<DeviceHandle, MediaError> {
        match kind {
            TrackKind::Audio => Ok(DeviceHandle::new("mic")),
            TrackKind::Video => Err(MediaError::PermissionDenied("camera".into())),
        }
    }
}

#[derive(Default)]
struct ScriptState {
    events: HashMap<SessionId, EngineEvents>,
    applied: HashMap<SessionId, Vec<String>>,
}

/// Engines that never connect on their own. Tests inject connectivity
/// events and inspect which remote candidates were applied, in order.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// False if no engine exists yet for the session.
    pub fn emit(&self, session_id: SessionId, event: ConnectivityEvent) -> bool {
        let state = self.state.lock().unwrap();
        match state.events.get(&session_id) {
            Some(events) => {
                events.emit(event);
                true
            }
            None => false,
        }
    }

    pub fn applied(&self, session_id: SessionId) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .applied
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }
}

struct ScriptedEngine {
    session_id: SessionId,
    state: Arc<Mutex<ScriptState>>,
}

#[async_trait]
impl ConnectivityEngine for ScriptedEngine {
    async fn create_local_description(
        &mut self,
        _media: CallMedia,
        _tracks: &LocalTracks,
    ) -> Result<Description, ConnectivityError> {
        Ok(Description { kind: DescriptionKind::Offer, sdp: "scripted-offer".into() })
    }

    async fn create_answer(
        &mut self,
        _offer: Description,
        _tracks: &LocalTracks,
    ) -> Result<Description, ConnectivityError> {
        Ok(Description { kind: DescriptionKind::Answer, sdp: "scripted-answer".into() })
    }

    async fn set_remote_description(&mut self, _description: Description) -> Result<(), ConnectivityError> {
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: Candidate) -> Result<(), ConnectivityError> {
        self.state
            .lock()
            .unwrap()
            .applied
            .entry(self.session_id)
            .or_default()
            .push(candidate.candidate);
        Ok(())
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl ConnectivityFactory for ScriptedFactory {
    async fn create(&self, events: EngineEvents) -> Result<Box<dyn ConnectivityEngine>, ConnectivityError> {
        let session_id = events.session_id();
        self.state.lock().unwrap().events.insert(session_id, events);
        Ok(Box::new(ScriptedEngine {
            session_id,
            state: self.state.clone(),
        }))
    }
}
