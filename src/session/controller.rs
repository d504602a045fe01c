use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::timer::{format_duration, CallTimer};
use super::{CallCommand, CallHandle, SessionsView};
use crate::config::CallConfig;
use crate::connectivity::{
    ConnectivityEvent, ConnectivityFactory, ConnectivityState, EngineEvents, NegotiationLeg,
};
use crate::error::{CallError, ConfigError, ConnectivityError, MediaError, TransportError};
use crate::events::{CallEvent, EventSender};
use crate::media::{LocalTracks, MediaCapture};
use crate::models::{
    CallMedia, Direction, EndReason, PartyId, Phase, Session, SessionId, TrackKind,
};
use crate::signaling::{
    AnswerPayload, Candidate, Description, EnvelopeKind, EnvelopeStream, HangupPayload,
    OfferPayload, SignalingEnvelope, SignalingTransport,
};

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

/// Collaborators a controller is built from.
pub struct ControllerDeps {
    pub config: CallConfig,
    pub transport: Arc<dyn SignalingTransport>,
    pub media: MediaCapture,
    pub connectivity: Arc<dyn ConnectivityFactory>,
    pub events: EventSender,
}

/// Results of work the controller started but does not wait for.
enum Completion {
    MediaReady {
        session_id: SessionId,
        result: Result<LocalTracks, MediaError>,
    },
    Timeout {
        session_id: SessionId,
        phase: Phase,
    },
    /// The grace window opened by disconnect number `epoch` has passed.
    DisconnectGrace {
        session_id: SessionId,
        epoch: u64,
    },
    /// A queued envelope could not be delivered, even after the retry.
    SendFailed {
        session_id: SessionId,
        kind: EnvelopeKind,
        error: TransportError,
    },
}

struct CallSession {
    session: Session,
    leg: NegotiationLeg,
    tracks: Option<LocalTracks>,
    /// Incoming only: the offer, held until the user accepts.
    remote_offer: Option<Description>,
    timer: CallTimer,
    /// Cancelled on teardown; stops the acquisition and timeout tasks.
    cancel: CancellationToken,
    acquiring: bool,
    /// Whether the remote party knows this session exists.
    remote_aware: bool,
    /// Set while the peer connection is down but may still recover.
    disconnected: bool,
    disconnects: u64,
    outbox: Outbox,
}

/// Per-session queue of outgoing envelopes, drained by its own task so a
/// stalled send holds up only this session. Envelopes leave in queue order.
/// Dropping the outbox lets the task finish what is queued and exit.
struct Outbox {
    tx: mpsc::UnboundedSender<SignalingEnvelope>,
}

impl Outbox {
    fn spawn(
        session_id: SessionId,
        transport: Arc<dyn SignalingTransport>,
        retry_backoff: Duration,
        completion_tx: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain_outbox(session_id, transport, retry_backoff, rx, completion_tx));
        Self { tx }
    }

    fn push(&self, envelope: SignalingEnvelope) {
        if let Err(mpsc::error::SendError(envelope)) = self.tx.send(envelope) {
            debug!(
                "Outbox for {} is closed, dropping {:?}",
                envelope.session_id, envelope.kind
            );
        }
    }
}

#[derive(Default)]
struct Parked {
    candidates: Vec<Candidate>,
    hung_up: bool,
}

/// Owns every call of one local party. All inputs (UI commands, envelopes,
/// engine events, media completions, timer expiries) are applied one at a
/// time by [`run`](Self::run), so no two transitions ever race.
pub struct SessionController {
    config: CallConfig,
    local_party: PartyId,
    transport: Arc<dyn SignalingTransport>,
    media: MediaCapture,
    connectivity: Arc<dyn ConnectivityFactory>,
    events: EventSender,
    sessions: HashMap<SessionId, CallSession>,
    parked: HashMap<SessionId, Parked>,
    parked_order: VecDeque<SessionId>,
    recent: VecDeque<Session>,
    engine_tx: mpsc::UnboundedSender<(SessionId, ConnectivityEvent)>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    view_tx: watch::Sender<SessionsView>,
}

impl SessionController {
    /// Subscribe to signaling for the configured party and spawn the
    /// controller loop. The loop stops once every [`CallHandle`] is dropped.
    pub async fn start(deps: ControllerDeps) -> Result<CallHandle, CallError> {
        let party = deps.config.party_id.clone();
        if party.is_empty() {
            return Err(ConfigError::MissingPartyId.into());
        }

        let envelopes = deps.transport.subscribe(&party).await?;
        let (envelope_tx, envelope_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_signaling(
            deps.transport.clone(),
            party.clone(),
            envelopes,
            envelope_tx,
        ));

        let (command_tx, command_rx) = mpsc::channel(64);
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(SessionsView::default());

        let handle = CallHandle::new(party.clone(), command_tx, view_rx, deps.events.clone());
        let controller = Self {
            config: deps.config,
            local_party: party,
            transport: deps.transport,
            media: deps.media,
            connectivity: deps.connectivity,
            events: deps.events,
            sessions: HashMap::new(),
            parked: HashMap::new(),
            parked_order: VecDeque::new(),
            recent: VecDeque::new(),
            engine_tx,
            completion_tx,
            view_tx,
        };
        tokio::spawn(controller.run(command_rx, envelope_rx, engine_rx, completion_rx));
        Ok(handle)
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<CallCommand>,
        mut envelope_rx: mpsc::UnboundedReceiver<SignalingEnvelope>,
        mut engine_rx: mpsc::UnboundedReceiver<(SessionId, ConnectivityEvent)>,
        mut completion_rx: mpsc::UnboundedReceiver<Completion>,
    ) {
        info!("Call controller started for {}", self.local_party);

        loop {
            tokio::select! {
                // Local intent is applied before remote input that raced it.
                biased;
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(envelope) = envelope_rx.recv() => self.handle_envelope(envelope).await,
                Some((session_id, event)) = engine_rx.recv() => {
                    self.handle_connectivity(session_id, event).await
                }
                Some(completion) = completion_rx.recv() => self.handle_completion(completion).await,
            }
            self.publish_view();
        }

        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            if let Some(call) = self.sessions.remove(&id) {
                self.terminate(call, EndReason::Normal, true).await;
            }
        }
        self.publish_view();
        info!("Call controller for {} stopped", self.local_party);
    }

    // ------------------------------------------------------------------
    // UI commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: CallCommand) {
        match command {
            CallCommand::PlaceCall {
                remote_party_id,
                media,
                reply,
            } => {
                let _ = reply.send(self.place_call(remote_party_id, media));
            }
            CallCommand::Accept { session_id, reply } => {
                let _ = reply.send(self.accept_call(session_id));
            }
            CallCommand::Decline { session_id, reply } => {
                let result = self
                    .hang_up(session_id, &[Phase::Ringing, Phase::Negotiating], "decline", EndReason::Declined)
                    .await;
                let _ = reply.send(result);
            }
            CallCommand::Cancel { session_id, reply } => {
                let result = self
                    .hang_up(session_id, &[Phase::Ringing, Phase::Negotiating], "cancel", EndReason::Cancelled)
                    .await;
                let _ = reply.send(result);
            }
            CallCommand::End { session_id, reply } => {
                let result = self
                    .hang_up(session_id, &[Phase::Connecting, Phase::Connected], "end", EndReason::Normal)
                    .await;
                let _ = reply.send(result);
            }
            CallCommand::ToggleMute { session_id, reply } => {
                let _ = reply.send(self.toggle_track(session_id, TrackKind::Audio));
            }
            CallCommand::ToggleVideo { session_id, reply } => {
                let _ = reply.send(self.toggle_track(session_id, TrackKind::Video));
            }
        }
    }

    fn place_call(&mut self, remote: PartyId, media: CallMedia) -> Result<SessionId, CallError> {
        if remote == self.local_party {
            return Err(CallError::SelfCall);
        }
        if self.active_with(&remote).is_some() {
            return Err(CallError::PairBusy(remote));
        }

        let session_id = SessionId::new();
        let mut call = self.new_call(Session::new(
            session_id,
            self.local_party.clone(),
            remote.clone(),
            Direction::Outgoing,
            media,
        ));
        self.advance(&mut call, Phase::Negotiating, None);
        self.arm_timeout(&call, Phase::Negotiating, self.config.negotiating_timeout());
        self.spawn_acquisition(&mut call);
        self.sessions.insert(session_id, call);

        info!("Placing {:?} call {} to {}", media, session_id, remote);
        Ok(session_id)
    }

    fn accept_call(&mut self, session_id: SessionId) -> Result<(), CallError> {
        let call = self
            .sessions
            .get_mut(&session_id)
            .ok_or(CallError::UnknownSession(session_id))?;
        let phase = call.session.phase;
        if call.session.direction != Direction::Incoming || phase != Phase::Ringing || call.acquiring {
            return Err(CallError::InvalidState { phase, command: "accept" });
        }

        spawn_acquisition(&self.media, &self.completion_tx, call);
        info!("Accepting call {} from {}", session_id, call.session.remote_party_id);
        Ok(())
    }

    /// Decline, cancel and end share one path: check the phase, tell the
    /// remote, tear down.
    async fn hang_up(
        &mut self,
        session_id: SessionId,
        allowed: &[Phase],
        command: &'static str,
        reason: EndReason,
    ) -> Result<(), CallError> {
        let call = self
            .sessions
            .get(&session_id)
            .ok_or(CallError::UnknownSession(session_id))?;
        let phase = call.session.phase;
        if !allowed.contains(&phase) {
            return Err(CallError::InvalidState { phase, command });
        }
        if let Some(call) = self.sessions.remove(&session_id) {
            self.terminate(call, reason, true).await;
        }
        Ok(())
    }

    fn toggle_track(&mut self, session_id: SessionId, kind: TrackKind) -> Result<bool, CallError> {
        let call = self
            .sessions
            .get_mut(&session_id)
            .ok_or(CallError::UnknownSession(session_id))?;
        let phase = call.session.phase;
        let command = match kind {
            TrackKind::Audio => "toggle mute",
            TrackKind::Video => "toggle video",
        };
        if !matches!(phase, Phase::Connecting | Phase::Connected) {
            return Err(CallError::InvalidState { phase, command });
        }
        let tracks = call
            .tracks
            .as_ref()
            .ok_or(CallError::InvalidState { phase, command })?;

        let flag = match kind {
            TrackKind::Audio => {
                let muted = !call.session.muted;
                self.media.set_track_enabled(tracks, TrackKind::Audio, !muted)?;
                call.session.muted = muted;
                muted
            }
            TrackKind::Video => {
                if tracks.video.is_none() {
                    return Err(CallError::NoVideoTrack);
                }
                let enabled = !call.session.video_enabled;
                self.media.set_track_enabled(tracks, TrackKind::Video, enabled)?;
                call.session.video_enabled = enabled;
                enabled
            }
        };

        let _ = self.events.send(CallEvent::MediaStateChanged {
            session_id,
            muted: call.session.muted,
            video_enabled: call.session.video_enabled,
        });
        Ok(flag)
    }

    // ------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------

    async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        if envelope.to != self.local_party {
            warn!(
                "Ignoring {:?} for {} addressed to {}",
                envelope.kind, envelope.session_id, envelope.to
            );
            return;
        }
        if envelope.from == self.local_party {
            warn!("Ignoring {:?} for {} sent by ourselves", envelope.kind, envelope.session_id);
            return;
        }
        match envelope.kind {
            EnvelopeKind::Offer => self.on_offer(envelope).await,
            EnvelopeKind::Answer => self.on_answer(envelope).await,
            EnvelopeKind::Candidate => self.on_candidate(envelope).await,
            EnvelopeKind::Hangup => self.on_hangup(envelope).await,
        }
    }

    async fn on_offer(&mut self, envelope: SignalingEnvelope) {
        let session_id = envelope.session_id;
        let payload: OfferPayload = match envelope.decode_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };
        if self.sessions.contains_key(&session_id) || self.was_recent(session_id) {
            debug!("Duplicate offer for {}", session_id);
            return;
        }
        if self.parked.get(&session_id).is_some_and(|p| p.hung_up) {
            debug!("Offer for {} arrived after its hangup, ignoring", session_id);
            self.unpark(session_id);
            return;
        }

        if let Some(existing_id) = self.active_with(&envelope.from) {
            let glare = self.sessions.get(&existing_id).is_some_and(|c| {
                c.session.direction == Direction::Outgoing && c.session.phase == Phase::Negotiating
            });
            if glare && self.local_party < envelope.from {
                warn!(
                    "Glare with {}: keeping outgoing {}, rejecting {}",
                    envelope.from, existing_id, session_id
                );
                self.reject_busy(&envelope);
                return;
            }
            if !glare {
                info!(
                    "Rejecting offer {} from {}: call {} already active",
                    session_id, envelope.from, existing_id
                );
                self.reject_busy(&envelope);
                return;
            }
            warn!(
                "Glare with {}: yielding outgoing {} to incoming {}",
                envelope.from, existing_id, session_id
            );
            if let Some(own) = self.sessions.remove(&existing_id) {
                self.terminate(own, EndReason::Busy, false).await;
            }
        }

        let mut call = self.new_call(Session::new(
            session_id,
            self.local_party.clone(),
            envelope.from.clone(),
            Direction::Incoming,
            payload.media,
        ));
        call.remote_aware = true;
        call.remote_offer = Some(payload.description);
        if let Some(parked) = self.unpark(session_id) {
            debug!("Adopting {} early candidates for {}", parked.candidates.len(), session_id);
            call.leg.park(parked.candidates);
        }

        self.advance(&mut call, Phase::Ringing, None);
        self.emit(CallEvent::IncomingCall {
            session_id,
            from: envelope.from.clone(),
            media: payload.media,
        });
        self.arm_timeout(&call, Phase::Ringing, self.config.ringing_timeout());
        self.sessions.insert(session_id, call);
        info!("Incoming {:?} call {} from {}", payload.media, session_id, envelope.from);
    }

    async fn on_answer(&mut self, envelope: SignalingEnvelope) {
        let session_id = envelope.session_id;
        let Some(mut call) = self.sessions.remove(&session_id) else {
            debug!("Answer for unknown session {}", session_id);
            return;
        };
        let expected = call.session.direction == Direction::Outgoing
            && call.session.phase == Phase::Negotiating
            && call.remote_aware
            && envelope.from == call.session.remote_party_id;
        if !expected {
            warn!(
                "Protocol violation: unexpected answer for {} while {}",
                session_id, call.session.phase
            );
            self.sessions.insert(session_id, call);
            return;
        }
        let payload: AnswerPayload = match envelope.decode_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!("{}", e);
                self.sessions.insert(session_id, call);
                return;
            }
        };

        match call.leg.apply_answer(payload.description).await {
            Ok(()) => {
                self.advance(&mut call, Phase::Connecting, None);
                self.sessions.insert(session_id, call);
            }
            Err(e) => self.fail(call, e.into()).await,
        }
    }

    async fn on_candidate(&mut self, envelope: SignalingEnvelope) {
        let session_id = envelope.session_id;
        let candidate: Candidate = match envelope.decode_payload() {
            Ok(c) => c,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };

        let recent = self.was_recent(session_id);
        match self.sessions.get_mut(&session_id) {
            Some(call) => {
                if envelope.from != call.session.remote_party_id {
                    warn!("Candidate for {} from unexpected party {}", session_id, envelope.from);
                    return;
                }
                if let Err(e) = call.leg.add_candidate(candidate).await {
                    warn!("Remote candidate rejected for {}: {}", session_id, e);
                }
            }
            None if recent => {
                debug!("Late candidate for finished session {}", session_id);
            }
            None => self.park_candidate(session_id, candidate),
        }
    }

    async fn on_hangup(&mut self, envelope: SignalingEnvelope) {
        let session_id = envelope.session_id;
        let reason = envelope
            .decode_payload::<HangupPayload>()
            .map(|p| p.reason)
            .unwrap_or(EndReason::Normal);

        match self.sessions.remove(&session_id) {
            Some(call) if call.session.remote_party_id == envelope.from => {
                info!("{} hung up {} ({})", envelope.from, session_id, reason);
                self.terminate(call, reason, false).await;
            }
            Some(call) => {
                warn!("Hangup for {} from unexpected party {}", session_id, envelope.from);
                self.sessions.insert(session_id, call);
            }
            None if self.was_recent(session_id) => {
                debug!("Hangup for finished session {}", session_id);
            }
            None => {
                debug!("Hangup for {} before its offer, remembering", session_id);
                self.park(session_id).hung_up = true;
            }
        }
    }

    /// The rejected session never enters the map, so its busy hangup goes
    /// out on a one-off task.
    fn reject_busy(&self, envelope: &SignalingEnvelope) {
        let hangup = SignalingEnvelope::hangup(
            envelope.session_id,
            &self.local_party,
            &envelope.from,
            EndReason::Busy,
        );
        let transport = self.transport.clone();
        let backoff = self.config.transport_retry_backoff();
        tokio::spawn(async move {
            if let Err(e) = send_with_retry(transport.as_ref(), &hangup, backoff).await {
                warn!("Failed to send busy for {}: {}", hangup.session_id, e);
            }
        });
    }

    // ------------------------------------------------------------------
    // Completions
    // ------------------------------------------------------------------

    async fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::MediaReady { session_id, result } => self.on_media_ready(session_id, result).await,
            Completion::Timeout { session_id, phase } => {
                let current = self.sessions.get(&session_id).map(|c| c.session.phase);
                if current != Some(phase) {
                    return;
                }
                if let Some(call) = self.sessions.remove(&session_id) {
                    info!("Session {} timed out while {}", session_id, phase);
                    self.terminate(call, EndReason::Timeout, true).await;
                }
            }
            Completion::DisconnectGrace { session_id, epoch } => {
                let lapsed = self
                    .sessions
                    .get(&session_id)
                    .is_some_and(|c| c.disconnected && c.disconnects == epoch);
                if !lapsed {
                    return;
                }
                if let Some(call) = self.sessions.remove(&session_id) {
                    self.fail(call, ConnectivityError::Lost.into()).await;
                }
            }
            Completion::SendFailed { session_id, kind, error } => match self.sessions.remove(&session_id) {
                Some(call) => self.fail(call, error.into()).await,
                None => debug!("{:?} for finished session {} not delivered: {}", kind, session_id, error),
            },
        }
    }

    async fn on_media_ready(&mut self, session_id: SessionId, result: Result<LocalTracks, MediaError>) {
        // Torn-down sessions are already out of the map.
        let Some(mut call) = self.sessions.remove(&session_id) else {
            if let Ok(tracks) = result {
                debug!("Discarding media acquired for finished session {}", session_id);
                self.media.release(tracks);
            }
            return;
        };
        call.acquiring = false;

        let tracks = match result {
            Ok(tracks) => tracks,
            Err(e) => {
                self.fail(call, e.into()).await;
                return;
            }
        };
        if call.session.muted {
            let _ = self.media.set_track_enabled(&tracks, TrackKind::Audio, false);
        }
        if !call.session.video_enabled && tracks.video.is_some() {
            let _ = self.media.set_track_enabled(&tracks, TrackKind::Video, false);
        }

        let outcome = match (call.session.direction, call.session.phase) {
            (Direction::Outgoing, Phase::Negotiating) => self.send_offer(&mut call, tracks).await,
            (Direction::Incoming, Phase::Ringing) => self.send_answer(&mut call, tracks).await,
            (_, phase) => {
                warn!("Media ready for {} in unexpected phase {}", session_id, phase);
                self.media.release(tracks);
                Ok(())
            }
        };
        match outcome {
            Ok(()) => {
                self.sessions.insert(session_id, call);
            }
            Err(e) => self.fail(call, e).await,
        }
    }

    async fn send_offer(&self, call: &mut CallSession, tracks: LocalTracks) -> Result<(), CallError> {
        let media = call.session.media;
        let description = call.leg.create_offer(media, &tracks).await;
        call.tracks = Some(tracks);
        let offer = SignalingEnvelope::offer(
            call.session.session_id,
            &self.local_party,
            &call.session.remote_party_id,
            description?,
            media,
        );
        call.outbox.push(offer);
        call.remote_aware = true;
        info!("Offer queued for {}", call.session.session_id);
        Ok(())
    }

    async fn send_answer(&self, call: &mut CallSession, tracks: LocalTracks) -> Result<(), CallError> {
        let Some(offer) = call.remote_offer.take() else {
            self.media.release(tracks);
            return Err(CallError::ProtocolViolation(format!(
                "no stored offer for {}",
                call.session.session_id
            )));
        };
        let description = call.leg.answer(offer, &tracks).await;
        call.tracks = Some(tracks);
        let answer = SignalingEnvelope::answer(
            call.session.session_id,
            &self.local_party,
            &call.session.remote_party_id,
            description?,
        );
        call.outbox.push(answer);
        self.advance(call, Phase::Connecting, None);
        info!("Answer queued for {}", call.session.session_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------

    async fn handle_connectivity(&mut self, session_id: SessionId, event: ConnectivityEvent) {
        let Some(mut call) = self.sessions.remove(&session_id) else {
            debug!("Connectivity event for finished session {}: {:?}", session_id, event);
            return;
        };

        match event {
            ConnectivityEvent::CandidateDiscovered(candidate) => {
                let envelope = SignalingEnvelope::candidate(
                    session_id,
                    &self.local_party,
                    &call.session.remote_party_id,
                    &candidate,
                );
                call.outbox.push(envelope);
            }
            ConnectivityEvent::StateChanged(ConnectivityState::Connected) => match call.session.phase {
                Phase::Connecting => {
                    call.disconnected = false;
                    self.advance(&mut call, Phase::Connected, None);
                    call.timer.start();
                    info!("Call {} connected", session_id);
                }
                Phase::Connected if call.disconnected => {
                    call.disconnected = false;
                    info!("Call {} recovered its connection", session_id);
                }
                Phase::Connected => debug!("Duplicate connected signal for {}", session_id),
                phase => warn!(
                    "Invariant violation: connectivity established for {} while {}",
                    session_id, phase
                ),
            },
            ConnectivityEvent::StateChanged(ConnectivityState::Checking) => {
                debug!("Connectivity checks running for {}", session_id);
            }
            ConnectivityEvent::StateChanged(ConnectivityState::Disconnected) => {
                if !call.disconnected {
                    call.disconnected = true;
                    call.disconnects += 1;
                    warn!("Call {} disconnected, waiting for recovery", session_id);
                    self.arm_disconnect_grace(&call);
                }
            }
            ConnectivityEvent::StateChanged(ConnectivityState::Failed) => {
                self.fail(call, ConnectivityError::Lost.into()).await;
                return;
            }
            ConnectivityEvent::RemoteTrack(kind) => {
                self.emit(CallEvent::RemoteTrackAvailable { session_id, kind });
            }
        }
        self.sessions.insert(session_id, call);
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Orderly end: Ending, release, Ended.
    async fn terminate(&mut self, mut call: CallSession, reason: EndReason, notify: bool) {
        let session_id = call.session.session_id;
        call.cancel.cancel();
        if notify && call.remote_aware {
            let hangup = SignalingEnvelope::hangup(
                session_id,
                &self.local_party,
                &call.session.remote_party_id,
                reason,
            );
            call.outbox.push(hangup);
        }

        self.advance(&mut call, Phase::Ending, Some(reason));
        let elapsed_seconds = call.timer.stop();
        self.release(&mut call).await;
        self.advance(&mut call, Phase::Ended, Some(reason));
        self.emit(CallEvent::SessionEnded {
            session_id,
            elapsed_seconds,
            reason,
        });
        info!(
            "Call {} ended ({}) after {}",
            session_id,
            reason,
            format_duration(elapsed_seconds)
        );
        self.remember(call.session);
    }

    /// Abnormal end. A session that reached Connected still passes through
    /// Ending; anything earlier goes straight to Failed.
    async fn fail(&mut self, mut call: CallSession, error: CallError) {
        let session_id = call.session.session_id;
        warn!("Call {} failed: {}", session_id, error);
        call.cancel.cancel();
        self.emit(CallEvent::CallError {
            session_id,
            kind: error.kind().to_string(),
            message: error.to_string(),
        });

        if call.remote_aware && !matches!(error, CallError::Transport(_)) {
            let hangup = SignalingEnvelope::hangup(
                session_id,
                &self.local_party,
                &call.session.remote_party_id,
                EndReason::Failed,
            );
            call.outbox.push(hangup);
        }

        let elapsed_seconds = call.timer.stop();
        if call.session.phase == Phase::Connected {
            self.advance(&mut call, Phase::Ending, Some(EndReason::Failed));
            self.release(&mut call).await;
            self.advance(&mut call, Phase::Ended, Some(EndReason::Failed));
        } else {
            self.release(&mut call).await;
            self.advance(&mut call, Phase::Failed, Some(EndReason::Failed));
        }
        self.emit(CallEvent::SessionEnded {
            session_id,
            elapsed_seconds,
            reason: EndReason::Failed,
        });
        self.remember(call.session);
    }

    async fn release(&self, call: &mut CallSession) {
        if let Some(tracks) = call.tracks.take() {
            self.media.release(tracks);
        }
        call.leg.close().await;
    }

    fn remember(&mut self, session: Session) {
        self.recent.push_front(session);
        self.recent.truncate(self.config.ended_history);
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn new_call(&self, session: Session) -> CallSession {
        let events = EngineEvents::new(session.session_id, self.engine_tx.clone());
        let outbox = Outbox::spawn(
            session.session_id,
            self.transport.clone(),
            self.config.transport_retry_backoff(),
            self.completion_tx.clone(),
        );
        CallSession {
            leg: NegotiationLeg::new(self.connectivity.clone(), events),
            session,
            tracks: None,
            remote_offer: None,
            timer: CallTimer::new(),
            cancel: CancellationToken::new(),
            acquiring: false,
            remote_aware: false,
            disconnected: false,
            disconnects: 0,
            outbox,
        }
    }

    fn advance(&self, call: &mut CallSession, next: Phase, reason: Option<EndReason>) {
        let session_id = call.session.session_id;
        let from = call.session.phase;
        if let Err(e) = call.session.transition(next) {
            warn!("Invariant violation on {}: {}", session_id, e);
            return;
        }
        if next.is_terminal() {
            call.session.end_reason = reason;
        }
        debug!("Session {}: {} -> {}", session_id, from, next);
        self.emit(CallEvent::SessionStateChanged {
            session_id,
            phase: next,
            reason,
        });
    }

    fn spawn_acquisition(&self, call: &mut CallSession) {
        spawn_acquisition(&self.media, &self.completion_tx, call);
    }

    fn arm_timeout(&self, call: &CallSession, phase: Phase, after: Duration) {
        let session_id = call.session.session_id;
        let cancel = call.cancel.clone();
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let _ = tx.send(Completion::Timeout { session_id, phase });
                }
            }
        });
    }

    fn arm_disconnect_grace(&self, call: &CallSession) {
        let session_id = call.session.session_id;
        let epoch = call.disconnects;
        let cancel = call.cancel.clone();
        let tx = self.completion_tx.clone();
        let after = self.config.disconnect_grace();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let _ = tx.send(Completion::DisconnectGrace { session_id, epoch });
                }
            }
        });
    }

    fn active_with(&self, remote: &str) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|c| c.session.remote_party_id == remote)
            .map(|c| c.session.session_id)
    }

    fn was_recent(&self, session_id: SessionId) -> bool {
        self.recent.iter().any(|s| s.session_id == session_id)
    }

    fn park(&mut self, session_id: SessionId) -> &mut Parked {
        if !self.parked.contains_key(&session_id) {
            self.parked_order.push_back(session_id);
            while self.parked_order.len() > self.config.max_parked_sessions {
                if let Some(evicted) = self.parked_order.pop_front() {
                    debug!("Evicting parked signaling for {}", evicted);
                    self.parked.remove(&evicted);
                }
            }
        }
        self.parked.entry(session_id).or_default()
    }

    fn park_candidate(&mut self, session_id: SessionId, candidate: Candidate) {
        let limit = self.config.max_parked_candidates;
        let parked = self.park(session_id);
        if parked.candidates.len() >= limit {
            warn!("Too many early candidates for {}, dropping", session_id);
            return;
        }
        parked.candidates.push(candidate);
        debug!("Parked early candidate for {} ({})", session_id, parked.candidates.len());
    }

    fn unpark(&mut self, session_id: SessionId) -> Option<Parked> {
        self.parked_order.retain(|id| *id != session_id);
        self.parked.remove(&session_id)
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn publish_view(&self) {
        let mut active: Vec<Session> = self.sessions.values().map(|c| c.session.clone()).collect();
        active.sort_by_key(|s| s.session_id);
        self.view_tx.send_replace(SessionsView {
            active,
            recent: self.recent.iter().cloned().collect(),
        });
    }
}

fn spawn_acquisition(
    media: &MediaCapture,
    completion_tx: &mpsc::UnboundedSender<Completion>,
    call: &mut CallSession,
) {
    call.acquiring = true;
    let media = media.clone();
    let cancel = call.cancel.clone();
    let tx = completion_tx.clone();
    let session_id = call.session.session_id;
    let kind = call.session.media;
    tokio::spawn(async move {
        let result = media.acquire_cancellable(kind, &cancel).await;
        // If the controller is gone the tracks drop here, releasing devices.
        let _ = tx.send(Completion::MediaReady { session_id, result });
    });
}

/// Send, retrying once after `backoff`.
async fn send_with_retry(
    transport: &dyn SignalingTransport,
    envelope: &SignalingEnvelope,
    backoff: Duration,
) -> Result<(), TransportError> {
    match transport.send(envelope).await {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!(
                "Signaling send of {:?} for {} failed ({}), retrying once",
                envelope.kind, envelope.session_id, first
            );
            tokio::time::sleep(backoff).await;
            transport.send(envelope).await
        }
    }
}

/// Stops at the first envelope that cannot be delivered; the session is
/// failed and nothing queued behind it is worth sending.
async fn drain_outbox(
    session_id: SessionId,
    transport: Arc<dyn SignalingTransport>,
    backoff: Duration,
    mut rx: mpsc::UnboundedReceiver<SignalingEnvelope>,
    completion_tx: mpsc::UnboundedSender<Completion>,
) {
    while let Some(envelope) = rx.recv().await {
        if let Err(error) = send_with_retry(transport.as_ref(), &envelope, backoff).await {
            let _ = completion_tx.send(Completion::SendFailed {
                session_id,
                kind: envelope.kind,
                error,
            });
            return;
        }
    }
}

/// Forward envelopes into the controller, resubscribing whenever the
/// transport's stream ends.
async fn pump_signaling(
    transport: Arc<dyn SignalingTransport>,
    party: PartyId,
    mut stream: EnvelopeStream,
    tx: mpsc::UnboundedSender<SignalingEnvelope>,
) {
    loop {
        while let Some(envelope) = stream.recv().await {
            if tx.send(envelope).is_err() {
                return;
            }
        }
        warn!("Signaling subscription for {} ended, resubscribing", party);
        loop {
            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
            match transport.subscribe(&party).await {
                Ok(next) => {
                    stream = next;
                    break;
                }
                Err(e) => warn!("Resubscribe for {} failed: {}", party, e),
            }
        }
    }
}
