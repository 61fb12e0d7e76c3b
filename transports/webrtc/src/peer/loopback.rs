//! In-process transport
//!
//! Models the parts of a peer connection the mesh depends on: the signaling
//! state machine, rollback, ICE credentials that change on restart, one
//! trickled host candidate per credential generation, and remote track
//! announcement once connectivity is established. No media flows.
//!
//! A connection counts as connected when it is stable, has a committed
//! remote description, and has applied a remote candidate carrying the
//! remote description's username fragment.
//!
//! A network can be built without rollback support to behave like the
//! native transport, which cannot discard a pending local offer.

use super::quality::TransportStats;
use super::transport::{
    IceState, PeerEventKind, PeerEventSink, PeerTransport, RemoteTrack, SignalingState,
    TransportFactory, TransportState,
};
use crate::media::LocalAudioStream;
use crate::participant::ParticipantId;
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const UFRAG_PREFIX: &str = "a=ice-ufrag:";

/// The parts of a description the loopback cares about
#[derive(Debug, Clone, PartialEq, Eq)]
struct LoopbackSdp {
    ufrag: String,
    sends_audio: bool,
}

impl LoopbackSdp {
    fn render(&self, owner: &ParticipantId, generation: u32) -> String {
        format!(
            "v=0\r\no={} {} 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n{}{}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na={}\r\n",
            owner,
            generation,
            UFRAG_PREFIX,
            self.ufrag,
            if self.sends_audio { "sendrecv" } else { "recvonly" }
        )
    }

    fn parse(sdp: &str) -> Result<Self> {
        let ufrag = sdp
            .lines()
            .find_map(|line| line.trim().strip_prefix(UFRAG_PREFIX))
            .filter(|ufrag| !ufrag.is_empty())
            .ok_or_else(|| Error::SdpError("description has no ICE username fragment".to_string()))?;

        Ok(Self {
            ufrag: ufrag.to_string(),
            sends_audio: sdp.lines().any(|line| line.trim() == "a=sendrecv"),
        })
    }
}

struct LoopbackState {
    signaling: SignalingState,
    generation: u32,
    has_audio: bool,
    pending_remote: Option<LoopbackSdp>,
    current_remote: Option<LoopbackSdp>,
    restart_pending: bool,
    announced_generation: Option<u32>,
    applied: Vec<IceCandidate>,
    ice_connected: bool,
    remote_track_announced: bool,
    negotiation_needed: bool,
    offers_created: u32,
    rollbacks: u32,
    stats: TransportStats,
}

/// In-process [`PeerTransport`]
pub struct LoopbackTransport {
    local: ParticipantId,
    remote: ParticipantId,
    sink: PeerEventSink,
    rollback_supported: bool,
    state: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    fn new(
        local: ParticipantId,
        remote: ParticipantId,
        sink: PeerEventSink,
        rollback_supported: bool,
    ) -> Self {
        Self {
            local,
            remote,
            sink,
            rollback_supported,
            state: Mutex::new(LoopbackState {
                signaling: SignalingState::Stable,
                generation: 0,
                has_audio: false,
                pending_remote: None,
                current_remote: None,
                restart_pending: false,
                announced_generation: None,
                applied: Vec::new(),
                ice_connected: false,
                remote_track_announced: false,
                negotiation_needed: false,
                offers_created: 0,
                rollbacks: 0,
                stats: TransportStats::default(),
            }),
        }
    }

    fn ufrag(&self, generation: u32) -> String {
        format!("{}-{}", self.local, generation)
    }

    fn local_sdp(&self, state: &LoopbackState) -> String {
        LoopbackSdp {
            ufrag: self.ufrag(state.generation),
            sends_audio: state.has_audio,
        }
        .render(&self.local, state.generation)
    }

    fn ensure_open(&self, state: &LoopbackState) -> Result<()> {
        if state.signaling == SignalingState::Closed {
            return Err(Error::PeerConnectionError(format!(
                "connection to {} is closed",
                self.remote
            )));
        }
        Ok(())
    }

    fn commit_remote(state: &mut LoopbackState, remote: LoopbackSdp) {
        let restarted = state
            .current_remote
            .as_ref()
            .is_some_and(|current| current.ufrag != remote.ufrag);
        if restarted {
            state.ice_connected = false;
        }
        state.current_remote = Some(remote);
    }

    fn local_candidate(&self, state: &mut LoopbackState) -> Option<PeerEventKind> {
        if state.announced_generation == Some(state.generation) {
            return None;
        }
        state.announced_generation = Some(state.generation);

        let port = 40000 + state.generation;
        Some(PeerEventKind::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                state.generation + 1,
                port
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some(self.ufrag(state.generation)),
        }))
    }

    fn check_connectivity(&self, state: &mut LoopbackState) -> Vec<PeerEventKind> {
        let mut events = Vec::new();
        if state.signaling != SignalingState::Stable {
            return events;
        }
        let Some(remote) = state.current_remote.clone() else {
            return events;
        };

        if !state.ice_connected {
            let reachable = state
                .applied
                .iter()
                .any(|c| c.username_fragment.as_deref() == Some(remote.ufrag.as_str()));
            if !reachable {
                return events;
            }
            state.ice_connected = true;
            debug!("Loopback {} -> {} connected", self.local, self.remote);
            events.push(PeerEventKind::IceConnectionState(IceState::Connected));
            events.push(PeerEventKind::ConnectionState(TransportState::Connected));
        }

        if remote.sends_audio && !state.remote_track_announced {
            state.remote_track_announced = true;
            events.push(PeerEventKind::RemoteTrack(RemoteTrack {
                id: format!("audio-{}", self.remote),
                stream_id: format!("stream-{}", self.remote),
                kind: "audio".to_string(),
                source: None,
            }));
        }
        events
    }

    /// Re-raise negotiation-needed when returning to stable with unsent media
    fn renegotiation_due(state: &LoopbackState) -> Option<PeerEventKind> {
        (state.signaling == SignalingState::Stable && state.negotiation_needed)
            .then_some(PeerEventKind::NegotiationNeeded)
    }

    fn emit_all(&self, events: Vec<PeerEventKind>) {
        for event in events {
            self.sink.emit(event);
        }
    }

    /// Candidates applied so far, in application order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    /// Number of offers created
    pub fn offers_created(&self) -> u32 {
        self.state.lock().offers_created
    }

    /// Number of rollbacks performed
    pub fn rollbacks(&self) -> u32 {
        self.state.lock().rollbacks
    }

    /// Current ICE credential generation
    pub fn ice_generation(&self) -> u32 {
        self.state.lock().generation
    }

    /// Whether ICE connectivity is established
    pub fn is_connected(&self) -> bool {
        self.state.lock().ice_connected
    }

    /// Whether [`PeerTransport::close`] was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().signaling == SignalingState::Closed
    }

    /// Metrics returned by [`PeerTransport::stats`]
    pub fn set_stats(&self, stats: TransportStats) {
        self.state.lock().stats = stats;
    }

    /// Drop connectivity and report failure
    pub fn fail(&self) {
        {
            let mut state = self.state.lock();
            if state.signaling == SignalingState::Closed {
                return;
            }
            state.ice_connected = false;
        }
        info!("Loopback {} -> {} failed", self.local, self.remote);
        self.sink
            .emit(PeerEventKind::IceConnectionState(IceState::Failed));
        self.sink
            .emit(PeerEventKind::ConnectionState(TransportState::Failed));
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        if matches!(
            state.signaling,
            SignalingState::HaveRemoteOffer | SignalingState::HaveRemotePranswer
        ) {
            return Err(Error::InvalidSignalingState(format!(
                "cannot offer in {:?}",
                state.signaling
            )));
        }

        if ice_restart {
            state.generation += 1;
        }
        state.offers_created += 1;
        Ok(SessionDescription::offer(self.local_sdp(&state)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(Error::InvalidSignalingState(format!(
                "cannot answer in {:?}",
                state.signaling
            )));
        }

        if state.restart_pending {
            state.restart_pending = false;
            state.generation += 1;
        }
        Ok(SessionDescription::answer(self.local_sdp(&state)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let events = {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;

            match (desc.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::HaveLocalOffer;
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => {
                    let remote = state.pending_remote.take().ok_or_else(|| {
                        Error::InternalError("remote offer missing".to_string())
                    })?;
                    Self::commit_remote(&mut state, remote);
                    state.signaling = SignalingState::Stable;
                }
                (kind, signaling) => {
                    return Err(Error::InvalidSignalingState(format!(
                        "cannot set local {:?} in {:?}",
                        kind, signaling
                    )))
                }
            }

            if desc.sdp.contains("a=sendrecv") {
                state.negotiation_needed = false;
            }

            let mut events: Vec<_> = self.local_candidate(&mut state).into_iter().collect();
            events.extend(self.check_connectivity(&mut state));
            events.extend(Self::renegotiation_due(&state));
            events
        };

        self.emit_all(events);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let parsed = LoopbackSdp::parse(&desc.sdp)?;
        let events = {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;

            match (desc.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => {
                    state.restart_pending = state
                        .current_remote
                        .as_ref()
                        .is_some_and(|current| current.ufrag != parsed.ufrag);
                    state.pending_remote = Some(parsed);
                    state.signaling = SignalingState::HaveRemoteOffer;
                    Vec::new()
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                    Self::commit_remote(&mut state, parsed);
                    state.signaling = SignalingState::Stable;
                    let mut events = self.check_connectivity(&mut state);
                    events.extend(Self::renegotiation_due(&state));
                    events
                }
                (kind, signaling) => {
                    return Err(Error::InvalidSignalingState(format!(
                        "cannot set remote {:?} in {:?}",
                        kind, signaling
                    )))
                }
            }
        };

        self.emit_all(events);
        Ok(())
    }

    fn supports_rollback(&self) -> bool {
        self.rollback_supported
    }

    async fn rollback(&self) -> Result<()> {
        if !self.rollback_supported {
            return Err(Error::InvalidSignalingState(
                "rollback is not supported".to_string(),
            ));
        }
        let event = {
            let mut state = self.state.lock();
            match state.signaling {
                SignalingState::HaveLocalOffer => {}
                SignalingState::HaveRemoteOffer => {
                    state.pending_remote = None;
                    state.restart_pending = false;
                }
                other => {
                    return Err(Error::InvalidSignalingState(format!(
                        "nothing to roll back in {:?}",
                        other
                    )))
                }
            }
            state.signaling = SignalingState::Stable;
            state.rollbacks += 1;
            Self::renegotiation_due(&state)
        };

        debug!("Loopback {} -> {} rolled back", self.local, self.remote);
        self.emit_all(event.into_iter().collect());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let events = {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;
            if state.pending_remote.is_none() && state.current_remote.is_none() {
                return Err(Error::InvalidSignalingState(
                    "candidate applied before any remote description".to_string(),
                ));
            }
            state.applied.push(candidate);
            self.check_connectivity(&mut state)
        };

        self.emit_all(events);
        Ok(())
    }

    fn has_audio_sender(&self) -> bool {
        self.state.lock().has_audio
    }

    async fn add_local_audio(&self, stream: &LocalAudioStream) -> Result<()> {
        {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;
            state.has_audio = true;
            state.negotiation_needed = true;
        }
        debug!(
            "Loopback {} -> {} attached stream {}",
            self.local,
            self.remote,
            stream.id()
        );
        self.sink.emit(PeerEventKind::NegotiationNeeded);
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        let state = self.state.lock();
        self.ensure_open(&state)?;
        Ok(state.stats)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.signaling = SignalingState::Closed;
        state.ice_connected = false;
        Ok(())
    }
}

#[derive(Default)]
struct NetworkInner {
    transports: Mutex<HashMap<(ParticipantId, ParticipantId), Vec<Arc<LoopbackTransport>>>>,
    create_delay: Mutex<Duration>,
    failing_creates: AtomicU32,
    no_rollback: AtomicBool,
}

/// Shared factory for [`LoopbackTransport`]s
///
/// One network serves every participant of a call, so tests can reach the
/// transport any participant uses toward any other.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every transport creation by `delay`
    pub fn with_create_delay(self, delay: Duration) -> Self {
        *self.inner.create_delay.lock() = delay;
        self
    }

    /// Create transports that refuse to roll back
    pub fn without_rollback(self) -> Self {
        self.inner.no_rollback.store(true, Ordering::SeqCst);
        self
    }

    /// Make the next `count` creations fail
    pub fn fail_next_creates(&self, count: u32) {
        self.inner.failing_creates.store(count, Ordering::SeqCst);
    }

    /// Latest transport `local` created toward `remote`
    pub fn transport(
        &self,
        local: &ParticipantId,
        remote: &ParticipantId,
    ) -> Option<Arc<LoopbackTransport>> {
        self.inner
            .transports
            .lock()
            .get(&(local.clone(), remote.clone()))
            .and_then(|all| all.last().cloned())
    }

    /// How many transports `local` created toward `remote`
    pub fn created(&self, local: &ParticipantId, remote: &ParticipantId) -> usize {
        self.inner
            .transports
            .lock()
            .get(&(local.clone(), remote.clone()))
            .map_or(0, Vec::len)
    }

    /// Simulate a connectivity failure on `local`'s side of the pair
    pub fn fail(&self, local: &ParticipantId, remote: &ParticipantId) -> bool {
        match self.transport(local, remote) {
            Some(transport) => {
                transport.fail();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create(
        &self,
        local: &ParticipantId,
        remote: &ParticipantId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerTransport>> {
        let delay = *self.inner.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .inner
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::PeerConnectionError(format!(
                "injected failure creating {} -> {}",
                local, remote
            )));
        }

        let transport = Arc::new(LoopbackTransport::new(
            local.clone(),
            remote.clone(),
            events,
            !self.inner.no_rollback.load(Ordering::SeqCst),
        ));
        self.inner
            .transports
            .lock()
            .entry((local.clone(), remote.clone()))
            .or_default()
            .push(Arc::clone(&transport));
        Ok(transport)
    }
}
