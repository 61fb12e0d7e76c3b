//! Mesh orchestrator
//!
//! Owns the peer registry of one participant in one call and drives every
//! remote peer through discovery, offer/answer, candidate trickling,
//! renegotiation and ICE restart.
//!
//! Three inputs feed it:
//!
//! - roster snapshots ([`MeshOrchestrator::sync_roster`])
//! - batches of signaling messages ([`MeshOrchestrator::process_signals`])
//! - native transport events ([`MeshOrchestrator::handle_peer_event`])
//!
//! An offer left unanswered for `offer_timeout` is handled like a failed
//! connection and repaired by ICE restart.
//!
//! Registry state sits behind a synchronous lock that is never held across
//! an await. Description changes for one peer are serialised by that peer's
//! negotiation lock, and every step re-checks that the record it started
//! with is still current after each suspension point.

use super::negotiation::{self, OfferAction};
use super::status::{CallStatus, StatusTracker, CONNECTION_PROBLEM};
use crate::config::CallConfig;
use crate::media::LocalMediaController;
use crate::participant::{Participant, ParticipantId};
use crate::peer::{
    ConnectionId, PeerEvent, PeerEventKind, PeerEventSink, PeerPhase, PeerRegistry, PeerSlot,
    PeerSnapshot, PeerTransport, QualitySample, SignalingState, TransportFactory,
};
use crate::signaling::{
    IceCandidate, SessionDescription, SignalBody, SignalMessage, SignalingChannel,
};
use crate::{Error, Result};
use futures::future::join_all;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, trace, warn};

/// Outcome of one roster synchronisation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterChange {
    /// Participants a record was created for
    pub joined: Vec<ParticipantId>,
    /// Participants whose record was destroyed
    pub departed: Vec<ParticipantId>,
}

impl RosterChange {
    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.departed.is_empty()
    }
}

/// A record's handles plus its initialised transport
#[derive(Clone)]
struct PeerHandle {
    slot: PeerSlot,
    transport: Arc<dyn PeerTransport>,
}

impl PeerHandle {
    fn remote(&self) -> &ParticipantId {
        &self.slot.remote
    }
}

/// Single-holder flag serialising signal batches
struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Full-mesh coordinator for one participant in one call
pub struct MeshOrchestrator {
    me: Weak<Self>,
    local_id: ParticipantId,
    config: CallConfig,
    channel: SignalingChannel,
    factory: Arc<dyn TransportFactory>,
    media: Arc<LocalMediaController>,
    registry: Mutex<PeerRegistry>,
    /// Other participants as of the last roster sync
    roster: Mutex<Vec<Participant>>,
    departed: Mutex<HashSet<ParticipantId>>,
    deferred: Mutex<VecDeque<SignalMessage>>,
    processing: AtomicBool,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<PeerEvent>,
    status: StatusTracker,
}

impl MeshOrchestrator {
    /// Create an orchestrator for the participant `channel` sends as
    ///
    /// Returns the receiver of transport events; feed it to
    /// [`MeshOrchestrator::run_events`] or [`MeshOrchestrator::handle_peer_event`].
    pub fn new(
        config: CallConfig,
        channel: SignalingChannel,
        factory: Arc<dyn TransportFactory>,
        media: Arc<LocalMediaController>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            local_id: channel.local_id().clone(),
            config,
            channel,
            factory,
            media,
            registry: Mutex::new(PeerRegistry::new()),
            roster: Mutex::new(Vec::new()),
            departed: Mutex::new(HashSet::new()),
            deferred: Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
            status: StatusTracker::new(),
        });
        (orchestrator, rx)
    }

    /// Local participant
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Local media controller shared with the session
    pub fn media(&self) -> &Arc<LocalMediaController> {
        &self.media
    }

    /// Whether [`MeshOrchestrator::close`] has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Snapshot of every peer record
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.registry.lock().snapshot()
    }

    /// Transport currently used toward `remote`
    pub fn transport(&self, remote: &ParticipantId) -> Option<Arc<dyn PeerTransport>> {
        self.existing_handle(remote).map(|h| h.transport)
    }

    /// Receiver observing the aggregate call status
    pub fn status(&self) -> watch::Receiver<CallStatus> {
        self.status.subscribe()
    }

    /// Current aggregate call status
    pub fn current_status(&self) -> CallStatus {
        self.status.current()
    }

    /// Time spent with at least one connected peer
    pub fn call_duration(&self) -> Duration {
        self.status.duration()
    }

    // ---- roster ---------------------------------------------------------

    /// Reconcile the registry with a roster snapshot
    ///
    /// Records of participants missing from the snapshot are destroyed.
    /// Participants without a record get one, and the local side offers to
    /// those it initiates toward. Newcomers are connected concurrently.
    #[instrument(skip(self, participants), fields(local = %self.local_id))]
    pub async fn sync_roster(&self, participants: &[Participant]) -> RosterChange {
        let mut change = RosterChange::default();
        if self.is_closed() {
            return change;
        }

        let others: Vec<Participant> = participants
            .iter()
            .filter(|p| p.id != self.local_id && p.is_active())
            .cloned()
            .collect();

        let gone: Vec<ParticipantId> = {
            let mut roster = self.roster.lock();
            let gone = roster
                .iter()
                .filter(|old| !others.iter().any(|p| p.id == old.id))
                .map(|old| old.id.clone())
                .collect();
            *roster = others.clone();
            gone
        };

        for remote in gone {
            info!("Participant {} left the call", remote);
            self.remove_peer(&remote).await;
            change.departed.push(remote);
        }

        let Some(me) = participants.iter().find(|p| p.id == self.local_id) else {
            debug!("Local participant not in roster yet, not initiating");
            return change;
        };

        let newcomers: Vec<&Participant> = {
            let registry = self.registry.lock();
            let departed = self.departed.lock();
            others
                .iter()
                .filter(|p| registry.get(&p.id).is_none() && !departed.contains(&p.id))
                .collect()
        };

        let results = join_all(
            newcomers
                .iter()
                .map(|p| self.connect_peer(&p.id, me.initiates_toward(p))),
        )
        .await;

        for (remote, result) in newcomers.iter().map(|p| &p.id).zip(results) {
            match result {
                Ok(true) => change.joined.push(remote.clone()),
                Ok(false) => {}
                Err(e) => warn!("Failed to connect to {}: {}", remote, e),
            }
        }

        if !change.is_empty() {
            debug!(
                "Roster sync: {} joined, {} departed, {} peer(s)",
                change.joined.len(),
                change.departed.len(),
                self.registry.lock().len()
            );
        }
        change
    }

    /// Create the record for `remote` and offer if the local side initiates
    ///
    /// Returns whether this call created the record.
    async fn connect_peer(&self, remote: &ParticipantId, initiator: bool) -> Result<bool> {
        let (handle, created) = self.ensure_peer(remote, initiator).await?;
        if created && initiator {
            info!("Initiating connection to {}", remote);
            self.offer(&handle, false).await?;
        }
        Ok(created)
    }

    /// Offer to `remote` regardless of who initiates
    ///
    /// Creates the record if needed. Colliding offers are settled by the
    /// polite/impolite rule when they arrive.
    pub async fn send_offer(&self, remote: &ParticipantId) -> Result<()> {
        let (handle, _) = self.ensure_peer(remote, true).await?;
        self.offer(&handle, false).await
    }

    async fn remove_peer(&self, remote: &ParticipantId) {
        self.departed.lock().insert(remote.clone());
        let transport = self.registry.lock().remove(remote);
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                warn!("Error closing connection to {}: {}", remote, e);
            }
        }
        self.refresh_connected();
    }

    // ---- records --------------------------------------------------------

    /// Get or create the record for `remote`, initialising its transport
    ///
    /// Concurrent callers share one record and one transport. Returns
    /// whether this caller inserted the record.
    async fn ensure_peer(
        &self,
        remote: &ParticipantId,
        initiator: bool,
    ) -> Result<(PeerHandle, bool)> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        if self.departed.lock().contains(remote) {
            return Err(Error::PeerNotFound(remote.to_string()));
        }

        let (slot, created) = self.registry.lock().create(remote, initiator);
        let transport = self.init_transport(&slot).await?;

        let handle = PeerHandle { slot, transport };
        if let Err(e) = self.ensure_current(&handle) {
            // record dropped while the transport was being created
            let _ = handle.transport.close().await;
            return Err(e);
        }

        if created {
            if let Err(e) = self.attach_media_to(&handle).await {
                warn!("Failed to attach local audio for {}: {}", remote, e);
            }
        }
        Ok((handle, created))
    }

    /// Create the slot's transport once; a failure drops the record
    async fn init_transport(&self, slot: &PeerSlot) -> Result<Arc<dyn PeerTransport>> {
        let remote = &slot.remote;
        let init = slot.transport.get_or_try_init(|| {
            let sink = PeerEventSink::new(remote.clone(), slot.connection, self.events.clone());
            self.factory.create(&self.local_id, remote, sink)
        });
        match init.await {
            Ok(transport) => Ok(Arc::clone(transport)),
            Err(e) => {
                warn!("Failed to create connection to {}: {}", remote, e);
                self.registry
                    .lock()
                    .remove_if_current(remote, slot.connection);
                Err(e)
            }
        }
    }

    /// Swap the record's connection for a new one, closing the old transport
    ///
    /// Used to drop a pending local offer on transports that cannot roll back.
    async fn replace_peer(&self, handle: &PeerHandle) -> Result<PeerHandle> {
        let remote = handle.remote();
        let (slot, _) = self
            .registry
            .lock()
            .replace(remote, handle.slot.connection)
            .ok_or_else(|| Error::PeerNotFound(remote.to_string()))?;

        if let Err(e) = handle.transport.close().await {
            warn!("Error closing replaced connection to {}: {}", remote, e);
        }

        let transport = self.init_transport(&slot).await?;
        let fresh = PeerHandle { slot, transport };
        if let Err(e) = self.ensure_current(&fresh) {
            let _ = fresh.transport.close().await;
            return Err(e);
        }
        if let Err(e) = self.attach_media_to(&fresh).await {
            warn!("Failed to attach local audio for {}: {}", remote, e);
        }
        self.refresh_connected();
        Ok(fresh)
    }

    fn existing_handle(&self, remote: &ParticipantId) -> Option<PeerHandle> {
        let slot = self.registry.lock().get(remote)?;
        let transport = slot.transport.get().cloned()?;
        Some(PeerHandle { slot, transport })
    }

    /// Fail if the call closed or `handle` no longer names the live record
    fn ensure_current(&self, handle: &PeerHandle) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        if !self
            .registry
            .lock()
            .is_current(handle.remote(), handle.slot.connection)
        {
            return Err(Error::PeerNotFound(handle.remote().to_string()));
        }
        Ok(())
    }

    fn refresh_connected(&self) {
        let connected = self.registry.lock().connected_count();
        self.status.connected_peers(connected);
    }

    fn mark_connecting(&self, remote: &ParticipantId) {
        let mut registry = self.registry.lock();
        if registry.phase(remote) == Some(PeerPhase::NoConnection) {
            registry.set_phase(remote, PeerPhase::Connecting);
        }
    }

    // ---- local media ----------------------------------------------------

    /// Attach the local stream to every peer that lacks it
    ///
    /// Peers that already exchanged descriptions renegotiate through their
    /// negotiation-needed event.
    pub async fn attach_local_media(&self) {
        let ids = self.registry.lock().ids();
        for remote in ids {
            let Some(handle) = self.existing_handle(&remote) else {
                continue;
            };
            if let Err(e) = self.attach_media_to(&handle).await {
                warn!("Failed to attach local audio for {}: {}", remote, e);
            }
        }
    }

    async fn attach_media_to(&self, handle: &PeerHandle) -> Result<()> {
        let Some(stream) = self.media.stream() else {
            return Ok(());
        };

        let _negotiation = handle.slot.negotiation.lock().await;
        self.ensure_current(handle)?;
        if handle.transport.has_audio_sender() {
            return Ok(());
        }
        debug!("Attaching stream {} for {}", stream.id(), handle.remote());
        handle.transport.add_local_audio(&stream).await
    }

    // ---- offer / answer -------------------------------------------------

    async fn offer(&self, handle: &PeerHandle, ice_restart: bool) -> Result<()> {
        let _negotiation = handle.slot.negotiation.lock().await;
        self.offer_locked(handle, ice_restart).await
    }

    /// Create, apply and send an offer. Caller holds the negotiation lock.
    async fn offer_locked(&self, handle: &PeerHandle, ice_restart: bool) -> Result<()> {
        self.ensure_current(handle)?;
        let remote = handle.remote();
        let state = handle.transport.signaling_state();
        let allowed = if ice_restart {
            negotiation::may_restart(state)
        } else {
            negotiation::may_offer(state)
        };
        if !allowed {
            debug!("Not offering to {} in {:?}", remote, state);
            return Ok(());
        }

        let offer = handle.transport.create_offer(ice_restart).await?;
        self.ensure_current(handle)?;
        handle.transport.set_local_description(offer.clone()).await?;
        self.ensure_current(handle)?;

        self.mark_connecting(remote);
        let serial = self.registry.lock().note_offer(remote);
        if self.channel.send_description(remote, &offer).await {
            self.status.negotiating();
        }
        self.arm_offer_timeout(remote.clone(), handle.slot.connection, serial);
        Ok(())
    }

    fn arm_offer_timeout(&self, remote: ParticipantId, connection: ConnectionId, serial: u64) {
        let me = self.me.clone();
        let timeout = self.config.offer_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(this) = me.upgrade() {
                this.on_offer_timeout(&remote, connection, serial);
            }
        });
    }

    /// Treat offer `serial` as lost if it is still the outstanding one
    fn on_offer_timeout(
        self: &Arc<Self>,
        remote: &ParticipantId,
        connection: ConnectionId,
        serial: u64,
    ) {
        if self.is_closed() {
            return;
        }
        let outstanding = {
            let registry = self.registry.lock();
            registry.is_current(remote, connection) && registry.last_offer(remote) == Some(serial)
        };
        let awaiting_answer = outstanding
            && self
                .existing_handle(remote)
                .is_some_and(|h| h.transport.signaling_state() == SignalingState::HaveLocalOffer);
        if awaiting_answer {
            self.on_transport_failure(remote, connection, "offer unanswered");
        }
    }

    async fn apply_offer(&self, from: &ParticipantId, desc: SessionDescription) -> Result<()> {
        let (mut handle, _) = self.ensure_peer(from, false).await?;
        let mut _negotiation = Arc::clone(&handle.slot.negotiation).lock_owned().await;
        self.ensure_current(&handle)?;

        let state = handle.transport.signaling_state();
        match negotiation::on_remote_offer(&self.local_id, from, state) {
            OfferAction::Accept => {}
            OfferAction::RollbackThenAccept if handle.transport.supports_rollback() => {
                info!("Offer collision with {}: rolling back local offer", from);
                handle.transport.rollback().await?;
                self.ensure_current(&handle)?;
            }
            OfferAction::RollbackThenAccept => {
                info!(
                    "Offer collision with {}: replacing connection to drop local offer",
                    from
                );
                handle = self.replace_peer(&handle).await?;
                _negotiation = Arc::clone(&handle.slot.negotiation).lock_owned().await;
                self.ensure_current(&handle)?;
            }
            OfferAction::Ignore => {
                info!(
                    "Offer collision with {}: keeping local offer ({:?})",
                    from, state
                );
                return Ok(());
            }
        }

        handle.transport.set_remote_description(desc).await?;
        self.ensure_current(&handle)?;
        self.flush_candidates(&handle).await;

        let answer = handle.transport.create_answer().await?;
        self.ensure_current(&handle)?;
        handle.transport.set_local_description(answer.clone()).await?;
        self.ensure_current(&handle)?;

        self.mark_connecting(from);
        if self.channel.send_description(from, &answer).await {
            self.status.negotiating();
        }
        Ok(())
    }

    async fn apply_answer(&self, from: &ParticipantId, desc: SessionDescription) -> Result<()> {
        let Some(handle) = self.existing_handle(from) else {
            warn!("Discarding answer from {}: no connection", from);
            return Ok(());
        };
        let _negotiation = handle.slot.negotiation.lock().await;
        self.ensure_current(&handle)?;

        let state = handle.transport.signaling_state();
        if !negotiation::accepts_answer(state) {
            warn!("Discarding answer from {} in {:?}", from, state);
            return Ok(());
        }

        handle.transport.set_remote_description(desc).await?;
        self.ensure_current(&handle)?;
        self.flush_candidates(&handle).await;
        Ok(())
    }

    async fn apply_candidate(&self, from: &ParticipantId, candidate: IceCandidate) -> Result<()> {
        let (handle, _) = self.ensure_peer(from, false).await?;
        {
            let mut registry = self.registry.lock();
            if !registry.remote_description_applied(from) {
                registry.queue_candidate(from, candidate);
                return Ok(());
            }
        }

        let _negotiation = handle.slot.negotiation.lock().await;
        self.ensure_current(&handle)?;
        handle.transport.add_ice_candidate(candidate).await
    }

    /// Mark the remote description applied and apply queued candidates in order
    async fn flush_candidates(&self, handle: &PeerHandle) {
        let queued = self
            .registry
            .lock()
            .mark_remote_description_applied(handle.remote());
        if queued.is_empty() {
            return;
        }

        debug!(
            "Applying {} queued candidate(s) from {}",
            queued.len(),
            handle.remote()
        );
        for candidate in queued {
            if let Err(e) = handle.transport.add_ice_candidate(candidate).await {
                warn!("Failed to apply queued candidate from {}: {}", handle.remote(), e);
            }
        }
    }

    // ---- signals --------------------------------------------------------

    /// Apply a batch of incoming messages
    ///
    /// Batches never overlap: a batch handed in while another is being
    /// applied is appended behind it and applied by the running call.
    /// Returns the number of messages this call consumed.
    pub async fn process_signals(&self, batch: Vec<SignalMessage>) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.deferred.lock().extend(batch);

        let mut consumed = 0;
        loop {
            let Some(guard) = ProcessingGuard::try_acquire(&self.processing) else {
                trace!("Signal batch deferred behind running batch");
                return consumed;
            };

            loop {
                let next = self.deferred.lock().pop_front();
                let Some(message) = next else {
                    break;
                };
                if self.process_one(message).await {
                    consumed += 1;
                }
            }
            drop(guard);

            // a batch may have been appended between the last pop and the release
            if self.is_closed() || self.deferred.lock().is_empty() {
                return consumed;
            }
        }
    }

    async fn process_one(&self, message: SignalMessage) -> bool {
        if !self.channel.claim(&message).await {
            return false;
        }

        if self.departed.lock().contains(&message.from) {
            debug!(
                "Discarding {} {} from departed participant {}",
                message.kind, message.id, message.from
            );
            return true;
        }

        trace!("Applying {} {} from {}", message.kind, message.id, message.from);
        let result = match message.decode() {
            Ok(SignalBody::Offer(desc)) => self.apply_offer(&message.from, desc).await,
            Ok(SignalBody::Answer(desc)) => self.apply_answer(&message.from, desc).await,
            Ok(SignalBody::IceCandidate(candidate)) => {
                self.apply_candidate(&message.from, candidate).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {}
            Err(e @ (Error::SessionClosed | Error::PeerNotFound(_))) => {
                debug!("Dropped {} from {}: {}", message.kind, message.from, e);
            }
            Err(e) => {
                warn!("Failed to apply {} from {}: {}", message.kind, message.from, e);
            }
        }
        true
    }

    // ---- transport events -----------------------------------------------

    /// React to one transport event
    ///
    /// Events from a record that has since been replaced or removed are
    /// dropped.
    pub async fn handle_peer_event(self: &Arc<Self>, event: PeerEvent) {
        let PeerEvent {
            peer,
            connection,
            kind,
        } = event;

        if self.is_closed() || !self.registry.lock().is_current(&peer, connection) {
            trace!("Dropping stale event for {} ({:?})", peer, kind);
            return;
        }

        match kind {
            PeerEventKind::LocalCandidate(candidate) => {
                self.channel.send_candidate(&peer, &candidate).await;
            }
            PeerEventKind::RemoteTrack(track) => {
                info!(
                    "Receiving {} track {} (stream {}) from {}",
                    track.kind, track.id, track.stream_id, peer
                );
                {
                    let mut registry = self.registry.lock();
                    registry.set_remote_stream(&peer, track);
                    registry.set_phase(&peer, PeerPhase::Connected);
                }
                self.refresh_connected();
            }
            PeerEventKind::NegotiationNeeded => self.renegotiate(&peer, connection).await,
            kind if negotiation::is_failure(&kind) => {
                self.on_transport_failure(&peer, connection, &format!("{:?}", kind))
            }
            kind if negotiation::is_recovery(&kind) => self.on_transport_recovery(&peer),
            kind => trace!("Peer {} reported {:?}", peer, kind),
        }
    }

    fn on_transport_recovery(&self, peer: &ParticipantId) {
        {
            let mut registry = self.registry.lock();
            let phase = registry.phase(peer);
            let has_media = registry.has_remote_media(peer);
            if phase == Some(PeerPhase::Failed) {
                info!("Connection to {} recovered", peer);
                let next = if has_media {
                    PeerPhase::Connected
                } else {
                    PeerPhase::Connecting
                };
                registry.set_phase(peer, next);
            } else if has_media {
                registry.set_phase(peer, PeerPhase::Connected);
            }
        }
        self.refresh_connected();
    }

    fn on_transport_failure(
        self: &Arc<Self>,
        peer: &ParticipantId,
        connection: ConnectionId,
        reason: &str,
    ) {
        let scheduled = {
            let mut registry = self.registry.lock();
            registry.set_phase(peer, PeerPhase::Failed);
            registry.schedule_restart(peer)
        };
        self.refresh_connected();

        if !scheduled {
            debug!("ICE restart toward {} already pending ({})", peer, reason);
            return;
        }

        let delay = self.config.ice_restart_delay();
        warn!(
            "Connection to {} failed ({}), restarting ICE in {:?}",
            peer, reason, delay
        );

        let this = Arc::clone(self);
        let peer = peer.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                if !this.restart_ice(&peer, connection).await {
                    break;
                }
            }
        });
    }

    /// Send an ICE restart offer to a failed peer
    ///
    /// Returns `true` when the attempt must be repeated later because a
    /// remote offer is being applied.
    async fn restart_ice(&self, peer: &ParticipantId, connection: ConnectionId) -> bool {
        let handle = {
            let mut registry = self.registry.lock();
            let failed = registry.is_current(peer, connection)
                && registry.phase(peer) == Some(PeerPhase::Failed);
            if !failed || self.is_closed() {
                registry.clear_restart(peer);
                debug!("ICE restart toward {} no longer needed", peer);
                return false;
            }
            drop(registry);
            self.existing_handle(peer)
        };
        let Some(handle) = handle else {
            self.registry.lock().clear_restart(peer);
            return false;
        };

        let _negotiation = handle.slot.negotiation.lock().await;
        let state = handle.transport.signaling_state();
        if !negotiation::may_restart(state) {
            debug!("Postponing ICE restart toward {} in {:?}", peer, state);
            return true;
        }

        let attempt = self.registry.lock().note_restart_attempt(peer);
        info!("Restarting ICE toward {} (attempt {})", peer, attempt);
        let result = self.offer_locked(&handle, true).await;
        self.registry.lock().clear_restart(peer);
        match result {
            Ok(()) => {}
            Err(e @ (Error::SessionClosed | Error::PeerNotFound(_))) => {
                debug!("ICE restart toward {} abandoned: {}", peer, e);
            }
            Err(e) => {
                error!("ICE restart toward {} could not be attempted: {}", peer, e);
                self.status.error(CONNECTION_PROBLEM);
            }
        }
        false
    }

    async fn renegotiate(&self, peer: &ParticipantId, connection: ConnectionId) {
        let Some(handle) = self.existing_handle(peer) else {
            return;
        };
        if handle.slot.connection != connection {
            return;
        }

        let _negotiation = handle.slot.negotiation.lock().await;
        let state = handle.transport.signaling_state();
        let applied = self.registry.lock().remote_description_applied(peer);
        if !negotiation::may_renegotiate(state, applied) {
            debug!(
                "Renegotiation with {} deferred ({:?}, remote description applied={})",
                peer, state, applied
            );
            return;
        }

        info!("Renegotiating with {}", peer);
        if let Err(e) = self.offer_locked(&handle, false).await {
            warn!("Renegotiation with {} failed: {}", peer, e);
        }
    }

    // ---- quality --------------------------------------------------------

    /// Sample the transport metrics of every connected peer
    ///
    /// Returns the number of peers sampled.
    pub async fn sample_quality(&self) -> usize {
        let ids = self.registry.lock().ids();
        let mut sampled = 0;
        for remote in ids {
            if self.registry.lock().phase(&remote) != Some(PeerPhase::Connected) {
                continue;
            }
            let Some(handle) = self.existing_handle(&remote) else {
                continue;
            };
            let stats = match handle.transport.stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    debug!("No stats for {}: {}", remote, e);
                    continue;
                }
            };

            let sample = QualitySample::new(stats);
            let previous = {
                let mut registry = self.registry.lock();
                if !registry.is_current(&remote, handle.slot.connection) {
                    continue;
                }
                registry.set_quality(&remote, sample)
            };
            sampled += 1;

            if previous.map(|p| p.quality) == Some(sample.quality) {
                continue;
            }
            if sample.quality.is_degraded() {
                warn!(
                    "Connection quality to {} degraded to {} (rtt {:.0}ms, loss {:.1}%)",
                    remote, sample.quality, stats.rtt_ms, stats.packet_loss_percent
                );
            } else {
                debug!("Connection quality to {}: {}", remote, sample.quality);
            }
        }
        sampled
    }

    // ---- lifecycle ------------------------------------------------------

    /// Tear down every peer connection
    ///
    /// Pending signal batches and queued candidates are discarded. Later
    /// calls into the orchestrator are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let transports = self.registry.lock().drain();
        info!(
            "Closing mesh for {} ({} peer connection(s))",
            self.local_id,
            transports.len()
        );
        for transport in transports {
            if let Err(e) = transport.close().await {
                warn!("Error closing peer connection: {}", e);
            }
        }

        self.deferred.lock().clear();
        self.roster.lock().clear();
        self.channel.reset();
        self.status.left();
    }

    /// Apply roster snapshots until the stream ends or the mesh closes
    pub async fn run_roster(self: Arc<Self>, mut roster: BoxStream<'static, Vec<Participant>>) {
        while let Some(participants) = roster.next().await {
            if self.is_closed() {
                break;
            }
            self.sync_roster(&participants).await;
        }
        debug!("Roster loop for {} finished", self.local_id);
    }

    /// Apply signal batches until the stream ends or the mesh closes
    pub async fn run_signals(self: Arc<Self>, mut signals: BoxStream<'static, Vec<SignalMessage>>) {
        while let Some(batch) = signals.next().await {
            if self.is_closed() {
                break;
            }
            if !batch.is_empty() {
                self.process_signals(batch).await;
            }
        }
        debug!("Signal loop for {} finished", self.local_id);
    }

    /// Sample connection quality every `interval` until the mesh closes
    pub async fn run_quality(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.is_closed() {
                break;
            }
            self.sample_quality().await;
        }
        debug!("Quality loop for {} finished", self.local_id);
    }

    /// Handle transport events until the mesh closes
    pub async fn run_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        while let Some(event) = events.recv().await {
            if self.is_closed() {
                break;
            }
            self.handle_peer_event(event).await;
        }
        debug!("Event loop for {} finished", self.local_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CallBackend, CallOptions, MemoryBackend};
    use crate::config::AudioConstraints;
    use crate::media::OpusMicrophone;
    use crate::participant::{is_polite, CallId};
    use crate::peer::{LoopbackNetwork, SignalingState};
    use crate::signaling::{SignalId, SignalKind};

    struct Fixture {
        backend: MemoryBackend,
        call: CallId,
        network: LoopbackNetwork,
        local: ParticipantId,
        remote: ParticipantId,
        mesh: Arc<MeshOrchestrator>,
        _events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    async fn fixture(network: LoopbackNetwork) -> Fixture {
        fixture_with(network, CallConfig::default(), false).await
    }

    /// With `polite`, the local side is the one that yields on collision
    async fn fixture_with(network: LoopbackNetwork, config: CallConfig, polite: bool) -> Fixture {
        let backend = MemoryBackend::new();
        let call = backend.create_call(CallOptions::default());
        let first = backend.join_call(&call, "Local").await.unwrap();
        let second = backend.join_call(&call, "Remote").await.unwrap();
        let (local, remote) = if polite && !is_polite(&first, &second) {
            (second, first)
        } else {
            (first, second)
        };

        let channel = SignalingChannel::new(Arc::new(backend.clone()), call.clone(), local.clone());
        let media = Arc::new(LocalMediaController::new(
            Arc::new(OpusMicrophone::mono()),
            AudioConstraints::default(),
        ));
        let (mesh, events) = MeshOrchestrator::new(
            config,
            channel,
            Arc::new(network.clone()),
            media,
        );

        Fixture {
            backend,
            call,
            network,
            local,
            remote,
            mesh,
            _events: events,
        }
    }

    impl Fixture {
        fn incoming(&self, id: &str, kind: SignalKind, payload: String) -> SignalMessage {
            SignalMessage {
                id: SignalId::new(id),
                call_id: self.call.clone(),
                kind,
                from: self.remote.clone(),
                to: self.local.clone(),
                payload,
                created_at: 0,
                expires_at: u64::MAX,
                delivered: false,
            }
        }

        fn candidate(&self, id: &str, n: u32) -> SignalMessage {
            let candidate = test_candidate(n);
            self.incoming(id, SignalKind::IceCandidate, candidate.to_json().unwrap())
        }

        fn remote_offer(&self, id: &str) -> SignalMessage {
            let offer = SessionDescription::offer(format!(
                "v=0\r\na=ice-ufrag:{}-0\r\na=recvonly\r\n",
                self.remote
            ));
            self.incoming(id, SignalKind::Offer, offer.to_json().unwrap())
        }

        fn remote_answer(&self, id: &str) -> SignalMessage {
            let answer = SessionDescription::answer(format!(
                "v=0\r\na=ice-ufrag:{}-0\r\na=recvonly\r\n",
                self.remote
            ));
            self.incoming(id, SignalKind::Answer, answer.to_json().unwrap())
        }

        fn sent(&self, kind: SignalKind) -> usize {
            self.backend
                .all_signals(&self.call)
                .iter()
                .filter(|s| s.kind == kind && s.from == self.local)
                .count()
        }

        fn applied(&self) -> Vec<IceCandidate> {
            self.network
                .transport(&self.local, &self.remote)
                .map(|t| t.applied_candidates())
                .unwrap_or_default()
        }
    }

    fn test_candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2130706431 10.0.0.{} 9 typ host", n, n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let f = fixture(LoopbackNetwork::new()).await;

        let consumed = f
            .mesh
            .process_signals(vec![f.candidate("sig-c1", 1), f.candidate("sig-c2", 2)])
            .await;
        assert_eq!(consumed, 2);
        assert!(f.applied().is_empty());
        assert_eq!(f.mesh.peers()[0].queued_candidates, 2);

        f.mesh.process_signals(vec![f.remote_offer("sig-o1")]).await;
        assert_eq!(f.applied(), vec![test_candidate(1), test_candidate(2)]);
        assert!(f.mesh.peers()[0].remote_description_applied);

        f.mesh.process_signals(vec![f.candidate("sig-c3", 3)]).await;
        assert_eq!(
            f.applied(),
            vec![test_candidate(1), test_candidate(2), test_candidate(3)]
        );
        assert_eq!(f.mesh.peers()[0].queued_candidates, 0);

        let answers: Vec<_> = f
            .backend
            .all_signals(&f.call)
            .into_iter()
            .filter(|s| s.kind == SignalKind::Answer)
            .collect();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].to, f.remote);
    }

    #[tokio::test]
    async fn test_duplicate_signal_is_consumed_once() {
        let f = fixture(LoopbackNetwork::new()).await;
        let message = f.candidate("sig-dup", 1);

        let consumed = f
            .mesh
            .process_signals(vec![message.clone(), message.clone()])
            .await;
        assert_eq!(consumed, 1);
        assert_eq!(f.mesh.process_signals(vec![message]).await, 0);
        assert_eq!(f.mesh.peers()[0].queued_candidates, 1);
    }

    #[tokio::test]
    async fn test_unsolicited_answer_is_discarded() {
        let f = fixture(LoopbackNetwork::new()).await;

        let consumed = f.mesh.process_signals(vec![f.remote_answer("sig-a1")]).await;
        assert_eq!(consumed, 1);
        assert!(f.mesh.peers().is_empty());
        assert_eq!(f.network.created(&f.local, &f.remote), 0);
    }

    #[tokio::test]
    async fn test_departed_participant_is_cleaned_up() {
        let f = fixture(LoopbackNetwork::new()).await;
        let roster = f.backend.participants(&f.call).await.unwrap();

        let change = f.mesh.sync_roster(&roster).await;
        assert_eq!(change.joined, vec![f.remote.clone()]);
        let transport = f.network.transport(&f.local, &f.remote).unwrap();

        let me: Vec<_> = roster.into_iter().filter(|p| p.id == f.local).collect();
        let change = f.mesh.sync_roster(&me).await;
        assert_eq!(change.departed, vec![f.remote.clone()]);
        assert!(f.mesh.peers().is_empty());
        assert!(transport.is_closed());

        f.mesh.process_signals(vec![f.remote_offer("sig-late")]).await;
        assert!(f.mesh.peers().is_empty());
        assert_eq!(f.network.created(&f.local, &f.remote), 1);
    }

    #[tokio::test]
    async fn test_concurrent_discovery_creates_one_connection() {
        let network = LoopbackNetwork::new().with_create_delay(Duration::from_millis(20));
        let f = fixture(network).await;
        let roster = f.backend.participants(&f.call).await.unwrap();

        let (change, _) = tokio::join!(
            f.mesh.sync_roster(&roster),
            f.mesh.process_signals(vec![f.candidate("sig-c1", 1)])
        );
        f.mesh.sync_roster(&roster).await;

        assert_eq!(f.network.created(&f.local, &f.remote), 1);
        assert_eq!(f.mesh.peers().len(), 1);
        assert!(change.joined.len() <= 1);
    }

    #[tokio::test]
    async fn test_failed_transport_creation_is_retried_on_next_roster() {
        let network = LoopbackNetwork::new();
        network.fail_next_creates(1);
        let f = fixture(network).await;
        let roster = f.backend.participants(&f.call).await.unwrap();

        let change = f.mesh.sync_roster(&roster).await;
        assert!(change.joined.is_empty());
        assert!(f.mesh.peers().is_empty());

        // unchanged roster, but the missing record is recreated
        let change = f.mesh.sync_roster(&roster).await;
        assert_eq!(change.joined, vec![f.remote.clone()]);
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let f = fixture(LoopbackNetwork::new()).await;
        let roster = f.backend.participants(&f.call).await.unwrap();
        f.mesh.sync_roster(&roster).await;
        let connection = f.mesh.peers()[0].connection;

        f.mesh
            .handle_peer_event(PeerEvent {
                peer: f.remote.clone(),
                connection: connection + 1,
                kind: PeerEventKind::ConnectionState(crate::peer::TransportState::Failed),
            })
            .await;
        assert_ne!(f.mesh.peers()[0].phase, PeerPhase::Failed);
    }

    #[tokio::test]
    async fn test_close_tears_everything_down() {
        let f = fixture(LoopbackNetwork::new()).await;
        let roster = f.backend.participants(&f.call).await.unwrap();
        f.mesh.sync_roster(&roster).await;
        let transport = f.network.transport(&f.local, &f.remote).unwrap();

        f.mesh.close().await;
        assert!(f.mesh.is_closed());
        assert!(f.mesh.peers().is_empty());
        assert!(transport.is_closed());
        assert_eq!(transport.signaling_state(), SignalingState::Closed);
        assert_eq!(f.mesh.current_status(), CallStatus::Disconnected);

        assert!(f.mesh.sync_roster(&roster).await.is_empty());
        assert_eq!(f.mesh.process_signals(vec![f.remote_offer("sig-x")]).await, 0);
        assert!(f.mesh.peers().is_empty());
    }

    #[tokio::test]
    async fn test_offer_collision_without_rollback_replaces_connection() {
        let network = LoopbackNetwork::new().without_rollback();
        let f = fixture_with(network, CallConfig::default(), true).await;

        f.mesh.send_offer(&f.remote).await.unwrap();
        let first = f.network.transport(&f.local, &f.remote).unwrap();
        let connection = f.mesh.peers()[0].connection;
        assert_eq!(first.signaling_state(), SignalingState::HaveLocalOffer);

        f.mesh.process_signals(vec![f.remote_offer("sig-o1")]).await;

        assert!(first.is_closed());
        assert_eq!(first.rollbacks(), 0);
        assert_eq!(f.network.created(&f.local, &f.remote), 2);
        let replacement = f.network.transport(&f.local, &f.remote).unwrap();
        assert_eq!(replacement.signaling_state(), SignalingState::Stable);

        let peers = f.mesh.peers();
        assert_eq!(peers.len(), 1);
        assert_ne!(peers[0].connection, connection);
        assert!(peers[0].remote_description_applied);
        assert_eq!(f.sent(SignalKind::Answer), 1);
    }

    #[tokio::test]
    async fn test_unanswered_offer_triggers_ice_restart() {
        let config = CallConfig::default()
            .with_offer_timeout(Duration::from_millis(30))
            .with_ice_restart_delay(Duration::from_millis(10));
        let f = fixture_with(LoopbackNetwork::new(), config, false).await;

        f.mesh.send_offer(&f.remote).await.unwrap();
        let transport = f.network.transport(&f.local, &f.remote).unwrap();
        assert_eq!(transport.ice_generation(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(transport.ice_generation() >= 1);
        assert!(f.mesh.peers()[0].restart_attempts >= 1);
        assert!(f.sent(SignalKind::Offer) >= 2);
        // repaired in place
        assert_eq!(f.network.created(&f.local, &f.remote), 1);
    }

    #[tokio::test]
    async fn test_answered_offer_does_not_time_out() {
        let config = CallConfig::default()
            .with_offer_timeout(Duration::from_millis(30))
            .with_ice_restart_delay(Duration::from_millis(10));
        let f = fixture_with(LoopbackNetwork::new(), config, false).await;

        f.mesh.send_offer(&f.remote).await.unwrap();
        f.mesh.process_signals(vec![f.remote_answer("sig-a1")]).await;
        let transport = f.network.transport(&f.local, &f.remote).unwrap();
        assert_eq!(transport.signaling_state(), SignalingState::Stable);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.ice_generation(), 0);
        assert_eq!(f.mesh.peers()[0].restart_attempts, 0);
        assert_eq!(f.sent(SignalKind::Offer), 1);
    }

    #[tokio::test]
    async fn test_quality_is_not_sampled_before_connect() {
        let f = fixture(LoopbackNetwork::new()).await;
        f.mesh.send_offer(&f.remote).await.unwrap();

        assert_eq!(f.mesh.sample_quality().await, 0);
        assert!(f.mesh.peers()[0].quality.is_none());
    }
}
