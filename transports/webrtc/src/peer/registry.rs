//! Peer connection records
//!
//! One record per remote participant. The table is plain owned data; the
//! orchestrator wraps it in a lock and never holds that lock across an await,
//! so every operation here is synchronous. Transports are created lazily
//! through a per-record [`OnceCell`] so concurrent callers share one
//! initialisation.

use super::quality::QualitySample;
use super::transport::{ConnectionId, PeerTransport, RemoteTrack};
use crate::participant::ParticipantId;
use crate::signaling::IceCandidate;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::{debug, info};

/// Lifecycle of one remote peer as seen by the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// Record exists, no description exchanged yet
    NoConnection,
    /// Offer sent or received, exchange in progress
    Connecting,
    /// Remote media observed
    Connected,
    /// Transport reported failure, repair pending
    Failed,
}

/// Media received from one remote participant
#[derive(Debug, Clone)]
pub struct RemoteMedia {
    /// Stream identifier
    pub stream_id: String,
    /// Tracks received so far
    pub tracks: Vec<RemoteTrack>,
}

/// Shared handles of one record, cloned out for use across awaits
#[derive(Clone)]
pub struct PeerSlot {
    /// Remote participant
    pub remote: ParticipantId,
    /// Record generation
    pub connection: ConnectionId,
    /// Lazily created transport
    pub transport: Arc<OnceCell<Arc<dyn PeerTransport>>>,
    /// Serialises description changes for this peer
    pub negotiation: Arc<AsyncMutex<()>>,
}

struct PeerRecord {
    slot: PeerSlot,
    initiator: bool,
    phase: PeerPhase,
    remote_media: Option<RemoteMedia>,
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_applied: bool,
    restart_scheduled: bool,
    restart_attempts: u32,
    offers_sent: u64,
    quality: Option<QualitySample>,
}

/// Point-in-time view of one record
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    /// Remote participant
    pub remote: ParticipantId,
    /// Record generation
    pub connection: ConnectionId,
    /// Whether the local side sent the first offer
    pub initiator: bool,
    /// Mesh-level phase
    pub phase: PeerPhase,
    /// Whether a remote description has been applied
    pub remote_description_applied: bool,
    /// Candidates waiting for a remote description
    pub queued_candidates: usize,
    /// Received media, if any
    pub remote_media: Option<RemoteMedia>,
    /// ICE restarts attempted toward this peer
    pub restart_attempts: u32,
    /// Latest connection quality sample
    pub quality: Option<QualitySample>,
}

/// Table of peer connection records keyed by remote participant
#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<ParticipantId, PeerRecord>,
    next_connection: ConnectionId,
}

impl PeerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles of the record for `remote`
    pub fn get(&self, remote: &ParticipantId) -> Option<PeerSlot> {
        self.peers.get(remote).map(|r| r.slot.clone())
    }

    /// Create the record for `remote` unless one exists
    ///
    /// Returns the record's handles and whether a new record was inserted.
    /// This is the only operation that introduces state.
    pub fn create(&mut self, remote: &ParticipantId, initiator: bool) -> (PeerSlot, bool) {
        if let Some(record) = self.peers.get(remote) {
            return (record.slot.clone(), false);
        }

        let slot = self.next_slot(remote);

        debug!(
            "Creating peer record for {} (connection {}, initiator={})",
            remote, slot.connection, initiator
        );

        self.peers.insert(
            remote.clone(),
            PeerRecord {
                slot: slot.clone(),
                initiator,
                phase: PeerPhase::NoConnection,
                remote_media: None,
                pending_candidates: VecDeque::new(),
                remote_description_applied: false,
                restart_scheduled: false,
                restart_attempts: 0,
                offers_sent: 0,
                quality: None,
            },
        );
        (slot, true)
    }

    fn next_slot(&mut self, remote: &ParticipantId) -> PeerSlot {
        self.next_connection += 1;
        PeerSlot {
            remote: remote.clone(),
            connection: self.next_connection,
            transport: Arc::new(OnceCell::new()),
            negotiation: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Give generation `connection` of `remote` a fresh slot
    ///
    /// The record keeps its initiator flag, queued candidates and restart
    /// count; everything tied to the old transport is reset. Returns the new
    /// slot and the old transport, or `None` if `connection` is not current.
    pub fn replace(
        &mut self,
        remote: &ParticipantId,
        connection: ConnectionId,
    ) -> Option<(PeerSlot, Option<Arc<dyn PeerTransport>>)> {
        if !self.is_current(remote, connection) {
            return None;
        }
        let slot = self.next_slot(remote);
        let record = self.peers.get_mut(remote)?;
        let old = std::mem::replace(&mut record.slot, slot.clone());

        record.phase = PeerPhase::NoConnection;
        record.remote_media = None;
        record.remote_description_applied = false;
        record.restart_scheduled = false;
        record.quality = None;
        debug!(
            "Replaced connection {} to {} with {}",
            connection, remote, slot.connection
        );
        Some((slot, old.transport.get().cloned()))
    }

    /// Drop the record for `remote`
    ///
    /// Returns the transport so the caller can close it outside the lock.
    pub fn remove(&mut self, remote: &ParticipantId) -> Option<Arc<dyn PeerTransport>> {
        let record = self.peers.remove(remote)?;
        info!(
            "Removed peer record for {} ({} queued candidate(s) discarded)",
            remote,
            record.pending_candidates.len()
        );
        record.slot.transport.get().cloned()
    }

    /// Drop the record for `remote` only if it is still generation `connection`
    pub fn remove_if_current(
        &mut self,
        remote: &ParticipantId,
        connection: ConnectionId,
    ) -> Option<Arc<dyn PeerTransport>> {
        if self.is_current(remote, connection) {
            self.remove(remote)
        } else {
            None
        }
    }

    /// Drop every record, returning their transports
    pub fn drain(&mut self) -> Vec<Arc<dyn PeerTransport>> {
        self.peers
            .drain()
            .filter_map(|(_, record)| record.slot.transport.get().cloned())
            .collect()
    }

    /// Whether `remote` still has the record of generation `connection`
    pub fn is_current(&self, remote: &ParticipantId, connection: ConnectionId) -> bool {
        self.peers
            .get(remote)
            .is_some_and(|r| r.slot.connection == connection)
    }

    /// Merge a received track into the peer's remote stream
    ///
    /// Tracks of the same stream accumulate; a track of a different stream
    /// replaces the stream.
    pub fn set_remote_stream(&mut self, remote: &ParticipantId, track: RemoteTrack) {
        let Some(record) = self.peers.get_mut(remote) else {
            return;
        };

        match record.remote_media.as_mut() {
            Some(media) if media.stream_id == track.stream_id => {
                if !media.tracks.iter().any(|t| t.id == track.id) {
                    media.tracks.push(track);
                }
            }
            _ => {
                record.remote_media = Some(RemoteMedia {
                    stream_id: track.stream_id.clone(),
                    tracks: vec![track],
                });
            }
        }
    }

    /// Hold a candidate until a remote description is applied
    pub fn queue_candidate(&mut self, remote: &ParticipantId, candidate: IceCandidate) {
        if let Some(record) = self.peers.get_mut(remote) {
            record.pending_candidates.push_back(candidate);
            debug!(
                "Queued candidate for {} ({} pending)",
                remote,
                record.pending_candidates.len()
            );
        }
    }

    /// Record that a remote description is applied
    ///
    /// Returns the queued candidates in arrival order; the caller applies
    /// them before handling any later candidate.
    pub fn mark_remote_description_applied(&mut self, remote: &ParticipantId) -> Vec<IceCandidate> {
        match self.peers.get_mut(remote) {
            Some(record) => {
                record.remote_description_applied = true;
                record.pending_candidates.drain(..).collect()
            }
            None => Vec::new(),
        }
    }

    /// Whether a remote description has been applied for `remote`
    pub fn remote_description_applied(&self, remote: &ParticipantId) -> bool {
        self.peers
            .get(remote)
            .is_some_and(|r| r.remote_description_applied)
    }

    /// Current phase of `remote`
    pub fn phase(&self, remote: &ParticipantId) -> Option<PeerPhase> {
        self.peers.get(remote).map(|r| r.phase)
    }

    /// Move `remote` to `phase`
    pub fn set_phase(&mut self, remote: &ParticipantId, phase: PeerPhase) {
        if let Some(record) = self.peers.get_mut(remote) {
            if record.phase != phase {
                debug!("Peer {} phase {:?} -> {:?}", remote, record.phase, phase);
                record.phase = phase;
            }
        }
    }

    /// Whether `remote` has received media
    pub fn has_remote_media(&self, remote: &ParticipantId) -> bool {
        self.peers
            .get(remote)
            .is_some_and(|r| r.remote_media.is_some())
    }

    /// Claim the single pending restart slot for `remote`
    pub fn schedule_restart(&mut self, remote: &ParticipantId) -> bool {
        match self.peers.get_mut(remote) {
            Some(record) if !record.restart_scheduled => {
                record.restart_scheduled = true;
                true
            }
            _ => false,
        }
    }

    /// Release the pending restart slot for `remote`
    pub fn clear_restart(&mut self, remote: &ParticipantId) {
        if let Some(record) = self.peers.get_mut(remote) {
            record.restart_scheduled = false;
        }
    }

    /// Count one ICE restart attempt toward `remote`
    pub fn note_restart_attempt(&mut self, remote: &ParticipantId) -> u32 {
        match self.peers.get_mut(remote) {
            Some(record) => {
                record.restart_attempts += 1;
                record.restart_attempts
            }
            None => 0,
        }
    }

    /// Count an offer sent to `remote`, returning its sequence number
    pub fn note_offer(&mut self, remote: &ParticipantId) -> u64 {
        match self.peers.get_mut(remote) {
            Some(record) => {
                record.offers_sent += 1;
                record.offers_sent
            }
            None => 0,
        }
    }

    /// Sequence number of the last offer sent to `remote`
    pub fn last_offer(&self, remote: &ParticipantId) -> Option<u64> {
        self.peers.get(remote).map(|r| r.offers_sent)
    }

    /// Store a quality sample, returning the previous one
    pub fn set_quality(
        &mut self,
        remote: &ParticipantId,
        sample: QualitySample,
    ) -> Option<QualitySample> {
        self.peers
            .get_mut(remote)
            .and_then(|record| record.quality.replace(sample))
    }

    /// Number of records in [`PeerPhase::Connected`]
    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|r| r.phase == PeerPhase::Connected)
            .count()
    }

    /// Remote participants with a record
    pub fn ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of every record, ordered by participant id
    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<_> = self
            .peers
            .values()
            .map(|r| PeerSnapshot {
                remote: r.slot.remote.clone(),
                connection: r.slot.connection,
                initiator: r.initiator,
                phase: r.phase,
                remote_description_applied: r.remote_description_applied,
                queued_candidates: r.pending_candidates.len(),
                remote_media: r.remote_media.clone(),
                restart_attempts: r.restart_attempts,
                quality: r.quality,
            })
            .collect();
        peers.sort_by(|a, b| a.remote.cmp(&b.remote));
        peers
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 1 10.0.0.{} 9 typ host", n, n),
            ..Default::default()
        }
    }

    fn track(id: &str, stream: &str) -> RemoteTrack {
        RemoteTrack {
            id: id.to_string(),
            stream_id: stream.to_string(),
            kind: "audio".to_string(),
            source: None,
        }
    }

    #[test]
    fn test_create_is_idempotent() {
        let mut registry = PeerRegistry::new();
        let peer = ParticipantId::from("p-b");

        let (first, created) = registry.create(&peer, true);
        assert!(created);
        let (second, created) = registry.create(&peer, false);
        assert!(!created);

        assert_eq!(first.connection, second.connection);
        assert!(Arc::ptr_eq(&first.transport, &second.transport));
        assert_eq!(registry.len(), 1);
        assert!(registry.snapshot()[0].initiator);
    }

    #[test]
    fn test_recreated_record_gets_new_generation() {
        let mut registry = PeerRegistry::new();
        let peer = ParticipantId::from("p-b");

        let (first, _) = registry.create(&peer, false);
        registry.remove(&peer);
        let (second, _) = registry.create(&peer, false);

        assert_ne!(first.connection, second.connection);
        assert!(!registry.is_current(&peer, first.connection));
        assert!(registry.is_current(&peer, second.connection));
        assert!(registry.remove_if_current(&peer, first.connection).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_candidates_drain_in_arrival_order() {
        let mut registry = PeerRegistry::new();
        let peer = ParticipantId::from("p-b");
        registry.create(&peer, false);

        registry.queue_candidate(&peer, candidate(1));
        registry.queue_candidate(&peer, candidate(2));
        registry.queue_candidate(&peer, candidate(3));
        assert!(!registry.remote_description_applied(&peer));

        let drained = registry.mark_remote_description_applied(&peer);
        assert_eq!(drained, vec![candidate(1), candidate(2), candidate(3)]);
        assert!(registry.remote_description_applied(&peer));
        assert_eq!(registry.snapshot()[0].queued_candidates, 0);
    }

    #[test]
    fn test_unknown_peer_operations_are_noops() {
        let mut registry = PeerRegistry::new();
        let ghost = ParticipantId::from("p-ghost");

        registry.queue_candidate(&ghost, candidate(1));
        registry.set_remote_stream(&ghost, track("t1", "s1"));
        registry.set_phase(&ghost, PeerPhase::Connected);
        assert!(registry.mark_remote_description_applied(&ghost).is_empty());
        assert!(registry.remove(&ghost).is_none());
        assert!(registry.get(&ghost).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remote_stream_accumulates_by_stream_id() {
        let mut registry = PeerRegistry::new();
        let peer = ParticipantId::from("p-b");
        registry.create(&peer, false);

        registry.set_remote_stream(&peer, track("t1", "s1"));
        registry.set_remote_stream(&peer, track("t2", "s1"));
        registry.set_remote_stream(&peer, track("t2", "s1"));
        let media = registry.snapshot()[0].remote_media.clone().unwrap();
        assert_eq!(media.tracks.len(), 2);

        registry.set_remote_stream(&peer, track("t9", "s2"));
        let media = registry.snapshot()[0].remote_media.clone().unwrap();
        assert_eq!(media.stream_id, "s2");
        assert_eq!(media.tracks.len(), 1);
    }

    #[test]
    fn test_restart_slot_is_exclusive() {
        let mut registry = PeerRegistry::new();
        let peer = ParticipantId::from("p-b");
        registry.create(&peer, false);

        assert!(registry.schedule_restart(&peer));
        assert!(!registry.schedule_restart(&peer));
        registry.clear_restart(&peer);
        assert!(registry.schedule_restart(&peer));
    }

    #[test]
    fn test_replace_keeps_queue_and_resets_connection_state() {
        let mut registry = PeerRegistry::new();
        let peer = ParticipantId::from("p-b");
        let (first, _) = registry.create(&peer, true);
        registry.queue_candidate(&peer, candidate(1));
        registry.set_phase(&peer, PeerPhase::Connecting);
        registry.note_restart_attempt(&peer);

        let (second, old) = registry.replace(&peer, first.connection).unwrap();
        assert!(old.is_none());
        assert_ne!(first.connection, second.connection);
        assert!(!Arc::ptr_eq(&first.negotiation, &second.negotiation));
        assert!(registry.is_current(&peer, second.connection));

        let snapshot = &registry.snapshot()[0];
        assert!(snapshot.initiator);
        assert_eq!(snapshot.phase, PeerPhase::NoConnection);
        assert_eq!(snapshot.queued_candidates, 1);
        assert_eq!(snapshot.restart_attempts, 1);

        // a stale generation cannot be replaced twice
        assert!(registry.replace(&peer, first.connection).is_none());
    }

    #[test]
    fn test_restart_attempts_and_offers_are_counted() {
        let mut registry = PeerRegistry::new();
        let peer = ParticipantId::from("p-b");
        registry.create(&peer, false);

        assert_eq!(registry.note_restart_attempt(&peer), 1);
        assert_eq!(registry.note_restart_attempt(&peer), 2);
        assert_eq!(registry.snapshot()[0].restart_attempts, 2);

        assert_eq!(registry.last_offer(&peer), Some(0));
        assert_eq!(registry.note_offer(&peer), 1);
        assert_eq!(registry.last_offer(&peer), Some(1));
        assert_eq!(registry.note_offer(&ParticipantId::from("p-ghost")), 0);
    }

    #[test]
    fn test_quality_sample_replaces_previous() {
        use crate::peer::quality::{ConnectionQuality, TransportStats};

        let mut registry = PeerRegistry::new();
        let peer = ParticipantId::from("p-b");
        registry.create(&peer, false);

        let good = QualitySample::new(TransportStats::default());
        assert!(registry.set_quality(&peer, good).is_none());
        let poor = QualitySample::new(TransportStats {
            rtt_ms: 800.0,
            ..Default::default()
        });
        let previous = registry.set_quality(&peer, poor).unwrap();
        assert_eq!(previous.quality, ConnectionQuality::Excellent);
        assert_eq!(
            registry.snapshot()[0].quality.unwrap().quality,
            ConnectionQuality::Poor
        );
    }

    #[test]
    fn test_connected_count() {
        let mut registry = PeerRegistry::new();
        let b = ParticipantId::from("p-b");
        let c = ParticipantId::from("p-c");
        registry.create(&b, false);
        registry.create(&c, true);

        registry.set_phase(&b, PeerPhase::Connected);
        assert_eq!(registry.connected_count(), 1);
        registry.set_phase(&c, PeerPhase::Connected);
        registry.set_phase(&b, PeerPhase::Failed);
        assert_eq!(registry.connected_count(), 1);
        assert_eq!(registry.ids(), vec![b, c]);
    }
}
