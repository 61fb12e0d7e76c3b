//! Native transport abstraction
//!
//! The orchestrator drives every remote peer through [`PeerTransport`] and
//! learns about asynchronous transport activity through [`PeerEvent`]s
//! pushed into a single channel. Events carry the [`ConnectionId`] of the
//! record that created the transport, so events from a torn-down connection
//! are recognisable as stale.

use super::quality::TransportStats;
use crate::media::LocalAudioStream;
use crate::participant::ParticipantId;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;
use webrtc::track::track_remote::TrackRemote;

/// Generation counter distinguishing successive records for the same peer
pub type ConnectionId = u64;

/// Offer/answer bookkeeping state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No description exchange in progress
    Stable,
    /// Local offer set, waiting for an answer
    HaveLocalOffer,
    /// Remote offer set, answer not yet produced
    HaveRemoteOffer,
    /// Local provisional answer set
    HaveLocalPranswer,
    /// Remote provisional answer set
    HaveRemotePranswer,
    /// Connection closed
    Closed,
}

/// Aggregate connection state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE agent state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Remote media track announced by the transport
#[derive(Clone)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Identifier of the stream the track belongs to
    pub stream_id: String,
    /// Media kind ("audio")
    pub kind: String,
    /// Native track handle, absent for in-process transports
    pub source: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("native", &self.source.is_some())
            .finish()
    }
}

/// What happened on a transport
#[derive(Debug, Clone)]
pub enum PeerEventKind {
    /// A local candidate was gathered and should be trickled to the peer
    LocalCandidate(IceCandidate),
    /// The peer started sending a track
    RemoteTrack(RemoteTrack),
    /// Aggregate connection state changed
    ConnectionState(TransportState),
    /// ICE connection state changed
    IceConnectionState(IceState),
    /// Local media changed and a new offer is needed
    NegotiationNeeded,
}

/// Event raised by the transport of one peer connection record
#[derive(Debug, Clone)]
pub struct PeerEvent {
    /// Remote participant
    pub peer: ParticipantId,
    /// Record generation that owns the transport
    pub connection: ConnectionId,
    /// Event payload
    pub kind: PeerEventKind,
}

/// Handle a transport uses to report events for its record
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer: ParticipantId,
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    /// Create a sink bound to one record
    pub fn new(
        peer: ParticipantId,
        connection: ConnectionId,
        tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            peer,
            connection,
            tx,
        }
    }

    /// Remote participant this sink reports for
    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    /// Report an event. Dropped silently once the orchestrator is gone.
    pub fn emit(&self, kind: PeerEventKind) {
        let event = PeerEvent {
            peer: self.peer.clone(),
            connection: self.connection,
            kind,
        };
        if self.tx.send(event).is_err() {
            trace!("Event for {} dropped, receiver closed", self.peer);
        }
    }
}

/// One real-time connection to a single remote participant
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Current signaling state
    fn signaling_state(&self) -> SignalingState;

    /// Generate an offer; `ice_restart` requests fresh ICE credentials
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    /// Generate an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a locally generated offer or answer
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    /// Apply a description received from the peer
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Whether [`PeerTransport::rollback`] can discard a pending local offer
    ///
    /// When it cannot, a colliding local offer is dropped by replacing the
    /// whole connection.
    fn supports_rollback(&self) -> bool {
        true
    }

    /// Discard the pending local or remote offer and return to stable
    async fn rollback(&self) -> Result<()>;

    /// Apply a remote candidate. Requires a remote description.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Whether local audio is already attached
    fn has_audio_sender(&self) -> bool;

    /// Attach the tracks of the local stream
    async fn add_local_audio(&self, stream: &LocalAudioStream) -> Result<()>;

    /// Current round-trip, loss and jitter metrics
    async fn stats(&self) -> Result<TransportStats>;

    /// Release native resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Creates transports for newly observed peers
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create the transport `local` uses to reach `remote`
    async fn create(
        &self,
        local: &ParticipantId,
        remote: &ParticipantId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerTransport>>;
}
