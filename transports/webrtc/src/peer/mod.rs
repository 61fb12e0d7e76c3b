//! Peer connections
//!
//! One transport and one registry record per remote participant.

pub mod connection;
pub mod loopback;
pub mod quality;
pub mod registry;
pub mod transport;

pub use connection::{RtcPeerTransport, RtcTransportFactory};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use quality::{ConnectionQuality, QualitySample, TransportStats};
pub use registry::{PeerPhase, PeerRegistry, PeerSlot, PeerSnapshot, RemoteMedia};
pub use transport::{
    ConnectionId, IceState, PeerEvent, PeerEventKind, PeerEventSink, PeerTransport, RemoteTrack,
    SignalingState, TransportFactory, TransportState,
};
