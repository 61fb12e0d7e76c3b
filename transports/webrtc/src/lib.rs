//! Full-mesh WebRTC group calls
//!
//! This crate connects every participant of a small audio call directly to
//! every other participant, using a polled store-and-forward relay for
//! signaling.
//!
//! # Features
//!
//! - **Full-mesh topology**: One peer connection per remote participant, up to 10 per call
//! - **Perfect negotiation**: Deterministic initiator and politeness rules, glare-safe
//! - **Trickle ICE**: Candidates queued until a remote description is applied
//! - **Self-repair**: ICE restart on connection failure, roster-driven cleanup
//! - **Opus audio**: Local microphone track with mute that never renegotiates
//! - **Pluggable backend**: Call membership and signaling behind a typed trait
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  CallBackend (membership + signaling relay)            │
//! │  ↓ roster subscription        ↓ signal subscription    │
//! │  CallSession                                           │
//! │  ├─ LocalMediaController (microphone, mute)            │
//! │  └─ MeshOrchestrator                                   │
//! │     ├─ SignalingChannel (send, claim, acknowledge)     │
//! │     ├─ PeerRegistry (one record per remote peer)       │
//! │     └─ PeerTransport (webrtc-rs or loopback)           │
//! │        ↓ (direct peer connections - mesh topology)     │
//! │  Remote participants                                   │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use ephemeral_webrtc::CallConfig;
//!
//! // Configure a call
//! let config = CallConfig {
//!     stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
//!     max_call_participants: 4,
//!     ..Default::default()
//! };
//!
//! // Validate configuration
//! assert!(config.validate().is_ok());
//! assert_eq!(config.max_call_participants, 4);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use ephemeral_webrtc::backend::{CallOptions, MemoryBackend};
//! use ephemeral_webrtc::{CallConfig, CallSession, OpusMicrophone, RtcTransportFactory};
//! use std::sync::Arc;
//!
//! # async fn example() -> ephemeral_webrtc::Result<()> {
//! let backend = MemoryBackend::new();
//! let call_id = backend.create_call(CallOptions::default());
//! let config = CallConfig::default();
//!
//! let session = CallSession::join(
//!     Arc::new(backend),
//!     call_id,
//!     "Alice",
//!     config.clone(),
//!     Arc::new(RtcTransportFactory::new(config)),
//!     Arc::new(OpusMicrophone::mono()),
//! )
//! .await?;
//!
//! session.set_muted(true);
//! session.leave().await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod backend;
pub mod config;
pub mod error;
pub mod media;
pub mod mesh;
pub mod participant;
pub mod peer;
pub mod retry;
pub mod session;
pub mod signaling;

// Re-exports for public API
pub use backend::CallBackend;
pub use config::{AudioConstraints, BundlePolicy, CallConfig, RtcpMuxPolicy, TurnServerConfig};
pub use error::{Error, Result};
pub use media::{LocalMediaController, MicrophoneProvider, OpusMicrophone};
pub use mesh::{CallStatus, MeshOrchestrator, RosterChange};
pub use participant::{CallId, Participant, ParticipantId};
pub use peer::{
    ConnectionQuality, LoopbackNetwork, PeerPhase, PeerSnapshot, QualitySample,
    RtcTransportFactory, TransportStats,
};
pub use retry::RetryPolicy;
pub use session::CallSession;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
