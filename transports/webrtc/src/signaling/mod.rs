//! Signaling over the polled relay
//!
//! `protocol` holds the wire types; `channel` is the per-participant client
//! that addresses messages point-to-point and consumes incoming ones at most
//! once.

pub mod channel;
pub mod protocol;

pub use channel::SignalingChannel;
pub use protocol::{
    IceCandidate, OutgoingSignal, SdpKind, SessionDescription, SignalBody, SignalId, SignalKind,
    SignalMessage,
};
