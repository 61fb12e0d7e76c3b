//! Full-mesh coordination
//!
//! Every participant runs one [`MeshOrchestrator`] holding a direct
//! connection to every other participant. Both ends of each pair make the
//! same decisions from shared data: the later joiner offers, and the
//! smaller identifier yields when offers collide.

pub mod negotiation;
pub mod orchestrator;
pub mod status;

pub use negotiation::OfferAction;
pub use orchestrator::{MeshOrchestrator, RosterChange};
pub use status::{CallStatus, StatusTracker, CONNECTION_PROBLEM};
