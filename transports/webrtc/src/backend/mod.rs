//! Call membership and signaling relay collaborator
//!
//! The mesh never talks to a concrete store. Everything it needs from the
//! persistence layer is behind [`CallBackend`]: membership changes, the live
//! roster, and the store-and-forward signaling queue.

pub mod memory;

use crate::participant::{CallId, Participant, ParticipantId};
use crate::signaling::{OutgoingSignal, SignalId, SignalMessage};
use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use memory::{CallInfo, CallOptions, CallState, Clock, ManualClock, MemoryBackend, SystemClock};

/// Typed view of the call store
#[async_trait]
pub trait CallBackend: Send + Sync {
    /// Register the caller as a participant of `call_id`
    async fn join_call(&self, call_id: &CallId, display_name: &str) -> Result<ParticipantId>;

    /// Mark `participant` as departed
    async fn leave_call(&self, call_id: &CallId, participant: &ParticipantId) -> Result<()>;

    /// End the call for everyone
    async fn end_call(&self, call_id: &CallId) -> Result<()>;

    /// Current active participants
    async fn participants(&self, call_id: &CallId) -> Result<Vec<Participant>>;

    /// Live roster: yields the active participants now and on every change
    fn subscribe_participants(&self, call_id: &CallId) -> BoxStream<'static, Vec<Participant>>;

    /// Enqueue one message for a single target
    async fn send_signal(&self, signal: OutgoingSignal) -> Result<()>;

    /// Undelivered, unexpired messages addressed to `me`, oldest first
    async fn pending_signals(
        &self,
        call_id: &CallId,
        me: &ParticipantId,
    ) -> Result<Vec<SignalMessage>>;

    /// Yields [`CallBackend::pending_signals`] now and on every change
    fn subscribe_signals(
        &self,
        call_id: &CallId,
        me: &ParticipantId,
    ) -> BoxStream<'static, Vec<SignalMessage>>;

    /// Acknowledge a message. Idempotent; unknown ids are ignored.
    async fn mark_delivered(&self, signal_id: &SignalId) -> Result<()>;
}
