//! Client side of the signaling relay

use crate::backend::CallBackend;
use crate::participant::{CallId, ParticipantId};
use crate::signaling::protocol::{
    IceCandidate, OutgoingSignal, SdpKind, SessionDescription, SignalId, SignalKind,
    SignalMessage,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// One participant's view of the relay
///
/// Sends are best-effort: a failed send is logged and reported as `false`,
/// never retried. Incoming messages go through [`SignalingChannel::claim`],
/// which acknowledges them upstream before the caller acts on them.
pub struct SignalingChannel {
    backend: Arc<dyn CallBackend>,
    call_id: CallId,
    local_id: ParticipantId,
    consumed: Mutex<HashSet<SignalId>>,
}

impl SignalingChannel {
    /// Create a channel for `local_id` in `call_id`
    pub fn new(backend: Arc<dyn CallBackend>, call_id: CallId, local_id: ParticipantId) -> Self {
        Self {
            backend,
            call_id,
            local_id,
            consumed: Mutex::new(HashSet::new()),
        }
    }

    /// Call this channel belongs to
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Participant this channel sends as
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Send an offer or answer to `to`
    pub async fn send_description(&self, to: &ParticipantId, desc: &SessionDescription) -> bool {
        let kind = match desc.kind {
            SdpKind::Offer => SignalKind::Offer,
            SdpKind::Answer => SignalKind::Answer,
            other => {
                warn!("Refusing to relay a {:?} description to {}", other, to);
                return false;
            }
        };
        self.send(to, kind, desc.to_json()).await
    }

    /// Send a trickled candidate to `to`
    pub async fn send_candidate(&self, to: &ParticipantId, candidate: &IceCandidate) -> bool {
        self.send(to, SignalKind::IceCandidate, candidate.to_json())
            .await
    }

    async fn send(&self, to: &ParticipantId, kind: SignalKind, payload: Result<String>) -> bool {
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode {} for {}: {}", kind, to, e);
                return false;
            }
        };

        let signal = OutgoingSignal {
            call_id: self.call_id.clone(),
            kind,
            from: self.local_id.clone(),
            to: to.clone(),
            payload,
        };

        match self.backend.send_signal(signal).await {
            Ok(()) => {
                debug!("Sent {} to {}", kind, to);
                true
            }
            Err(e) => {
                warn!("Dropped {} to {}: {}", kind, to, e);
                false
            }
        }
    }

    /// Take ownership of an incoming message
    ///
    /// Returns `true` exactly once per message id, after the message has been
    /// marked delivered upstream. Messages not addressed to us, already seen,
    /// or whose acknowledgement fails are refused. A refused-on-ack message
    /// stays undelivered upstream and is offered again by the next poll.
    pub async fn claim(&self, message: &SignalMessage) -> bool {
        if message.to != self.local_id || message.call_id != self.call_id {
            warn!(
                "Ignoring signal {} addressed to {} in {}",
                message.id, message.to, message.call_id
            );
            return false;
        }

        if !self.consumed.lock().insert(message.id.clone()) {
            debug!("Skipping already consumed signal {}", message.id);
            return false;
        }

        if let Err(e) = self.acknowledge(&message.id).await {
            warn!("Failed to acknowledge signal {}: {}", message.id, e);
            self.consumed.lock().remove(&message.id);
            return false;
        }
        true
    }

    /// Mark a message delivered without processing it
    pub async fn acknowledge(&self, id: &SignalId) -> Result<()> {
        self.backend
            .mark_delivered(id)
            .await
            .map_err(|e| match e {
                e @ Error::SignalingError(_) => e,
                other => Error::SignalingError(other.to_string()),
            })
    }

    /// Whether `id` has already been consumed locally
    pub fn is_consumed(&self, id: &SignalId) -> bool {
        self.consumed.lock().contains(id)
    }

    /// Forget every consumed id
    pub fn reset(&self) {
        self.consumed.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CallOptions, MemoryBackend};

    async fn setup() -> (MemoryBackend, SignalingChannel, SignalingChannel) {
        let backend = MemoryBackend::new();
        let call = backend.create_call(CallOptions::default());
        let a = backend.join_call(&call, "Ada").await.unwrap();
        let b = backend.join_call(&call, "Bob").await.unwrap();
        let shared: Arc<dyn CallBackend> = Arc::new(backend.clone());
        (
            backend,
            SignalingChannel::new(shared.clone(), call.clone(), a),
            SignalingChannel::new(shared, call, b),
        )
    }

    #[tokio::test]
    async fn test_claim_acknowledges_before_returning() {
        let (backend, a, b) = setup().await;
        assert!(
            a.send_description(b.local_id(), &SessionDescription::offer("v=0"))
                .await
        );

        let pending = backend
            .pending_signals(b.call_id(), b.local_id())
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, SignalKind::Offer);

        assert!(b.claim(&pending[0]).await);
        assert!(b.is_consumed(&pending[0].id));
        assert!(backend
            .pending_signals(b.call_id(), b.local_id())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_observation_is_refused() {
        let (backend, a, b) = setup().await;
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".to_string(),
            ..Default::default()
        };
        assert!(a.send_candidate(b.local_id(), &candidate).await);

        let pending = backend
            .pending_signals(b.call_id(), b.local_id())
            .await
            .unwrap();
        assert!(b.claim(&pending[0]).await);
        assert!(!b.claim(&pending[0]).await);
    }

    #[tokio::test]
    async fn test_claim_refuses_misaddressed_message() {
        let (backend, a, b) = setup().await;
        a.send_description(b.local_id(), &SessionDescription::offer("v=0"))
            .await;
        let pending = backend
            .pending_signals(b.call_id(), b.local_id())
            .await
            .unwrap();

        assert!(!a.claim(&pending[0]).await);
        assert!(!a.is_consumed(&pending[0].id));
    }

    #[tokio::test]
    async fn test_send_failure_is_swallowed() {
        let (backend, a, b) = setup().await;
        backend.inject_send_failures(1);
        assert!(
            !a.send_description(b.local_id(), &SessionDescription::answer("v=0"))
                .await
        );
        assert!(backend.all_signals(a.call_id()).is_empty());
    }

    #[tokio::test]
    async fn test_rollback_is_never_relayed() {
        let (backend, a, b) = setup().await;
        let rollback = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        assert!(!a.send_description(b.local_id(), &rollback).await);
        assert!(backend.all_signals(a.call_id()).is_empty());
    }
}
