//! Perfect negotiation rules
//!
//! Pure decisions shared by every peer. Both ends of a pair evaluate them on
//! data they both observe, so they agree without exchanging anything.

use crate::participant::{is_polite, ParticipantId};
use crate::peer::{IceState, PeerEventKind, SignalingState, TransportState};

/// What to do with an incoming offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferAction {
    /// No collision: apply and answer
    Accept,
    /// Collision on the polite side: drop our offer, then apply and answer
    RollbackThenAccept,
    /// Collision on the impolite side: keep our offer in flight
    Ignore,
}

/// Decide how `local` treats an offer from `remote` in `state`
pub fn on_remote_offer(
    local: &ParticipantId,
    remote: &ParticipantId,
    state: SignalingState,
) -> OfferAction {
    match state {
        SignalingState::Stable => OfferAction::Accept,
        SignalingState::Closed => OfferAction::Ignore,
        _ if is_polite(local, remote) => OfferAction::RollbackThenAccept,
        _ => OfferAction::Ignore,
    }
}

/// Whether an answer can be applied in `state`
pub fn accepts_answer(state: SignalingState) -> bool {
    state == SignalingState::HaveLocalOffer
}

/// Whether a fresh local offer may be generated in `state`
pub fn may_offer(state: SignalingState) -> bool {
    state == SignalingState::Stable
}

/// Whether an ICE restart offer may be generated in `state`
///
/// A restart may replace an unanswered offer of our own.
pub fn may_restart(state: SignalingState) -> bool {
    matches!(
        state,
        SignalingState::Stable | SignalingState::HaveLocalOffer
    )
}

/// Whether a local media change may trigger a new offer
pub fn may_renegotiate(state: SignalingState, remote_description_applied: bool) -> bool {
    may_offer(state) && remote_description_applied
}

/// Whether a transport event calls for an ICE restart
pub fn is_failure(kind: &PeerEventKind) -> bool {
    matches!(
        kind,
        PeerEventKind::ConnectionState(TransportState::Failed | TransportState::Disconnected)
            | PeerEventKind::IceConnectionState(IceState::Failed)
    )
}

/// Whether a transport event reports restored connectivity
pub fn is_recovery(kind: &PeerEventKind) -> bool {
    matches!(
        kind,
        PeerEventKind::ConnectionState(TransportState::Connected)
            | PeerEventKind::IceConnectionState(IceState::Connected | IceState::Completed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_offer_is_always_accepted() {
        let a = ParticipantId::from("a");
        let b = ParticipantId::from("b");
        assert_eq!(
            on_remote_offer(&a, &b, SignalingState::Stable),
            OfferAction::Accept
        );
        assert_eq!(
            on_remote_offer(&b, &a, SignalingState::Stable),
            OfferAction::Accept
        );
    }

    #[test]
    fn test_collision_keeps_exactly_one_offer() {
        let a = ParticipantId::from("a");
        let b = ParticipantId::from("b");
        let at_a = on_remote_offer(&a, &b, SignalingState::HaveLocalOffer);
        let at_b = on_remote_offer(&b, &a, SignalingState::HaveLocalOffer);

        assert_eq!(at_a, OfferAction::RollbackThenAccept);
        assert_eq!(at_b, OfferAction::Ignore);
    }

    #[test]
    fn test_answer_only_when_awaiting_one() {
        assert!(accepts_answer(SignalingState::HaveLocalOffer));
        assert!(!accepts_answer(SignalingState::Stable));
        assert!(!accepts_answer(SignalingState::HaveRemoteOffer));
    }

    #[test]
    fn test_renegotiation_needs_prior_remote_description() {
        assert!(may_renegotiate(SignalingState::Stable, true));
        assert!(!may_renegotiate(SignalingState::Stable, false));
        assert!(!may_renegotiate(SignalingState::HaveLocalOffer, true));
    }

    #[test]
    fn test_restart_waits_for_remote_offer_to_settle() {
        assert!(may_restart(SignalingState::Stable));
        assert!(may_restart(SignalingState::HaveLocalOffer));
        assert!(!may_restart(SignalingState::HaveRemoteOffer));
        assert!(!may_restart(SignalingState::Closed));
    }

    #[test]
    fn test_failure_classification() {
        assert!(is_failure(&PeerEventKind::ConnectionState(
            TransportState::Failed
        )));
        assert!(is_failure(&PeerEventKind::ConnectionState(
            TransportState::Disconnected
        )));
        assert!(is_failure(&PeerEventKind::IceConnectionState(
            IceState::Failed
        )));
        assert!(!is_failure(&PeerEventKind::IceConnectionState(
            IceState::Disconnected
        )));
        assert!(is_recovery(&PeerEventKind::IceConnectionState(
            IceState::Completed
        )));
        assert!(!is_recovery(&PeerEventKind::NegotiationNeeded));
    }
}
