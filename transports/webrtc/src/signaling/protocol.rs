//! Signaling message types
//!
//! Payloads are the JSON form of the native session description / ICE
//! candidate init objects, so a browser peer and this crate can share a relay.

use crate::participant::{CallId, ParticipantId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signaling message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
    /// Trickled ICE candidate
    IceCandidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        })
    }
}

/// Store-assigned signaling message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(String);

impl SignalId {
    /// Wrap a raw identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message to be inserted into the relay, addressed to a single target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingSignal {
    /// Call the message belongs to
    pub call_id: CallId,
    /// Message kind
    pub kind: SignalKind,
    /// Sender participant
    pub from: ParticipantId,
    /// Target participant
    pub to: ParticipantId,
    /// Serialized session description or ICE candidate
    pub payload: String,
}

/// A message as stored by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    /// Message identifier
    pub id: SignalId,
    /// Call the message belongs to
    pub call_id: CallId,
    /// Message kind
    pub kind: SignalKind,
    /// Sender participant
    pub from: ParticipantId,
    /// Target participant
    pub to: ParticipantId,
    /// Serialized session description or ICE candidate
    pub payload: String,
    /// Creation timestamp (ms since epoch)
    pub created_at: u64,
    /// Expiry timestamp (ms since epoch)
    pub expires_at: u64,
    /// Whether the target has acknowledged the message
    pub delivered: bool,
}

impl SignalMessage {
    /// Whether the message can still be acted upon at `now`
    pub fn is_actionable(&self, now: u64) -> bool {
        !self.delivered && self.expires_at > now
    }

    /// Decode the payload according to the message kind
    pub fn decode(&self) -> Result<SignalBody> {
        match self.kind {
            SignalKind::Offer => {
                let desc = SessionDescription::from_json(&self.payload)?;
                if desc.kind != SdpKind::Offer {
                    return Err(Error::SdpError(format!(
                        "offer message {} carries a {:?} description",
                        self.id, desc.kind
                    )));
                }
                Ok(SignalBody::Offer(desc))
            }
            SignalKind::Answer => {
                let desc = SessionDescription::from_json(&self.payload)?;
                if desc.kind != SdpKind::Answer {
                    return Err(Error::SdpError(format!(
                        "answer message {} carries a {:?} description",
                        self.id, desc.kind
                    )));
                }
                Ok(SignalBody::Answer(desc))
            }
            SignalKind::IceCandidate => Ok(SignalBody::IceCandidate(IceCandidate::from_json(
                &self.payload,
            )?)),
        }
    }
}

/// Decoded signaling payload
#[derive(Debug, Clone, PartialEq)]
pub enum SignalBody {
    /// Remote offer
    Offer(SessionDescription),
    /// Remote answer
    Answer(SessionDescription),
    /// Remote ICE candidate
    IceCandidate(IceCandidate),
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Provisional answer
    Pranswer,
    /// Answer
    Answer,
    /// Rollback of a pending local or remote offer
    Rollback,
}

/// Session description (`{"type": ..., "sdp": ...}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Serialize for the relay
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a relay payload
    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// ICE candidate init (`{"candidate", "sdpMid", "sdpMLineIndex", "usernameFragment"}`)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,

    /// ICE username fragment the candidate belongs to
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Serialize for the relay
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a relay payload
    pub fn from_json(payload: &str) -> Result<Self> {
        let candidate: Self = serde_json::from_str(payload)?;
        if candidate.candidate.is_empty() {
            return Err(Error::IceCandidateError(
                "empty candidate line".to_string(),
            ));
        }
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(kind: SignalKind, payload: String) -> SignalMessage {
        SignalMessage {
            id: SignalId::new("s-1"),
            call_id: CallId::from("c-1"),
            kind,
            from: ParticipantId::from("a"),
            to: ParticipantId::from("b"),
            payload,
            created_at: 0,
            expires_at: 60_000,
            delivered: false,
        }
    }

    #[test]
    fn test_signal_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&SignalKind::IceCandidate).unwrap(),
            "\"ice-candidate\""
        );
        assert_eq!(SignalKind::Offer.to_string(), "offer");
    }

    #[test]
    fn test_description_matches_browser_shape() {
        let json = SessionDescription::offer("v=0").to_json().unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0"}"#);
    }

    #[test]
    fn test_candidate_accepts_browser_json() {
        let payload = r#"{"candidate":"candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}"#;
        let candidate = IceCandidate::from_json(payload).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_empty_candidate_rejected() {
        assert!(IceCandidate::from_json(r#"{"candidate":""}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_mismatched_description() {
        let msg = message(
            SignalKind::Offer,
            SessionDescription::answer("v=0").to_json().unwrap(),
        );
        assert!(matches!(msg.decode(), Err(Error::SdpError(_))));
    }

    #[test]
    fn test_decode_garbage_payload() {
        let msg = message(SignalKind::Answer, "not-json".to_string());
        assert!(matches!(msg.decode(), Err(Error::SerializationError(_))));
    }

    #[test]
    fn test_actionable_window() {
        let mut msg = message(SignalKind::Offer, String::new());
        assert!(msg.is_actionable(59_999));
        assert!(!msg.is_actionable(60_000));
        msg.delivered = true;
        assert!(!msg.is_actionable(0));
    }
}
