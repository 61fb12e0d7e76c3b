//! Call and participant identity
//!
//! Identifiers are opaque strings minted by the call store. The only
//! structure the mesh relies on is their total order, which both ends of a
//! pair compute identically.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque call identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

/// Opaque participant identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

macro_rules! string_id {
    ($ty:ident) => {
        impl $ty {
            /// Wrap a raw identifier
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $ty {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(CallId);
string_id!(ParticipantId);

/// One active call attendee as seen in the live roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Participant identifier
    pub id: ParticipantId,

    /// Display name
    pub display_name: String,

    /// Join timestamp in milliseconds since the epoch
    pub joined_at: u64,

    /// Departure timestamp, absent while active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_at: Option<u64>,
}

impl Participant {
    /// Whether the participant is still in the call
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }

    /// Whether this participant should send the first offer to `other`
    ///
    /// The later joiner offers to the earlier joiner. On a timestamp tie the
    /// greater identifier offers, so exactly one side of every pair initiates.
    pub fn initiates_toward(&self, other: &Participant) -> bool {
        match self.joined_at.cmp(&other.joined_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.id > other.id,
        }
    }
}

/// Whether the local side yields during an offer collision with `remote`
///
/// The smaller identifier is polite: it rolls back its own offer and answers
/// the incoming one. The larger identifier ignores the incoming offer.
pub fn is_polite(local: &ParticipantId, remote: &ParticipantId) -> bool {
    local < remote
}
