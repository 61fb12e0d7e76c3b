//! Connection quality metrics
//!
//! Transports report raw [`TransportStats`]; the mesh grades them into a
//! [`ConnectionQuality`] level per peer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Raw metrics read from one transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Round-trip time of the selected candidate pair in milliseconds
    pub rtt_ms: f64,
    /// Packets reported lost by the remote side, in percent of packets sent
    pub packet_loss_percent: f64,
    /// Inter-arrival jitter in milliseconds
    pub jitter_ms: f64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets reported lost
    pub packets_lost: u64,
}

/// Graded connection quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl ConnectionQuality {
    /// Grade a set of metrics
    ///
    /// | level     | rtt      | loss  |
    /// |-----------|----------|-------|
    /// | excellent | < 100 ms | < 1 % |
    /// | good      | < 200 ms | < 3 % |
    /// | fair      | < 400 ms | < 5 % |
    /// | poor      | otherwise        ||
    pub fn classify(stats: &TransportStats) -> Self {
        let rtt = stats.rtt_ms;
        let loss = stats.packet_loss_percent;
        if rtt < 100.0 && loss < 1.0 {
            Self::Excellent
        } else if rtt < 200.0 && loss < 3.0 {
            Self::Good
        } else if rtt < 400.0 && loss < 5.0 {
            Self::Fair
        } else {
            Self::Poor
        }
    }

    /// Whether the level warrants a warning
    pub fn is_degraded(self) -> bool {
        matches!(self, Self::Fair | Self::Poor)
    }
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        };
        f.write_str(s)
    }
}

/// Latest quality sample of one peer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySample {
    pub quality: ConnectionQuality,
    pub stats: TransportStats,
    pub sampled_at: Instant,
}

impl QualitySample {
    /// Grade `stats` as of now
    pub fn new(stats: TransportStats) -> Self {
        Self {
            quality: ConnectionQuality::classify(&stats),
            stats,
            sampled_at: Instant::now(),
        }
    }
}
