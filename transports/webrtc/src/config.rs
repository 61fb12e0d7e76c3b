//! Configuration types for a mesh call

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Public STUN servers used when nothing else is configured
pub const DEFAULT_STUN_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// Main configuration for a call session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// ICE candidate pool size (default: 10)
    pub ice_candidate_pool_size: u8,

    /// Bundle policy (default: MaxBundle)
    pub bundle_policy: BundlePolicy,

    /// RTCP mux policy (default: Require)
    pub rtcp_mux_policy: RtcpMuxPolicy,

    /// Microphone capture constraints
    pub audio: AudioConstraints,

    /// Lifetime of a signaling message in the store (default: 60000ms)
    pub signal_ttl_ms: u64,

    /// Maximum participants per call (default: 10, max: 10)
    pub max_call_participants: u32,

    /// Delay before an ICE restart is attempted after a failure (default: 1000ms)
    pub ice_restart_delay_ms: u64,

    /// Time an offer may stay unanswered before the connection is treated
    /// as failed (default: 10000ms)
    pub offer_timeout_ms: u64,

    /// Interval between connection quality samples (default: 5000ms)
    pub quality_interval_ms: u64,

    /// Backoff policy for joining the call
    pub join_retry: RetryPolicy,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnServerConfig {
    /// TURN server URLs (turn: or turns:)
    pub urls: Vec<String>,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Microphone capture constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    /// Echo cancellation (default: true)
    pub echo_cancellation: bool,
    /// Noise suppression (default: true)
    pub noise_suppression: bool,
    /// Automatic gain control (default: true)
    pub auto_gain_control: bool,
}

/// Media bundling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    /// Gather candidates per media type
    Balanced,
    /// Gather candidates per track
    MaxCompat,
    /// Gather candidates for a single transport (default)
    MaxBundle,
}

/// RTCP multiplexing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RtcpMuxPolicy {
    /// Negotiate RTCP mux when the remote supports it
    Negotiate,
    /// Require RTCP on the RTP transport (default)
    Require,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn_servers: Vec::new(),
            ice_candidate_pool_size: 10,
            bundle_policy: BundlePolicy::MaxBundle,
            rtcp_mux_policy: RtcpMuxPolicy::Require,
            audio: AudioConstraints::default(),
            signal_ttl_ms: 60_000,
            max_call_participants: 10,
            ice_restart_delay_ms: 1_000,
            offer_timeout_ms: 10_000,
            quality_interval_ms: 5_000,
            join_retry: RetryPolicy::default(),
        }
    }
}

impl CallConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty
    /// - a STUN URL does not start with `stun:` / `stuns:`
    /// - a TURN entry has no URLs, a non-TURN URL, or empty credentials
    /// - `max_call_participants` is not in range 2-10
    /// - `signal_ttl_ms`, `offer_timeout_ms` or `quality_interval_ms` is zero
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if let Some(bad) = self
            .stun_servers
            .iter()
            .find(|url| !url.starts_with("stun:") && !url.starts_with("stuns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "STUN url must start with stun: or stuns:, got {}",
                bad
            )));
        }

        for turn in &self.turn_servers {
            if turn.urls.is_empty() {
                return Err(Error::InvalidConfig(
                    "TURN server entry has no urls".to_string(),
                ));
            }
            if let Some(bad) = turn
                .urls
                .iter()
                .find(|url| !url.starts_with("turn:") && !url.starts_with("turns:"))
            {
                return Err(Error::InvalidConfig(format!(
                    "TURN url must start with turn: or turns:, got {}",
                    bad
                )));
            }
            if turn.username.is_empty() || turn.credential.is_empty() {
                return Err(Error::InvalidConfig(
                    "TURN server requires username and credential".to_string(),
                ));
            }
        }

        if self.max_call_participants < 2 || self.max_call_participants > 10 {
            return Err(Error::InvalidConfig(format!(
                "max_call_participants must be in range 2-10, got {}",
                self.max_call_participants
            )));
        }

        if self.signal_ttl_ms == 0 {
            return Err(Error::InvalidConfig(
                "signal_ttl_ms must be greater than zero".to_string(),
            ));
        }

        if self.offer_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "offer_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.quality_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "quality_interval_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Build a configuration from `MESH_*` environment variables
    ///
    /// `MESH_STUN_URLS` and `MESH_TURN_URLS` are comma-separated. TURN is only
    /// configured when urls, `MESH_TURN_USERNAME` and `MESH_TURN_CREDENTIAL`
    /// are all present.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let stun = parse_list(lookup("MESH_STUN_URLS").as_deref());
        if !stun.is_empty() {
            config.stun_servers = stun;
        }

        let turn_urls = parse_list(lookup("MESH_TURN_URLS").as_deref());
        let username = lookup("MESH_TURN_USERNAME").filter(|s| !s.is_empty());
        let credential = lookup("MESH_TURN_CREDENTIAL").filter(|s| !s.is_empty());

        if let (false, Some(username), Some(credential)) =
            (turn_urls.is_empty(), username, credential)
        {
            config.turn_servers = vec![TurnServerConfig {
                urls: turn_urls,
                username,
                credential,
            }];
        }

        config
    }

    /// Signal lifetime as a Duration
    pub fn signal_ttl(&self) -> Duration {
        Duration::from_millis(self.signal_ttl_ms)
    }

    /// ICE restart delay as a Duration
    pub fn ice_restart_delay(&self) -> Duration {
        Duration::from_millis(self.ice_restart_delay_ms)
    }

    /// Offer answer timeout as a Duration
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    /// Quality sampling interval as a Duration
    pub fn quality_interval(&self) -> Duration {
        Duration::from_millis(self.quality_interval_ms)
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the ICE restart delay
    pub fn with_ice_restart_delay(mut self, delay: Duration) -> Self {
        self.ice_restart_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set how long an offer may stay unanswered
    pub fn with_offer_timeout(mut self, timeout: Duration) -> Self {
        self.offer_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the quality sampling interval
    pub fn with_quality_interval(mut self, interval: Duration) -> Self {
        self.quality_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the maximum number of call participants
    pub fn with_max_call_participants(mut self, max: u32) -> Self {
        self.max_call_participants = max;
        self
    }

    /// Set the join retry policy
    pub fn with_join_retry(mut self, policy: RetryPolicy) -> Self {
        self.join_retry = policy;
        self
    }
}

fn parse_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
