//! Mesh Call Test Harness
//!
//! Provides infrastructure for integration testing of group calls with:
//! - One in-memory call store on a manual clock
//! - One loopback network shared by every participant
//! - Microphones that succeed, fail, or open on demand
//! - Polling helpers for eventually-true conditions
//!
//! Each join advances the clock by one millisecond, so participants joined
//! in order have strictly increasing join timestamps.

#![allow(dead_code)]

use async_trait::async_trait;
use ephemeral_webrtc::backend::{CallBackend, CallOptions, ManualClock, MemoryBackend};
use ephemeral_webrtc::media::{LocalAudioStream, LocalMediaController};
use ephemeral_webrtc::peer::{LoopbackTransport, PeerTransport, SignalingState};
use ephemeral_webrtc::signaling::SignalingChannel;
use ephemeral_webrtc::{
    AudioConstraints, CallConfig, CallId, CallSession, Error, LoopbackNetwork, MeshOrchestrator,
    MicrophoneProvider, OpusMicrophone, ParticipantId, PeerPhase, RetryPolicy,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Call error: {0}")]
    CallError(#[from] Error),

    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Default wait for mesh convergence
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,ephemeral_webrtc=debug")
        .with_test_writer()
        .try_init();
}

/// Configuration with short repair timers and no join retries
pub fn fast_config() -> CallConfig {
    CallConfig::default()
        .with_ice_restart_delay(Duration::from_millis(50))
        .with_offer_timeout(Duration::from_secs(1))
        .with_join_retry(RetryPolicy::none())
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_until<F>(what: &str, timeout: Duration, mut condition: F) -> HarnessResult<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(HarnessError::Timeout(what.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Microphone that is always denied
pub struct DeniedMicrophone;

#[async_trait]
impl MicrophoneProvider for DeniedMicrophone {
    async fn open(&self, _constraints: &AudioConstraints) -> ephemeral_webrtc::Result<LocalAudioStream> {
        Err(Error::MediaAcquisition("permission denied".to_string()))
    }
}

/// Microphone that opens only once [`GatedMicrophone::grant`] is called
#[derive(Default)]
pub struct GatedMicrophone {
    granted: Notify,
}

impl GatedMicrophone {
    /// Let the pending open complete
    pub fn grant(&self) {
        self.granted.notify_one();
    }
}

#[async_trait]
impl MicrophoneProvider for GatedMicrophone {
    async fn open(&self, constraints: &AudioConstraints) -> ephemeral_webrtc::Result<LocalAudioStream> {
        self.granted.notified().await;
        OpusMicrophone::mono().open(constraints).await
    }
}

/// An orchestrator driven by hand rather than by a session
pub struct ManualPeer {
    pub id: ParticipantId,
    pub mesh: Arc<MeshOrchestrator>,
    tasks: Vec<JoinHandle<()>>,
}

impl ManualPeer {
    /// Start applying incoming signals from the store
    pub fn start_signals(&mut self, backend: &MemoryBackend, call_id: &CallId) {
        let signals = backend.subscribe_signals(call_id, &self.id);
        self.tasks
            .push(tokio::spawn(Arc::clone(&self.mesh).run_signals(signals)));
    }
}

impl Drop for ManualPeer {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Main mesh test harness
///
/// Owns the call store and the loopback network every participant uses.
pub struct MeshTestHarness {
    /// Shared call store
    pub backend: MemoryBackend,

    /// Store clock
    pub clock: Arc<ManualClock>,

    /// Shared loopback network
    pub network: LoopbackNetwork,

    /// The call under test
    pub call_id: CallId,

    config: CallConfig,
}

impl MeshTestHarness {
    /// Create a harness with a fresh call
    pub fn new() -> Self {
        Self::with_options(CallOptions::default(), LoopbackNetwork::new())
    }

    /// Create a harness with custom call options and network
    pub fn with_options(options: CallOptions, network: LoopbackNetwork) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let backend = MemoryBackend::with_clock(clock.clone(), Duration::from_secs(60));
        let call_id = backend.create_call(options);
        info!("Created test call {}", call_id);

        Self {
            backend,
            clock,
            network,
            call_id,
            config: fast_config(),
        }
    }

    /// Join with a working microphone
    pub async fn join(&self, name: &str) -> HarnessResult<CallSession> {
        self.join_with(name, Arc::new(OpusMicrophone::mono())).await
    }

    /// Join with the given microphone
    pub async fn join_with(
        &self,
        name: &str,
        microphone: Arc<dyn MicrophoneProvider>,
    ) -> HarnessResult<CallSession> {
        self.clock.advance(1);
        let session = CallSession::join(
            Arc::new(self.backend.clone()),
            self.call_id.clone(),
            name,
            self.config.clone(),
            Arc::new(self.network.clone()),
            microphone,
        )
        .await?;
        info!("{} joined as {}", name, session.local_id());
        Ok(session)
    }

    /// Join and build an orchestrator that only handles transport events
    ///
    /// Roster and signals are left to the test.
    pub async fn join_manual(&self, name: &str) -> HarnessResult<ManualPeer> {
        self.clock.advance(1);
        let id = self.backend.join_call(&self.call_id, name).await?;
        let channel = SignalingChannel::new(
            Arc::new(self.backend.clone()),
            self.call_id.clone(),
            id.clone(),
        );
        let media = Arc::new(LocalMediaController::new(
            Arc::new(OpusMicrophone::mono()),
            AudioConstraints::default(),
        ));
        let (mesh, events) = MeshOrchestrator::new(
            self.config.clone(),
            channel,
            Arc::new(self.network.clone()),
            media,
        );
        let tasks = vec![tokio::spawn(Arc::clone(&mesh).run_events(events))];
        Ok(ManualPeer { id, mesh, tasks })
    }

    /// Transport `local` uses toward `remote`
    pub fn transport(
        &self,
        local: &ParticipantId,
        remote: &ParticipantId,
    ) -> Option<Arc<LoopbackTransport>> {
        self.network.transport(local, remote)
    }

    /// Whether both ends of a pair have ICE connectivity and are stable
    pub fn pair_connected(&self, a: &ParticipantId, b: &ParticipantId) -> bool {
        let up = |local: &ParticipantId, remote: &ParticipantId| {
            self.transport(local, remote).is_some_and(|t| {
                t.is_connected() && t.signaling_state() == SignalingState::Stable
            })
        };
        up(a, b) && up(b, a)
    }

    /// Wait until every session has a connected record for every other one
    pub async fn wait_for_mesh(&self, sessions: &[&CallSession]) -> HarnessResult<()> {
        let expected = sessions.len() - 1;
        wait_until("full mesh connected", CONVERGE_TIMEOUT, || {
            sessions.iter().all(|s| {
                let peers = s.peers();
                peers.len() == expected && peers.iter().all(|p| p.phase == PeerPhase::Connected)
            })
        })
        .await
    }

    /// Wait until every signal in the store has been acknowledged
    pub async fn wait_for_delivery(&self) -> HarnessResult<()> {
        wait_until("all signals delivered", CONVERGE_TIMEOUT, || {
            self.backend
                .all_signals(&self.call_id)
                .iter()
                .all(|s| s.delivered)
        })
        .await
    }

    /// Wait for `future`, failing after [`CONVERGE_TIMEOUT`]
    pub async fn within<T>(&self, what: &str, future: impl Future<Output = T>) -> HarnessResult<T> {
        tokio::time::timeout(CONVERGE_TIMEOUT, future)
            .await
            .map_err(|_| HarnessError::Timeout(what.to_string()))
    }
}
