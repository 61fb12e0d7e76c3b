//! Per-call driver
//!
//! A [`CallSession`] joins a call, wires the backend subscriptions into a
//! [`MeshOrchestrator`] and owns the background tasks feeding it. Its
//! lifetime is the participant's presence in the call.

use crate::backend::CallBackend;
use crate::config::CallConfig;
use crate::media::{LocalMediaController, MicrophoneProvider};
use crate::mesh::{CallStatus, MeshOrchestrator};
use crate::participant::{CallId, ParticipantId};
use crate::peer::{PeerSnapshot, TransportFactory};
use crate::signaling::SignalingChannel;
use crate::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// One participant's presence in one call
pub struct CallSession {
    backend: Arc<dyn CallBackend>,
    call_id: CallId,
    local_id: ParticipantId,
    orchestrator: Arc<MeshOrchestrator>,
    media: Arc<LocalMediaController>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    left: AtomicBool,
}

impl CallSession {
    /// Join `call_id` and start meshing with the other participants
    ///
    /// Joining is retried according to `config.join_retry`. The microphone
    /// is opened in the background; a denied microphone leaves the session
    /// receive-only and is reported by [`CallSession::media_error`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the call cannot
    /// be joined (unknown, ended or full).
    #[instrument(skip(backend, config, factory, microphone))]
    pub async fn join(
        backend: Arc<dyn CallBackend>,
        call_id: CallId,
        display_name: &str,
        config: CallConfig,
        factory: Arc<dyn TransportFactory>,
        microphone: Arc<dyn MicrophoneProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let local_id = config
            .join_retry
            .run("join_call", || backend.join_call(&call_id, display_name))
            .await?;
        info!("Joined call {} as {}", call_id, local_id);

        let channel = SignalingChannel::new(Arc::clone(&backend), call_id.clone(), local_id.clone());
        let media = Arc::new(LocalMediaController::new(microphone, config.audio));
        let quality_interval = config.quality_interval();
        let (orchestrator, events) =
            MeshOrchestrator::new(config, channel, factory, Arc::clone(&media));

        let tasks = vec![
            tokio::spawn(Arc::clone(&orchestrator).run_events(events)),
            tokio::spawn(
                Arc::clone(&orchestrator).run_roster(backend.subscribe_participants(&call_id)),
            ),
            tokio::spawn(
                Arc::clone(&orchestrator)
                    .run_signals(backend.subscribe_signals(&call_id, &local_id)),
            ),
            tokio::spawn(Arc::clone(&orchestrator).run_quality(quality_interval)),
            tokio::spawn(acquire_media(Arc::clone(&orchestrator))),
        ];

        Ok(Self {
            backend,
            call_id,
            local_id,
            orchestrator,
            media,
            tasks: Mutex::new(tasks),
            left: AtomicBool::new(false),
        })
    }

    /// Call this session belongs to
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Identifier the call store assigned to us
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// The mesh driven by this session
    pub fn orchestrator(&self) -> &Arc<MeshOrchestrator> {
        &self.orchestrator
    }

    /// Snapshot of every peer record
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.orchestrator.peers()
    }

    /// Receiver observing the aggregate call status
    pub fn status(&self) -> watch::Receiver<CallStatus> {
        self.orchestrator.status()
    }

    /// Time spent with at least one connected peer
    pub fn call_duration(&self) -> Duration {
        self.orchestrator.call_duration()
    }

    /// Whether [`CallSession::leave`] has not run yet
    pub fn is_active(&self) -> bool {
        !self.left.load(Ordering::SeqCst)
    }

    /// Mute or unmute the microphone without renegotiating
    pub fn set_muted(&self, muted: bool) {
        self.media.set_muted(muted);
    }

    /// Whether the microphone is muted
    pub fn is_muted(&self) -> bool {
        self.media.is_muted()
    }

    /// Message from the last failed microphone acquisition
    pub fn media_error(&self) -> Option<String> {
        self.media.last_error()
    }

    /// Try the microphone again after a failure
    pub async fn retry_media(&self) -> Result<()> {
        self.media.acquire().await?;
        self.orchestrator.attach_local_media().await;
        Ok(())
    }

    /// Leave the call
    ///
    /// Local teardown happens first and never waits on the backend: the
    /// microphone is released, every peer connection closed and every queue
    /// discarded. The departure is then recorded in the call store.
    pub async fn leave(&self) -> Result<()> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.media.release();
        self.orchestrator.close().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Left call {} as {}", self.call_id, self.local_id);

        self.backend
            .leave_call(&self.call_id, &self.local_id)
            .await
            .inspect_err(|e| warn!("Failed to record departure from {}: {}", self.call_id, e))
    }

    /// End the call for every participant, then leave
    pub async fn end_call(&self) -> Result<()> {
        self.backend.end_call(&self.call_id).await?;
        info!("Ended call {}", self.call_id);
        self.leave().await
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn acquire_media(orchestrator: Arc<MeshOrchestrator>) {
    match orchestrator.media().acquire().await {
        Ok(_) => orchestrator.attach_local_media().await,
        Err(e) => warn!("Continuing without local audio: {}", e),
    }
}
