//! Local microphone capture
//!
//! The controller owns the single local stream of a call. Peer transports
//! only read it, attaching its tracks when they are created or when the
//! stream shows up late.

use crate::config::AudioConstraints;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Opus clock rate
const OPUS_CLOCK_RATE: u32 = 48000;

/// One local audio track
///
/// Wraps the RTP track that transports attach. Disabling the track drops
/// samples at the source instead of touching the connections.
pub struct LocalAudioTrack {
    id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
}

impl fmt::Debug for LocalAudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAudioTrack")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LocalAudioTrack {
    /// Wrap an RTP track
    pub fn new(rtp: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            id: rtp.id().to_string(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtp,
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether samples are forwarded
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the track
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the track has been stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the track for good
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// The RTP track handed to peer connections
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtp)
    }

    /// Send one encoded sample to every attached connection
    ///
    /// Samples written while the track is disabled are dropped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::MediaTrackError(format!(
                "track {} has been stopped",
                self.id
            )));
        }
        if !self.is_enabled() {
            return Ok(());
        }

        self.rtp
            .write_sample(sample)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to write RTP sample: {}", e)))
    }
}

/// A captured microphone stream
#[derive(Clone, Debug)]
pub struct LocalAudioStream {
    id: String,
    tracks: Vec<Arc<LocalAudioTrack>>,
}

impl LocalAudioStream {
    /// Assemble a stream from its tracks
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalAudioTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Audio tracks of the stream
    pub fn tracks(&self) -> &[Arc<LocalAudioTrack>] {
        &self.tracks
    }

    fn set_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            track.set_enabled(enabled);
        }
    }

    fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Source of microphone streams
#[async_trait]
pub trait MicrophoneProvider: Send + Sync {
    /// Open the microphone with the requested processing
    async fn open(&self, constraints: &AudioConstraints) -> Result<LocalAudioStream>;
}

/// Provider yielding a single Opus track fed by the application
///
/// Capture and encoding happen outside this crate; the application pushes
/// encoded frames through [`LocalAudioTrack::write_sample`].
#[derive(Debug, Default, Clone)]
pub struct OpusMicrophone {
    channels: u16,
}

impl OpusMicrophone {
    /// Mono microphone
    pub fn mono() -> Self {
        Self { channels: 1 }
    }

    /// Stereo microphone
    pub fn stereo() -> Self {
        Self { channels: 2 }
    }
}

#[async_trait]
impl MicrophoneProvider for OpusMicrophone {
    async fn open(&self, constraints: &AudioConstraints) -> Result<LocalAudioStream> {
        let stream_id = format!("mic-{}", uuid::Uuid::new_v4());
        let channels = self.channels.max(1);

        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: OPUS_CLOCK_RATE,
                channels,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            format!("audio-{}", uuid::Uuid::new_v4()),
            stream_id.clone(),
        ));

        debug!(
            "Opened Opus microphone {} (channels={}, {:?})",
            stream_id, channels, constraints
        );

        Ok(LocalAudioStream::new(
            stream_id,
            vec![Arc::new(LocalAudioTrack::new(rtp))],
        ))
    }
}

/// Owner of the local stream for one call
pub struct LocalMediaController {
    provider: Arc<dyn MicrophoneProvider>,
    constraints: AudioConstraints,
    stream: Mutex<Option<LocalAudioStream>>,
    acquiring: tokio::sync::Mutex<()>,
    muted: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl LocalMediaController {
    /// Create a controller with no stream
    pub fn new(provider: Arc<dyn MicrophoneProvider>, constraints: AudioConstraints) -> Self {
        Self {
            provider,
            constraints,
            stream: Mutex::new(None),
            acquiring: tokio::sync::Mutex::new(()),
            muted: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    /// Open the microphone unless a stream is already active
    ///
    /// On failure the controller stays without a stream and remembers a
    /// message suitable for showing to the user.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<LocalAudioStream> {
        let _guard = self.acquiring.lock().await;

        if let Some(stream) = self.stream() {
            return Ok(stream);
        }

        match self.provider.open(&self.constraints).await {
            Ok(stream) => {
                stream.set_enabled(!self.is_muted());
                info!(
                    "Microphone acquired: stream {} with {} track(s)",
                    stream.id(),
                    stream.tracks().len()
                );
                *self.stream.lock() = Some(stream.clone());
                *self.last_error.lock() = None;
                Ok(stream)
            }
            Err(e) => {
                let message = format!("Could not access microphone: {}", e);
                warn!("{}", message);
                *self.last_error.lock() = Some(message.clone());
                Err(Error::MediaAcquisition(message))
            }
        }
    }

    /// Stop and discard the stream
    pub fn release(&self) {
        if let Some(stream) = self.stream.lock().take() {
            stream.stop();
            info!("Microphone released: stream {}", stream.id());
        }
    }

    /// Enable or disable the audio tracks. Never renegotiates.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
        if let Some(stream) = self.stream.lock().as_ref() {
            stream.set_enabled(!muted);
        }
        debug!("Microphone {}", if muted { "muted" } else { "unmuted" });
    }

    /// Whether the tracks are disabled
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// The active stream, if any
    pub fn stream(&self) -> Option<LocalAudioStream> {
        self.stream.lock().clone()
    }

    /// User-facing message from the last failed acquisition
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingMicrophone {
        opened: AtomicU32,
    }

    #[async_trait]
    impl MicrophoneProvider for CountingMicrophone {
        async fn open(&self, constraints: &AudioConstraints) -> Result<LocalAudioStream> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            OpusMicrophone::mono().open(constraints).await
        }
    }

    struct DeniedMicrophone;

    #[async_trait]
    impl MicrophoneProvider for DeniedMicrophone {
        async fn open(&self, _constraints: &AudioConstraints) -> Result<LocalAudioStream> {
            Err(Error::MediaAcquisition("permission denied".to_string()))
        }
    }

    #[tokio::test]
    async fn test_acquire_is_not_repeated_while_active() {
        let mic = Arc::new(CountingMicrophone {
            opened: AtomicU32::new(0),
        });
        let controller = LocalMediaController::new(mic.clone(), AudioConstraints::default());

        let first = controller.acquire().await.unwrap();
        let second = controller.acquire().await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(mic.opened.load(Ordering::SeqCst), 1);

        controller.release();
        assert!(controller.stream().is_none());
        assert!(first.tracks()[0].is_stopped());

        controller.acquire().await.unwrap();
        assert_eq!(mic.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_denied_microphone_leaves_no_stream() {
        let controller =
            LocalMediaController::new(Arc::new(DeniedMicrophone), AudioConstraints::default());

        let err = controller.acquire().await.unwrap_err();
        assert!(err.is_user_visible());
        assert!(controller.stream().is_none());
        assert!(controller
            .last_error()
            .unwrap()
            .contains("permission denied"));
    }

    #[tokio::test]
    async fn test_mute_toggles_tracks_and_survives_reacquire() {
        let controller = LocalMediaController::new(
            Arc::new(OpusMicrophone::mono()),
            AudioConstraints::default(),
        );
        let stream = controller.acquire().await.unwrap();
        assert!(stream.tracks()[0].is_enabled());

        controller.set_muted(true);
        assert!(!stream.tracks()[0].is_enabled());

        controller.release();
        let stream = controller.acquire().await.unwrap();
        assert!(!stream.tracks()[0].is_enabled());

        controller.set_muted(false);
        assert!(stream.tracks()[0].is_enabled());
    }

    #[tokio::test]
    async fn test_muted_samples_are_dropped_and_stopped_track_errors() {
        let stream = OpusMicrophone::mono()
            .open(&AudioConstraints::default())
            .await
            .unwrap();
        let track = &stream.tracks()[0];

        track.set_enabled(false);
        assert!(track.write_sample(&Sample::default()).await.is_ok());

        track.stop();
        assert!(matches!(
            track.write_sample(&Sample::default()).await,
            Err(Error::MediaTrackError(_))
        ));
    }
}
