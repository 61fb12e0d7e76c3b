//! webrtc-rs peer connection transport
//!
//! webrtc-rs cannot apply a rollback description, so this transport reports
//! no rollback support and the mesh replaces the connection instead.

use super::quality::TransportStats;
use super::transport::{
    IceState, PeerEventKind, PeerEventSink, PeerTransport, RemoteTrack, SignalingState,
    TransportFactory, TransportState,
};
use crate::config::{BundlePolicy, CallConfig, RtcpMuxPolicy};
use crate::media::LocalAudioStream;
use crate::participant::ParticipantId;
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::{StatsReport, StatsReportType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Transport backed by a native `RTCPeerConnection`
pub struct RtcPeerTransport {
    remote: ParticipantId,
    peer_connection: Arc<RTCPeerConnection>,
    audio_senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

impl RtcPeerTransport {
    /// Create a peer connection toward `remote` and wire its callbacks into `events`
    #[instrument(skip(config, events), fields(remote = %remote))]
    pub async fn new(
        remote: ParticipantId,
        config: &CallConfig,
        events: PeerEventSink,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_configuration(config))
                .await
                .map_err(|e| {
                    Error::WebRtcError(format!("Failed to create peer connection: {}", e))
                })?,
        );

        register_handlers(&peer_connection, &events);

        info!("Created peer connection toward {}", remote);

        Ok(Self {
            remote,
            peer_connection,
            audio_senders: Mutex::new(Vec::new()),
        })
    }

    /// Underlying native connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

fn rtc_configuration(config: &CallConfig) -> RTCConfiguration {
    let ice_servers = config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
        }))
        .collect();

    RTCConfiguration {
        ice_servers,
        bundle_policy: match config.bundle_policy {
            BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
            BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
            BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
        },
        rtcp_mux_policy: match config.rtcp_mux_policy {
            RtcpMuxPolicy::Negotiate => RTCRtcpMuxPolicy::Negotiate,
            RtcpMuxPolicy::Require => RTCRtcpMuxPolicy::Require,
        },
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        ..Default::default()
    }
}

fn register_handlers(pc: &Arc<RTCPeerConnection>, events: &PeerEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            // None marks the end of gathering.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.emit(PeerEventKind::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => warn!("Failed to serialize local candidate for {}: {}", sink.peer(), e),
            }
        })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            let state = match s {
                RTCPeerConnectionState::New => TransportState::New,
                RTCPeerConnectionState::Connecting => TransportState::Connecting,
                RTCPeerConnectionState::Connected => TransportState::Connected,
                RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                RTCPeerConnectionState::Failed => TransportState::Failed,
                RTCPeerConnectionState::Closed => TransportState::Closed,
                _ => return,
            };
            debug!("Peer {} connection state: {:?}", sink.peer(), state);
            sink.emit(PeerEventKind::ConnectionState(state));
        })
    }));

    let sink = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            let state = match s {
                RTCIceConnectionState::New => IceState::New,
                RTCIceConnectionState::Checking => IceState::Checking,
                RTCIceConnectionState::Connected => IceState::Connected,
                RTCIceConnectionState::Completed => IceState::Completed,
                RTCIceConnectionState::Disconnected => IceState::Disconnected,
                RTCIceConnectionState::Failed => IceState::Failed,
                RTCIceConnectionState::Closed => IceState::Closed,
                _ => return,
            };
            debug!("Peer {} ICE state: {:?}", sink.peer(), state);
            sink.emit(PeerEventKind::IceConnectionState(state));
        })
    }));

    let sink = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(PeerEventKind::NegotiationNeeded);
        })
    }));

    let sink = events.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>,
                                    _receiver: Arc<RTCRtpReceiver>,
                                    _transceiver: Arc<RTCRtpTransceiver>| {
        let sink = sink.clone();
        Box::pin(async move {
            info!(
                "Remote track from {}: id={}, kind={}",
                sink.peer(),
                track.id(),
                track.kind()
            );
            sink.emit(PeerEventKind::RemoteTrack(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind: track.kind().to_string(),
                source: Some(track),
            }));
        })
    }));
}

fn to_native(desc: SessionDescription) -> Result<RTCSessionDescription> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e))),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e))),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse pranswer: {}", e))),
        SdpKind::Rollback => Err(Error::SdpError(
            "rollback descriptions are not supported by webrtc-rs".to_string(),
        )),
    }
}

/// Reduce a native stats report to the metrics the mesh grades
///
/// RTT comes from the nominated candidate pair, falling back to the
/// remote-inbound report; loss is relative to outbound audio packets.
fn stats_from_report(report: &StatsReport) -> TransportStats {
    let mut pair_rtt = None;
    let mut remote_rtt = None;
    let mut packets_sent: u64 = 0;
    let mut packets_lost: i64 = 0;

    for stat in report.reports.values() {
        match stat {
            StatsReportType::CandidatePair(pair) if pair.nominated => {
                pair_rtt = Some(pair.current_round_trip_time);
            }
            StatsReportType::OutboundRTP(rtp) if rtp.kind == "audio" => {
                packets_sent += rtp.packets_sent;
            }
            StatsReportType::RemoteInboundRTP(remote) if remote.kind == "audio" => {
                packets_lost += remote.packets_lost;
                if remote.round_trip_time.is_some() {
                    remote_rtt = remote.round_trip_time;
                }
            }
            _ => {}
        }
    }

    let packets_lost = packets_lost.max(0) as u64;
    let packet_loss_percent = if packets_sent > 0 {
        packets_lost as f64 / packets_sent as f64 * 100.0
    } else {
        0.0
    };

    TransportStats {
        rtt_ms: pair_rtt.or(remote_rtt).unwrap_or(0.0) * 1000.0,
        packet_loss_percent,
        jitter_ms: 0.0,
        packets_sent,
        packets_lost,
    }
}

fn from_native(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        other => {
            return Err(Error::SdpError(format!(
                "Unexpected description type {:?}",
                other
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    fn signaling_state(&self) -> SignalingState {
        match self.peer_connection.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = self
            .peer_connection
            .create_offer(options)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        debug!(
            "Created SDP offer for peer {} (ice_restart={})",
            self.remote, ice_restart
        );
        from_native(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        debug!("Created SDP answer for peer {}", self.remote);
        from_native(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_native(desc)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        debug!("Setting remote description for peer {}", self.remote);
        self.peer_connection
            .set_remote_description(to_native(desc)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    fn supports_rollback(&self) -> bool {
        false
    }

    async fn rollback(&self) -> Result<()> {
        Err(Error::InvalidSignalingState(format!(
            "rollback is not supported on the connection to {} ({:?})",
            self.remote,
            self.signaling_state()
        )))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        debug!(
            "Adding ICE candidate for peer {}: {}",
            self.remote, candidate.candidate
        );

        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    fn has_audio_sender(&self) -> bool {
        !self.audio_senders.lock().is_empty()
    }

    async fn add_local_audio(&self, stream: &LocalAudioStream) -> Result<()> {
        for track in stream.tracks() {
            let sender = self
                .peer_connection
                .add_track(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| {
                    Error::MediaTrackError(format!("Failed to add audio track: {}", e))
                })?;
            self.audio_senders.lock().push(sender);
        }

        debug!(
            "Attached stream {} ({} track(s)) to peer {}",
            stream.id(),
            stream.tracks().len(),
            self.remote
        );
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        let report = self.peer_connection.get_stats().await;
        Ok(stats_from_report(&report))
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection for peer {}", self.remote);
        self.audio_senders.lock().clear();
        self.peer_connection.close().await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to close connection: {}", e))
        })
    }
}

/// Creates [`RtcPeerTransport`]s from a [`CallConfig`]
#[derive(Debug, Clone)]
pub struct RtcTransportFactory {
    config: CallConfig,
}

impl RtcTransportFactory {
    /// Factory using the ICE and media policies of `config`
    pub fn new(config: CallConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        _local: &ParticipantId,
        remote: &ParticipantId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = RtcPeerTransport::new(remote.clone(), &self.config, events).await?;
        Ok(Arc::new(transport))
    }
}
