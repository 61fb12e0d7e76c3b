//! Local mesh demo
//!
//! Runs several participants of one call inside a single process, using the
//! in-memory call store for signaling and loopback transports for media.
//!
//! # Usage
//!
//! ```bash
//! # Four participants, print the peer tables once the mesh is up
//! cargo run --bin mesh_call -- --participants 4
//!
//! # Let the last participant leave and watch the others drop it
//! RUST_LOG=ephemeral_webrtc=debug cargo run --bin mesh_call -- --leave
//! ```
//!
//! ICE servers are read from the `MESH_*` environment variables described
//! on [`CallConfig::from_env`].

use anyhow::{bail, Context};
use clap::Parser;
use ephemeral_webrtc::backend::{CallOptions, MemoryBackend};
use ephemeral_webrtc::{
    CallConfig, CallSession, LoopbackNetwork, OpusMicrophone, PeerPhase, RetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Full-mesh call demo
///
/// Joins N participants to one in-memory call and waits for every pair to
/// exchange audio.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of participants to join
    #[arg(short, long, default_value_t = 3, env = "MESH_PARTICIPANTS")]
    participants: u32,

    /// Have the last participant leave once the mesh is connected
    #[arg(long, default_value_t = false)]
    leave: bool,

    /// Seconds to wait for the mesh to converge
    #[arg(long, default_value_t = 10, env = "MESH_TIMEOUT_SECS")]
    timeout_secs: u64,

    /// Delay before an ICE restart, in milliseconds
    #[arg(long, default_value_t = 200)]
    ice_restart_delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        participants = args.participants,
        "Mesh call demo starting"
    );

    if args.participants < 2 {
        bail!("a mesh needs at least two participants");
    }

    let config = CallConfig::from_env()
        .with_max_call_participants(args.participants)
        .with_ice_restart_delay(Duration::from_millis(args.ice_restart_delay_ms))
        .with_join_retry(RetryPolicy::none());
    config.validate().context("invalid call configuration")?;

    let backend = MemoryBackend::new();
    let network = LoopbackNetwork::new();
    let call_id = backend.create_call(CallOptions {
        max_participants: args.participants,
    });
    info!("Created call {}", call_id);

    let mut sessions = Vec::new();
    for n in 0..args.participants {
        let name = format!("participant-{}", n + 1);
        let session = CallSession::join(
            Arc::new(backend.clone()),
            call_id.clone(),
            &name,
            config.clone(),
            Arc::new(network.clone()),
            Arc::new(OpusMicrophone::mono()),
        )
        .await
        .with_context(|| format!("{} failed to join", name))?;
        sessions.push(session);
        // distinct join timestamps keep initiator selection deterministic
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let timeout = Duration::from_secs(args.timeout_secs);
    let started = Instant::now();
    wait_for(timeout, || mesh_connected(&sessions))
        .await
        .context("mesh did not converge")?;
    info!(
        "Mesh of {} connected in {:?}",
        sessions.len(),
        started.elapsed()
    );
    print_peer_tables(&sessions);

    if args.leave {
        if let Some(leaving) = sessions.pop() {
            let gone = leaving.local_id().clone();
            leaving.leave().await.context("leave failed")?;
            info!("{} left", gone);

            wait_for(timeout, || {
                sessions
                    .iter()
                    .all(|s| s.peers().iter().all(|p| p.remote != gone))
            })
            .await
            .context("departure was not observed by every participant")?;
            print_peer_tables(&sessions);
        }
    }

    for session in &sessions {
        session.leave().await?;
    }
    info!("Mesh call demo finished");
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

fn mesh_connected(sessions: &[CallSession]) -> bool {
    let expected = sessions.len() - 1;
    sessions.iter().all(|s| {
        let peers = s.peers();
        peers.len() == expected && peers.iter().all(|p| p.phase == PeerPhase::Connected)
    })
}

async fn wait_for<F>(timeout: Duration, mut condition: F) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            bail!("timed out after {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

fn print_peer_tables(sessions: &[CallSession]) {
    for session in sessions {
        println!(
            "{} [{}] connected for {:?}",
            session.local_id(),
            *session.status().borrow(),
            session.call_duration()
        );
        for peer in session.peers() {
            let tracks = peer.remote_media.as_ref().map_or(0, |m| m.tracks.len());
            println!(
                "  -> {:<40} {:<14} initiator={:<5} gen={} tracks={}",
                peer.remote.to_string(),
                format!("{:?}", peer.phase),
                peer.initiator,
                peer.connection,
                tracks
            );
        }
    }
}
