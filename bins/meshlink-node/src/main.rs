//! Meshlink Node Daemon
//!
//! Logs in to the coordinator, hands the UDP socket to the mux, and keeps
//! long-polling for peer-set updates which are reconciled into per-peer
//! sessions. The inbound data channel is wired to a demo echo until a
//! tunnel device takes its place.

mod client;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use meshlink_net::mux::DEFAULT_STUN_SERVER;
use meshlink_net::{Conn, Mux};
use meshlink_types::{PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use client::{ControlClient, PollOutcome};

/// Pause after a failed poll round before retrying
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Meshlink node daemon
#[derive(Parser)]
#[command(name = "meshlink-node")]
#[command(author, version, about)]
struct Cli {
    /// Hostname to register with the coordinator
    #[arg(long, default_value = "node")]
    hostname: String,

    /// Coordinator base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Node key file; generated on first run
    #[arg(long, default_value = "./meshlink/node_key")]
    key_file: PathBuf,

    /// Provisioning secret presented on first login
    #[arg(long, default_value = "please")]
    provision_key: String,

    /// STUN server for reflexive address discovery
    #[arg(long, default_value = DEFAULT_STUN_SERVER)]
    stun_server: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    private_key: PrivateKey,
}

/// Load the node key from disk, generating and best-effort persisting one
/// when missing
fn load_or_generate_key(path: &PathBuf) -> PrivateKey {
    if let Ok(raw) = std::fs::read(path) {
        match serde_json::from_slice::<KeyFile>(&raw) {
            Ok(file) if !file.private_key.is_zero() => return file.private_key,
            _ => warn!(path = %path.display(), "ignoring invalid node key file"),
        }
    }

    let key = PrivateKey::generate();
    let file = KeyFile {
        private_key: key.clone(),
    };
    let written = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|_| std::fs::write(path, serde_json::to_vec(&file).unwrap_or_default()));
    if let Err(err) = written {
        warn!(error = %err, "could not persist node key, running with an ephemeral key");
    }
    key
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut quit = signal(SignalKind::quit()).expect("install SIGQUIT handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
            _ = quit.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = cli.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let private_key = load_or_generate_key(&cli.key_file);
    let public_key = private_key.public();
    info!(key = %public_key, "node identity ready");

    let client = ControlClient::new(&cli.server, public_key)?;
    match client.control_key().await {
        Ok(control_key) => info!(%control_key, "coordinator identity"),
        Err(err) => warn!(error = %err, "could not fetch coordinator key"),
    }

    let config = client
        .login(&cli.hostname, &cli.provision_key)
        .await
        .context("login failed")?;
    info!(
        id = config.id,
        tunnel_ip = %config.tunnel_ip,
        prefix = %config.prefix,
        "logged in to coordinator"
    );

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("binding data socket")?;
    let (mux, mut inbound) = Mux::new(
        config.id,
        public_key,
        socket,
        &cli.server,
        &cli.stun_server,
    )
    .await
    .context("starting mux")?;

    // peer_id -> session, shared between the poll loop and the echo task
    let conns: Arc<Mutex<HashMap<u64, Arc<Conn>>>> = Arc::new(Mutex::new(HashMap::new()));

    // demo upstream: echo every payload back to its sender
    let echo_conns = Arc::clone(&conns);
    tokio::spawn(async move {
        while let Some(packet) = inbound.recv().await {
            debug!(peer = packet.peer_id, len = packet.payload.len(), "received from peer");
            let conn = echo_conns
                .lock()
                .expect("conn map lock poisoned")
                .get(&packet.peer_id)
                .cloned();
            if let Some(conn) = conn {
                conn.write(&packet.payload).await;
            }
        }
    });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut peer_keys: HashMap<u64, PublicKey> = HashMap::new();
    loop {
        let outcome = tokio::select! {
            _ = &mut shutdown => break,
            outcome = client.poll() => outcome,
        };

        match outcome {
            Ok(PollOutcome::Peers(peers)) => {
                info!(count = peers.len(), "received peer update");
                reconcile(&mux, &conns, &mut peer_keys, peers);
            }
            Ok(PollOutcome::NoChange) => {}
            Ok(PollOutcome::KeyExpired) => {
                warn!("node key expired, stopping");
                break;
            }
            Err(err) => {
                warn!(error = %err, "poll failed");
                tokio::time::sleep(POLL_RETRY_DELAY).await;
            }
        }
    }

    info!("shutting down");
    mux.close();
    Ok(())
}

/// Apply a peer snapshot to the mux: create missing sessions, rotate keys
/// detected by peer id, and drop sessions for peers that vanished
fn reconcile(
    mux: &Arc<Mux>,
    conns: &Arc<Mutex<HashMap<u64, Arc<Conn>>>>,
    peer_keys: &mut HashMap<u64, PublicKey>,
    peers: Vec<meshlink_types::api::RemotePeer>,
) {
    let mut seen: HashMap<u64, PublicKey> = HashMap::new();

    for peer in peers {
        seen.insert(peer.id, peer.public_key);

        match peer_keys.get(&peer.id) {
            Some(known) if *known == peer.public_key => continue,
            Some(old_key) => {
                info!(peer = peer.id, "peer key rotated, replacing session");
                mux.remove_conn(old_key);
            }
            None => {}
        }

        match mux.get_conn(peer.id, peer.public_key) {
            Ok(conn) => {
                conns
                    .lock()
                    .expect("conn map lock poisoned")
                    .insert(peer.id, conn);
                peer_keys.insert(peer.id, peer.public_key);
            }
            Err(err) => warn!(peer = peer.id, error = %err, "could not create session"),
        }
    }

    // sessions for peers no longer in the snapshot
    let vanished: Vec<(u64, PublicKey)> = peer_keys
        .iter()
        .filter(|(id, _)| !seen.contains_key(id))
        .map(|(id, key)| (*id, *key))
        .collect();
    for (id, key) in vanished {
        info!(peer = id, "peer left the overlay, removing session");
        mux.remove_conn(&key);
        peer_keys.remove(&id);
        conns.lock().expect("conn map lock poisoned").remove(&id);
    }
}
