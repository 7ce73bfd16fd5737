//! Meshlink Coordination Server
//!
//! Hosts the coordinator HTTP API, the relay WebSocket endpoint, and the
//! STUN binding responder on one process. Flags override config file
//! values; `--debug` switches to an in-memory store with verbose logs.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use meshlink_control::{config, server, Config, Coordinator, Ipam, MemStore, Relay, SledStore, Store, StunServer};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Meshlink coordination server
#[derive(Parser)]
#[command(name = "meshlink-server")]
#[command(author, version, about)]
struct Cli {
    /// HTTP listen port (overrides config file)
    #[arg(long)]
    http_port: Option<u16>,

    /// STUN listen port (overrides config file)
    #[arg(long)]
    stun_port: Option<u16>,

    /// Debug mode: verbose logs and an in-memory store
    #[arg(long)]
    debug: bool,

    /// Config directory
    #[arg(long, default_value = "./meshlink")]
    config: PathBuf,
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

    let mut conf = Config::load_or_create(&cli.config).context("loading config")?;
    if let Some(port) = cli.http_port {
        conf.http_port = port;
    }
    if let Some(port) = cli.stun_port {
        conf.stun_port = port;
    }
    if cli.debug {
        conf.debug = true;
    }

    let log_level = if conf.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    if conf.debug {
        warn!("server running in debug mode");
    }

    let private_key = config::load_or_generate_key(&cli.config);

    let store: Arc<dyn Store> = if conf.debug {
        Arc::new(MemStore::new())
    } else {
        Arc::new(SledStore::open(&conf.store_path).context("opening store")?)
    };

    let allocated = match store.get_allocated_tunnel_ips().await {
        Ok(ips) => ips,
        Err(err) => {
            warn!(error = %err, "could not read allocated tunnel ips from store");
            Vec::new()
        }
    };
    let ipam = Ipam::new(conf.network_prefix, allocated);

    let coordinator = Arc::new(Coordinator::new(
        store,
        ipam,
        private_key,
        conf.provision_key.clone(),
    ));
    let cleanup = coordinator.spawn_cleanup();

    let relay = Arc::new(Relay::new());
    relay.set_key_verifier(coordinator.key_verifier());

    let stun_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), conf.stun_port);
    let stun = StunServer::bind(stun_addr).await.context("binding stun")?;
    let stun_task = tokio::spawn(async move {
        if let Err(err) = stun.run().await {
            error!(error = %err, "stun server error");
        }
    });

    if !conf.autocert_domain.is_empty() {
        // TLS termination happens in front of this process; the domain is
        // kept in the config for those deployments
        info!(domain = %conf.autocert_domain, "autocert domain configured, serving plain http behind it");
    }

    let http_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), conf.http_port);
    let app = server::app(Arc::clone(&coordinator), Arc::clone(&relay));
    server::serve(http_addr, app, shutdown_signal())
        .await
        .context("http server failed")?;

    info!("shutting down");
    relay.close();
    cleanup.abort();
    stun_task.abort();
    Ok(())
}
