// meshchat for Linux: LAN discovery, peer links, and a terminal chat console.

mod config;
mod console;
mod discovery;
mod identity_store;
mod node;
mod transport;

use anyhow::Context;
use mesh_core::{load_or_create_identity, MeshCore};
use tracing_subscriber::EnvFilter;

use crate::identity_store::FileIdentityStore;
use crate::node::{Node, NodeChannels};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut name_arg = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("mesh-linux {}", VERSION);
                return Ok(());
            }
            "--name" => name_arg = Some(args.next().context("--name needs a value")?),
            other => anyhow::bail!("unknown argument {other:?}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    let store = FileIdentityStore::default_location();
    let name = name_arg
        .or_else(|| cfg.display_name.clone())
        .unwrap_or_else(identity_store::device_name);
    let identity = load_or_create_identity(&store, &name)
        .with_context(|| format!("identity store at {}", store.dir().display()))?;
    tracing::info!(peer = %identity.peer_id(), name = identity.display_name(), "identity loaded");

    let mut core = MeshCore::new(identity);
    // One tick per second.
    core.set_invite_timeout(cfg.invite_timeout_secs.max(1));
    let (node, NodeChannels { events, dials }) = Node::new(core);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        tokio::spawn(node::run_ticker(node.clone()));
        let (disc_node, disc_port, transport_port) =
            (node.clone(), cfg.discovery_port, cfg.transport_port);
        tokio::spawn(async move {
            if let Err(e) = discovery::run_discovery(disc_node, disc_port, transport_port).await {
                tracing::error!(error = %e, "discovery stopped");
            }
        });
        let trans_node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = transport::run_transport(trans_node, transport_port, dials).await {
                tracing::error!(error = %e, "transport stopped");
            }
        });

        if cfg.advertise_on_start {
            node.start_advertising().await;
        }
        if cfg.browse_on_start {
            node.start_browsing().await;
        }

        tokio::select! {
            r = console::run_console(node.clone(), events) => r?,
            r = shutdown_signal() => {
                r?;
                node.disconnect().await;
            }
        }
        anyhow::Ok(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
