//! The MNAT egress node.
//!
//! Watches a file of locally joined (S,G)s, publishes them to the
//! assignment server under a leased watcher identity and runs one
//! translator per assigned mapping, rewriting locally NATted traffic back
//! onto the global channels.

use anyhow::Result;
use clap::Parser;
use h2_session::SessionConfig;
use mnat_client_shared::{ClientConfig, Role};
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// File monitored for the joined (S,G)s, one `source,group` per line;
    /// may change on the fly.
    #[arg(short = 'f', long)]
    control_file: PathBuf,

    /// Hostname of the assignment server.
    #[arg(short, long)]
    server: String,

    #[arg(short, long, default_value_t = 443)]
    port: u16,

    /// CA PEM to verify the server with; system roots if not given.
    #[arg(long)]
    cacert: Option<PathBuf>,

    /// Client certificate PEM (private key included) for mutual TLS.
    #[arg(short, long)]
    cert: Option<PathBuf>,

    /// Receive interface for local-network NATted traffic.
    #[arg(short = 'i', long)]
    interface_in: Option<String>,

    /// Transmit interface for de-NATted global traffic.
    #[arg(short = 'o', long)]
    interface_out: Option<String>,

    /// Translator binary spawned per active mapping.
    #[arg(long, env = "MNAT_TRANSLATE_BIN", default_value = "mnat-translate")]
    translate_bin: PathBuf,

    /// Tell translators not to issue upstream joins.
    #[arg(long)]
    no_join: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    let config = ClientConfig {
        session: SessionConfig {
            server: cli.server,
            port: cli.port,
            ca_cert: cli.cacert,
            client_cert: cli.cert,
        },
        role: Role::Egress {
            join_file: cli.control_file,
        },
        in_interface: cli.interface_in,
        out_interface: cli.interface_out,
        translate_bin: cli.translate_bin,
        no_join: cli.no_join,
    };

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("Received stop signal");
    };

    mnat_client_shared::run(config, shutdown).await
}
