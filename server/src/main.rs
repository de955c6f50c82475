//! The MNAT assignment server.
//!
//! Serves the `ietf-mnat` endpoint surface over HTTP/2 + TLS and owns the
//! assignment engine behind a single process-wide mutex.

mod assignments;
mod pool;
mod pool_config;
mod tls;
mod web;

use anyhow::{Context as _, Result};
use clap::Parser;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use parking_lot::Mutex;
use rand::SeedableRng as _;
use rand::rngs::StdRng;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path of the pool definition file.
    #[arg(long, env = "MNAT_POOL", default_value = "/etc/mnat/pool.json")]
    pool_config: PathBuf,

    /// Log pool config violations instead of failing the load.
    #[arg(long)]
    lenient_pool: bool,

    #[arg(long, default_value = "0.0.0.0")]
    listen_addr: IpAddr,

    #[arg(short, long, default_value_t = 443)]
    port: u16,

    /// Server certificate PEM; also holds the private key unless --key is given.
    #[arg(long)]
    cert: PathBuf,

    /// Private key PEM, if kept separate from --cert.
    #[arg(long)]
    key: Option<PathBuf>,

    /// CA used to verify client certificates; enables mutual TLS.
    #[arg(long)]
    cacert: Option<PathBuf>,
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

    let mode = if cli.lenient_pool {
        pool_config::Mode::Lenient
    } else {
        pool_config::Mode::Strict
    };
    let pool = pool_config::load(&cli.pool_config, mode)
        .with_context(|| format!("Failed to load pool config `{}`", cli.pool_config.display()))?;

    tracing::info!(sg_count = %pool.sg_count(), "Loaded local pool");

    let engine = Arc::new(Mutex::new(assignments::Assignments::new(
        pool,
        StdRng::from_entropy(),
    )));
    let router = web::router(engine);

    let tls_config = tls::server_config(&cli.cert, cli.key.as_deref(), cli.cacert.as_deref())?;
    let acceptor = TlsAcceptor::from(tls_config);

    let listener = TcpListener::bind((cli.listen_addr, cli.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", cli.listen_addr, cli.port))?;

    tracing::info!(addr = %cli.listen_addr, port = cli.port, "Listening for HTTP/2 connections");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted.context("Failed to accept connection")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                return Ok(());
            }
        };

        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(router.clone());

        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    tracing::debug!(%peer, "TLS handshake failed: {e}");
                    return;
                }
            };

            if let Err(e) = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                tracing::debug!(%peer, "Connection ended: {e}");
            }
        });
    }
}
