//! UDP multicast NAT translator child.
//!
//! Rewrites UDP packets seen as `--src-in -> --grp-in` on `--iface-in` into
//! `--src-out -> --grp-out` on `--iface-out`, keeping a source-specific join
//! alive via the join helper unless told otherwise. Runs until signalled or
//! until no liveness ping (SIGUSR1) arrives within `--timeout` seconds.

mod capture;
mod join;
mod pipeline;

use anyhow::{Context as _, Result};
use capture::{Capture, Inject, InputFilter};
use clap::Parser;
use ip_translate::Translator;
use pipeline::LoopState;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Interface the input channel arrives on.
    #[arg(long)]
    iface_in: String,

    /// Interface rewritten packets are emitted on.
    #[arg(long)]
    iface_out: String,

    #[arg(long)]
    src_in: IpAddr,

    #[arg(long)]
    grp_in: IpAddr,

    #[arg(long)]
    src_out: IpAddr,

    #[arg(long)]
    grp_out: IpAddr,

    /// Exit if no SIGUSR1 is received within this many seconds; 0 disables.
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// Skip the join helper; the upstream join is handled another way.
    #[arg(long)]
    no_join: bool,

    /// Join helper command.
    #[arg(long, env = "MNAT_JOIN_HELPER", default_value = "mcrx-check")]
    join_helper: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!(
        pid = std::process::id(),
        from = %format!("{}->{}", cli.src_in, cli.grp_in),
        to = %format!("{}->{}", cli.src_out, cli.grp_out),
        "Starting translator"
    );

    let translator = Translator::new(cli.src_in, cli.grp_in, cli.src_out, cli.grp_out)
        .context("Invalid translation configuration")?;
    let filter = InputFilter::new(cli.src_in, cli.grp_in);

    let capture = Capture::open(&cli.iface_in, cli.grp_in.is_ipv6())?;
    let inject = Inject::open(&cli.iface_out, cli.grp_out)?;

    let dead_delay = (cli.timeout > 0).then(|| Duration::from_secs(cli.timeout));
    let state = Arc::new(LoopState::new(dead_delay));

    let joined = if cli.no_join {
        None
    } else {
        Some(join::spawn(
            &cli.join_helper,
            &cli.iface_in,
            cli.src_in,
            cli.grp_in,
        )?)
    };

    let mut worker = tokio::task::spawn_blocking({
        let state = state.clone();
        move || {
            let result = pipeline::run(&capture, &inject, &translator, &filter, &state);

            if let Some(joined) = joined {
                joined.leave();
            }

            result
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    let counters = loop {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Stopping on SIGTERM");
                state.request_stop();
            }
            _ = sigint.recv() => {
                tracing::info!("Stopping on SIGINT");
                state.request_stop();
            }
            _ = sighup.recv() => {
                tracing::info!("Stopping on SIGHUP");
                state.request_stop();
            }
            _ = sigusr1.recv() => {
                state.mark_refreshed();
            }
            res = &mut worker => {
                break res.context("Capture loop panicked")??;
            }
        }
    };

    tracing::info!(
        pkts = counters.pkts,
        sent = counters.sent,
        drops = counters.drops,
        "Translator finished"
    );

    Ok(())
}
