//! The watcher client state machine.
//!
//! One session at a time: obtain (or reuse) a watcher identity, publish the
//! subscription set for our role, then run the periodic refresh / poll /
//! watchdog tasks until the session dies. The session is the retry unit;
//! on any failure we tear down and reconnect after a fixed delay while the
//! translator children keep running on their inactivity timers.

use crate::export;
use crate::join_file::{self, JoinFileWatcher};
use crate::mapping_set::MappingSet;
use crate::translate_manager::{Direction, ProcessSpawner, Spawn};
use anyhow::{Context as _, Result, bail};
use h2_session::{Liveness, RECONNECT_DELAY, STALE_ID_AFTER, Session, SessionConfig};
use http::{Method, StatusCode};
use mnat_model::{Mapping, Sg, wire};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_PERIOD: Duration = Duration::from_secs(10);
const WATCHDOG_PERIOD: Duration = Duration::from_secs(3);

pub enum Role {
    /// Publishes the locally joined (S,G)s read from a watched file.
    Egress { join_file: PathBuf },
    /// Monitors every active assignment; optionally exports them to a file.
    Ingress { export_file: Option<PathBuf> },
}

pub struct ClientConfig {
    pub session: SessionConfig,
    pub role: Role,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    /// Path of the translator binary to spawn per active mapping.
    pub translate_bin: PathBuf,
    pub no_join: bool,
}

struct WatcherId {
    id: String,
    refresh_period: Duration,
    /// Last successful refresh (or registration); ids stale for longer than
    /// [`STALE_ID_AFTER`] are discarded instead of reused.
    last_ok: Instant,
}

/// Runs the client until `shutdown` resolves, reconnecting indefinitely.
pub async fn run(config: ClientConfig, shutdown: impl Future<Output = ()>) -> Result<()> {
    let spawner: Arc<dyn Spawn> = Arc::new(ProcessSpawner::new(config.translate_bin.clone()));
    let direction = match config.role {
        Role::Egress { .. } => Direction::ToGlobal,
        Role::Ingress { .. } => Direction::ToLocal,
    };
    let mut mappings = MappingSet::new(
        direction,
        config.in_interface.clone(),
        config.out_interface.clone(),
        config.no_join,
        spawner,
    );

    let mut join_watcher = match &config.role {
        Role::Egress { join_file } => Some(JoinFileWatcher::watch(join_file)?),
        Role::Ingress { .. } => None,
    };

    let mut watcher_id: Option<WatcherId> = None;

    tokio::pin!(shutdown);

    loop {
        if let Some(current) = &watcher_id {
            if current.last_ok.elapsed() > STALE_ID_AFTER {
                tracing::info!(watcher_id = %current.id, "Discarding stale watcher-id");
                watcher_id = None;
            }
        }

        tokio::select! {
            () = &mut shutdown => break,
            res = run_session(&config, &mut watcher_id, &mut mappings, join_watcher.as_mut()) => {
                match res {
                    Ok(()) => break,
                    Err(e) => tracing::warn!("Session ended: {e:#}"),
                }
            }
        }

        tracing::info!("Reconnecting in {}s", RECONNECT_DELAY.as_secs());

        tokio::select! {
            () = &mut shutdown => break,
            () = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }

    tracing::info!("Shutting down, stopping translators");
    mappings.stop_all().await;

    Ok(())
}

async fn run_session(
    config: &ClientConfig,
    watcher_id: &mut Option<WatcherId>,
    mappings: &mut MappingSet,
    mut join_watcher: Option<&mut JoinFileWatcher>,
) -> Result<()> {
    let mut session = Session::connect(&config.session).await?;
    let mut liveness = Liveness::new(Instant::now());

    // A retained id means the server-side watcher should still be alive with
    // its published state; only a fresh registration re-publishes it.
    let mut refresh_period = match watcher_id {
        Some(current) => current.refresh_period,
        None => {
            let fresh = register(&mut session, config).await?;
            liveness.mark_refresh(Instant::now());
            let period = fresh.refresh_period;
            *watcher_id = Some(fresh);
            period
        }
    };

    let mut refresh_timer = new_refresh_timer(refresh_period);
    let mut poll_timer = tokio::time::interval(POLL_PERIOD); // first tick fires at once
    let mut watchdog = tokio::time::interval(WATCHDOG_PERIOD);

    loop {
        tokio::select! {
            _ = refresh_timer.tick() => {
                let Some(id) = watcher_id.as_ref().map(|w| w.id.clone()) else {
                    continue;
                };

                let body = serde_json::to_vec(&wire::RefreshRequest::new(&id))?;
                let response = session
                    .request(Method::POST, "/operations/ietf-mnat:refresh-watcher-id", Some(body.into()))
                    .await?;

                if response.status.is_success() {
                    let now = Instant::now();
                    liveness.mark_refresh(now);
                    if let Some(current) = watcher_id.as_mut() {
                        current.last_ok = now;
                    }
                } else {
                    tracing::warn!(watcher_id = %id, status = %response.status, "Refresh rejected, re-registering");

                    let fresh = register(&mut session, config).await?;
                    liveness.mark_refresh(Instant::now());
                    refresh_period = fresh.refresh_period;
                    *watcher_id = Some(fresh);
                    refresh_timer = new_refresh_timer(refresh_period);
                }
            }
            _ = poll_timer.tick() => {
                let Some(id) = watcher_id.as_ref().map(|w| w.id.clone()) else {
                    continue;
                };

                let response = session
                    .request(
                        Method::GET,
                        &format!("/data/ietf-mnat:assigned-channels/watcher={id}"),
                        None,
                    )
                    .await?;
                liveness.mark_assign_check(Instant::now());

                match parse_poll(response.status, &response.body, &id) {
                    Ok(polled) => {
                        mappings.apply(polled).await;

                        if let Role::Ingress { export_file: Some(path) } = &config.role {
                            export::write_assignments(path, &mappings.active_sgs());
                        }
                    }
                    Err(e) => {
                        tracing::warn!(watcher_id = %id, "Failed check of assigned-channels, getting a new id: {e:#}");

                        let fresh = register(&mut session, config).await?;
                        liveness.mark_refresh(Instant::now());
                        refresh_period = fresh.refresh_period;
                        *watcher_id = Some(fresh);
                        refresh_timer = new_refresh_timer(refresh_period);
                    }
                }
            }
            _ = watchdog.tick() => {
                if let Some(reason) = liveness.check_dead(Instant::now()) {
                    bail!("Session is dead ({reason})");
                }
            }
            Some(sgs) = next_join_update(&mut join_watcher) => {
                if let Some(current) = watcher_id.as_ref() {
                    tracing::info!(count = sgs.len(), "Join file changed, publishing");
                    publish_joined(&mut session, &current.id, &sgs, true).await?;
                }
            }
        }
    }
}

fn new_refresh_timer(period: Duration) -> tokio::time::Interval {
    // Unlike the poll timer, the first refresh is one full period out.
    tokio::time::interval_at(tokio::time::Instant::now() + period, period)
}

async fn next_join_update(watcher: &mut Option<&mut JoinFileWatcher>) -> Option<Vec<Sg>> {
    match watcher {
        Some(watcher) => watcher.changed().await,
        None => std::future::pending().await,
    }
}

/// Obtains a fresh watcher-id and publishes the role's subscription state
/// under it.
async fn register(session: &mut Session, config: &ClientConfig) -> Result<WatcherId> {
    let response = session
        .request(Method::POST, "/operations/ietf-mnat:get-new-watcher-id", None)
        .await?;
    if !response.status.is_success() {
        bail!("get-new-watcher-id failed with status {}", response.status);
    }

    let reply = serde_json::from_slice::<wire::WatcherIdReply>(&response.body)
        .context("Failed to parse get-new-watcher-id reply")?;
    let refresh_period = Duration::from_secs(reply.refresh_period.max(1));

    tracing::info!(watcher_id = %reply.watcher_id, refresh_period_secs = refresh_period.as_secs(), "Obtained watcher-id");

    match &config.role {
        Role::Egress { join_file } => {
            publish_joined(session, &reply.watcher_id, &[], false).await?;

            if join_file.is_file() {
                if let Some(sgs) = join_file::read_join_file(join_file) {
                    publish_joined(session, &reply.watcher_id, &sgs, true).await?;
                }
            }
        }
        Role::Ingress { export_file: _ } => {
            let body = serde_json::to_vec(&wire::MonitorPublish::all_sources(&reply.watcher_id))?;
            let response = session
                .request(Method::POST, "/data/ietf-mnat:ingress-watching", Some(body.into()))
                .await?;

            if !response.status.is_success() {
                tracing::warn!(status = %response.status, "Failed to publish monitors");
            }
        }
    }

    Ok(WatcherId {
        id: reply.watcher_id,
        refresh_period,
        last_ok: Instant::now(),
    })
}

async fn publish_joined(
    session: &mut Session,
    watcher_id: &str,
    sgs: &[Sg],
    replace: bool,
) -> Result<()> {
    let body = serde_json::to_vec(&wire::JoinedPublish::new(watcher_id, sgs.iter().copied()))?;

    let (method, path) = if replace {
        (
            Method::PUT,
            format!("/data/ietf-mnat:egress-global-joined/watcher={watcher_id}"),
        )
    } else {
        (Method::POST, "/data/ietf-mnat:egress-global-joined".to_owned())
    };

    let response = session.request(method, &path, Some(body.into())).await?;

    if !response.status.is_success() {
        tracing::warn!(status = %response.status, "Failed to publish joined (S,G)s");
    }

    Ok(())
}

fn parse_poll(status: StatusCode, body: &[u8], expected_id: &str) -> Result<Vec<Mapping>> {
    if !status.is_success() {
        bail!("assigned-channels returned status {status}");
    }

    let channels = serde_json::from_slice::<wire::AssignedChannels>(body)?;
    let view = channels
        .watcher
        .first()
        .context("Empty watcher list in assigned-channels")?;

    if view.id != expected_id {
        bail!("Watcher id mismatch: got `{}`, expected `{expected_id}`", view.id);
    }

    view.mapped_sg
        .iter()
        .map(|m| m.to_mapping().map_err(anyhow::Error::from))
        .collect()
}
