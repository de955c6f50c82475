//! Supervision of one translator child process per active mapping.
//!
//! A [`TranslateManager`] owns the lifecycle of the `mnat-translate` child
//! for a single global (S,G). Spawning is abstracted behind [`Spawn`] so the
//! reconciliation logic can be tested without forking processes.

use anyhow::{Context as _, Result};
use mnat_model::{LocalMapping, Mapping};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Which side of the NAT the translator writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ingress: rewrite global traffic onto the locally assigned (S,G).
    ToLocal,
    /// Egress: rewrite locally assigned traffic back onto the global (S,G).
    ToGlobal,
}

/// Grace period between asking a child to stop and force-killing it.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Inactivity timeout handed to spawned translators; our liveness pings
/// arrive every poll cycle, well inside this.
const CHILD_TIMEOUT_SECS: u32 = 100;

/// Everything needed to launch one translator child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateInvocation {
    pub iface_in: String,
    pub iface_out: String,
    pub src_in: IpAddr,
    pub grp_in: IpAddr,
    pub src_out: IpAddr,
    pub grp_out: IpAddr,
    pub no_join: bool,
}

#[async_trait::async_trait]
pub trait TranslatorChild: Send {
    /// Liveness ping; resets the child's inactivity timer.
    fn refresh(&mut self);

    /// Graceful stop: ask, wait [`STOP_GRACE`], then force-kill.
    async fn stop(&mut self);
}

pub trait Spawn: Send + Sync {
    fn spawn(&self, invocation: TranslateInvocation) -> Result<Box<dyn TranslatorChild>>;
}

/// Spawns real `mnat-translate` child processes.
pub struct ProcessSpawner {
    translate_bin: PathBuf,
}

impl ProcessSpawner {
    pub fn new(translate_bin: PathBuf) -> Self {
        Self { translate_bin }
    }
}

impl Spawn for ProcessSpawner {
    fn spawn(&self, invocation: TranslateInvocation) -> Result<Box<dyn TranslatorChild>> {
        let mut cmd = tokio::process::Command::new(&self.translate_bin);
        cmd.arg("--iface-in")
            .arg(&invocation.iface_in)
            .arg("--iface-out")
            .arg(&invocation.iface_out)
            .arg("--src-in")
            .arg(invocation.src_in.to_string())
            .arg("--grp-in")
            .arg(invocation.grp_in.to_string())
            .arg("--src-out")
            .arg(invocation.src_out.to_string())
            .arg("--grp-out")
            .arg(invocation.grp_out.to_string())
            .arg("--timeout")
            .arg(CHILD_TIMEOUT_SECS.to_string());
        if invocation.no_join {
            cmd.arg("--no-join");
        }
        cmd.kill_on_drop(true);

        tracing::info!(?cmd, "Launching translator");

        let child = cmd.spawn().context("Failed to spawn translator")?;

        Ok(Box::new(ProcessChild { child }))
    }
}

struct ProcessChild {
    child: tokio::process::Child,
}

impl ProcessChild {
    fn signal(&self, signal: Signal) {
        let Some(pid) = self.child.id() else {
            // Already reaped.
            return;
        };

        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), signal) {
            tracing::warn!(%pid, %signal, "Failed to signal translator: {e}");
        }
    }
}

#[async_trait::async_trait]
impl TranslatorChild for ProcessChild {
    fn refresh(&mut self) {
        self.signal(Signal::SIGUSR1);
    }

    async fn stop(&mut self) {
        self.signal(Signal::SIGHUP);

        match tokio::time::timeout(STOP_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(%status, "Translator exited");
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to wait for translator: {e}");
            }
            Err(_elapsed) => {
                tracing::warn!("Hard-stopping translator");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Owns one mapping and the translator child (if any) serving it.
pub struct TranslateManager {
    mapping: Mapping,
    direction: Direction,
    in_interface: Option<String>,
    out_interface: Option<String>,
    no_join: bool,
    spawner: Arc<dyn Spawn>,
    child: Option<Box<dyn TranslatorChild>>,
}

impl TranslateManager {
    pub fn new(
        mapping: Mapping,
        direction: Direction,
        in_interface: Option<String>,
        out_interface: Option<String>,
        no_join: bool,
        spawner: Arc<dyn Spawn>,
    ) -> Self {
        Self {
            mapping,
            direction,
            in_interface,
            out_interface,
            no_join,
            spawner,
            child: None,
        }
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn has_child(&self) -> bool {
        self.child.is_some()
    }

    pub fn start(&mut self) {
        if self.child.is_some() {
            tracing::warn!(mapping = %self.mapping, "Tried to start an already-started translator");
            return;
        }

        let (Some(in_interface), Some(out_interface)) =
            (self.in_interface.clone(), self.out_interface.clone())
        else {
            tracing::warn!(mapping = %self.mapping, "Not starting translator without in and out interfaces");
            return;
        };

        // The ASM case leaves the source untouched: receivers of an
        // any-source group don't filter on it.
        let (local_src, local_grp) = match self.mapping.local {
            LocalMapping::Unassigned => {
                tracing::info!(mapping = %self.mapping, "Not starting translator without an assignment");
                return;
            }
            LocalMapping::Assigned { source, group } => (source, group),
            LocalMapping::AssignedAsm { group } => (self.mapping.sg.source(), group),
        };

        let (src_in, grp_in, src_out, grp_out) = match self.direction {
            Direction::ToLocal => (
                self.mapping.sg.source(),
                self.mapping.sg.group(),
                local_src,
                local_grp,
            ),
            Direction::ToGlobal => (
                local_src,
                local_grp,
                self.mapping.sg.source(),
                self.mapping.sg.group(),
            ),
        };

        tracing::info!(mapping = %self.mapping, "Starting translator");

        match self.spawner.spawn(TranslateInvocation {
            iface_in: in_interface,
            iface_out: out_interface,
            src_in,
            grp_in,
            src_out,
            grp_out,
            no_join: self.no_join,
        }) {
            Ok(child) => self.child = Some(child),
            Err(e) => tracing::warn!(mapping = %self.mapping, "Failed to start translator: {e:#}"),
        }
    }

    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            tracing::info!(mapping = %self.mapping, "Stopping translator without a process");
            return;
        };

        tracing::info!(mapping = %self.mapping, "Stopping translator");
        child.stop().await;
    }

    /// Reconciles against a freshly polled mapping for the same global (S,G).
    ///
    /// An unchanged local side means a liveness ping; a changed one means
    /// stop-then-start so two translators for the same channel never overlap.
    pub async fn check_for_update(&mut self, mapping: Mapping) {
        if self.mapping.sg != mapping.sg {
            tracing::error!(
                current = %self.mapping.sg,
                polled = %mapping.sg,
                "Internal error: translator update for an inconsistent (S,G)"
            );
            return;
        }

        if self.mapping.local == mapping.local {
            if let Some(child) = &mut self.child {
                tracing::debug!(mapping = %self.mapping, "Mapping stayed stable, refreshing");
                child.refresh();
            } else {
                // Pending assignment or earlier spawn failure; nothing to ping.
                tracing::debug!(mapping = %self.mapping, "Refreshing translator without a process");
            }
            return;
        }

        tracing::info!(
            sg = %self.mapping.sg,
            from = %self.mapping.local,
            to = %mapping.local,
            "Changing translator assignment"
        );

        self.stop().await;
        self.mapping.local = mapping.local;
        self.start();
    }
}
