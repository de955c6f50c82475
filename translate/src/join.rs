//! Supervisor for the multicast-join helper.
//!
//! The helper is an opaque child process that keeps a source-specific join
//! alive on the input interface for as long as it runs. We only manage its
//! lifetime; its socket never reaches us.

use anyhow::{Context as _, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::net::IpAddr;
use std::path::Path;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

const STOP_GRACE: Duration = Duration::from_secs(3);

pub struct StayJoined {
    child: Child,
    src: IpAddr,
    grp: IpAddr,
}

pub fn spawn(helper: &Path, interface: &str, src: IpAddr, grp: IpAddr) -> Result<StayJoined> {
    // The helper joins and listens, discarding whatever it receives; port
    // and counters are don't-cares for our purpose.
    let mut cmd = Command::new(helper);
    cmd.arg("-i")
        .arg(interface)
        .arg("-s")
        .arg(src.to_string())
        .arg("-g")
        .arg(grp.to_string())
        .args(["-p", "1783", "-d", "0", "-c", "0"]);

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn join helper `{}`", helper.display()))?;

    tracing::info!(pid = child.id(), ?cmd, "Started join helper");

    Ok(StayJoined { child, src, grp })
}

impl StayJoined {
    /// Asks the helper to leave the group, waits [`STOP_GRACE`], then kills.
    pub fn leave(mut self) {
        tracing::info!(src = %self.src, grp = %self.grp, "Leaving group");

        if let Err(e) = signal::kill(Pid::from_raw(self.child.id() as i32), Signal::SIGINT) {
            tracing::warn!("Failed to signal join helper: {e}");
        }

        let deadline = Instant::now() + STOP_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(%status, src = %self.src, grp = %self.grp, "Left group");
                    return;
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    tracing::warn!("Failed to wait for join helper: {e}");
                    break;
                }
            }
        }

        tracing::warn!(src = %self.src, grp = %self.grp, "Hard kill for join helper");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
