//! The single-threaded capture → translate → inject loop.

use crate::capture::{Capture, Inject, InputFilter};
use anyhow::Result;
use ip_translate::Translator;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const HEARTBEAT: Duration = Duration::from_secs(3);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub pkts: u64,
    pub sent: u64,
    pub drops: u64,
}

/// Shared between the capture loop and the signal handlers in main.
pub struct LoopState {
    stop: AtomicBool,
    last_refresh: Mutex<Instant>,
    /// Exit when no liveness ping arrived for this long; `None` disables.
    dead_delay: Option<Duration>,
}

impl LoopState {
    pub fn new(dead_delay: Option<Duration>) -> Self {
        Self {
            stop: AtomicBool::new(false),
            last_refresh: Mutex::new(Instant::now()),
            dead_delay,
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// SIGUSR1 handler: resets the inactivity timer.
    pub fn mark_refreshed(&self) {
        if let Ok(mut last) = self.last_refresh.lock() {
            *last = Instant::now();
        }
    }

    fn timed_out(&self) -> bool {
        let Some(dead_delay) = self.dead_delay else {
            return false;
        };

        self.last_refresh
            .lock()
            .map(|last| last.elapsed() > dead_delay)
            .unwrap_or(false)
    }
}

pub fn run(
    capture: &Capture,
    inject: &Inject,
    translator: &Translator,
    filter: &InputFilter,
    state: &LoopState,
) -> Result<Counters> {
    let mut counters = Counters::default();
    let mut buf = vec![0u8; 65536];
    let mut last_msg = Instant::now();

    while !state.stop.load(Ordering::Relaxed) {
        if let Some(len) = capture.recv(&mut buf)? {
            let pkt = &buf[..len];

            if filter.matches(pkt) {
                counters.pkts += 1;

                match translator.translate(pkt) {
                    Some(out) => match inject.send(&out) {
                        Ok(_) => counters.sent += 1,
                        Err(e) => tracing::warn!("Failed to inject packet: {e}"),
                    },
                    None => counters.drops += 1,
                }
            }
        }

        if state.timed_out() {
            tracing::info!("Shutting down by timeout (no liveness ping received)");
            break;
        }

        if last_msg.elapsed() >= HEARTBEAT {
            tracing::info!(
                pkts = counters.pkts,
                sent = counters.sent,
                drops = counters.drops,
                "Translating"
            );
            last_msg = Instant::now();
        }
    }

    Ok(counters)
}
