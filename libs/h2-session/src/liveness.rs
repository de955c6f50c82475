use std::time::{Duration, Instant};

/// How long both response timestamps may go stale before the session is
/// considered dead.
pub const DEAD_THRESHOLD: Duration = Duration::from_secs(20);

/// Delay before a torn-down session is re-established.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(20);

/// A watcher-id whose last refresh is older than this is discarded instead
/// of being reused after a reconnect.
pub const STALE_ID_AFTER: Duration = Duration::from_secs(3 * DEAD_THRESHOLD.as_secs());

/// Tracks whether the server is still answering our two periodic requests.
///
/// `refresh-watcher-id` and `assigned-channels` responses each bump their own
/// timestamp. The watchdog polls [`Liveness::check_dead`] every few seconds;
/// a session that has been up for at least [`DEAD_THRESHOLD`] with either
/// timestamp older than [`DEAD_THRESHOLD`] is torn down by the caller.
#[derive(Debug, Clone, Copy)]
pub struct Liveness {
    connect_start: Instant,
    last_refresh: Instant,
    last_assign_check: Instant,
}

impl Liveness {
    pub fn new(now: Instant) -> Self {
        Self {
            connect_start: now,
            last_refresh: now,
            last_assign_check: now,
        }
    }

    pub fn mark_refresh(&mut self, now: Instant) {
        self.last_refresh = now;
    }

    pub fn mark_assign_check(&mut self, now: Instant) {
        self.last_assign_check = now;
    }

    pub fn last_refresh(&self) -> Instant {
        self.last_refresh
    }

    /// Returns a human-readable reason if the session should be torn down.
    pub fn check_dead(&self, now: Instant) -> Option<String> {
        if now.duration_since(self.connect_start) <= DEAD_THRESHOLD {
            return None;
        }

        let refresh_age = now.duration_since(self.last_refresh);
        let assign_age = now.duration_since(self.last_assign_check);

        let mut reasons = Vec::new();
        if refresh_age > DEAD_THRESHOLD {
            reasons.push(format!("last refresh response {}s ago", refresh_age.as_secs()));
        }
        if assign_age > DEAD_THRESHOLD {
            reasons.push(format!(
                "last assigned-channels response {}s ago",
                assign_age.as_secs()
            ));
        }

        if reasons.is_empty() {
            None
        } else {
            Some(reasons.join(", "))
        }
    }
}
