//! The assignment engine: watcher registry, subscription graph and pool
//! leasing.
//!
//! Watchers and global (S,G)s reference each other cyclically in the data
//! model; here both live in flat maps owned by the engine and every
//! cross-reference is a key lookup. The engine is driven entirely through
//! its public operations, each of which runs under the server's single
//! mutex with an explicit `now` so time-dependent behavior stays testable.

use crate::pool::{LocalPool, LocalSg};
use ip_network::IpNetwork;
use mnat_model::{Sg, wire};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Watchers that miss refreshes for this long are evicted.
const TIMEOUT_DURATION: Duration = Duration::from_secs(60);

/// Eviction scans run at most this often.
const RECHECK_DELAY: Duration = Duration::from_secs(15);

const WATCHER_ID_BYTES: usize = 10;

#[derive(Debug, thiserror::Error)]
#[error("unknown watcher `{0}`")]
pub struct UnknownWatcher(pub String);

#[derive(Debug, thiserror::Error)]
#[error("could not find an unused watcher-id")]
pub struct WatcherIdExhausted;

/// A monitor exposes matching active (S,G)s in a watcher's polled view
/// without an explicit subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Monitor {
    SourcePrefix { prefix: IpNetwork },
}

impl Monitor {
    pub fn includes(&self, sg: &Sg) -> bool {
        match self {
            Monitor::SourcePrefix { prefix } => match (prefix, sg.source()) {
                (IpNetwork::V4(prefix), std::net::IpAddr::V4(source)) => prefix.contains(source),
                (IpNetwork::V6(prefix), std::net::IpAddr::V6(source)) => prefix.contains(source),
                (IpNetwork::V4(_), std::net::IpAddr::V6(_))
                | (IpNetwork::V6(_), std::net::IpAddr::V4(_)) => false,
            },
        }
    }
}

#[derive(Debug)]
struct Watcher {
    subscribed: BTreeSet<Sg>,
    monitors: BTreeMap<String, Monitor>,
    last_refresh: Instant,
}

impl Watcher {
    fn new(now: Instant) -> Self {
        Self {
            subscribed: BTreeSet::new(),
            monitors: BTreeMap::new(),
            last_refresh: now,
        }
    }
}

#[derive(Debug)]
struct GlobalSg {
    /// Monotonic id used for stable ordering in the polled view.
    sg_id: u64,
    subscribed_watchers: BTreeSet<String>,
    assignment: Option<LocalSg>,
}

pub struct Assignments<R> {
    watchers: HashMap<String, Watcher>,
    subscribed_sgs: HashMap<Sg, GlobalSg>,
    pool: LocalPool,
    rng: R,
    next_sg_id: u64,
    last_check: Option<Instant>,
}

impl<R> Assignments<R>
where
    R: Rng,
{
    pub fn new(pool: LocalPool, rng: R) -> Self {
        Self {
            watchers: HashMap::new(),
            subscribed_sgs: HashMap::new(),
            pool,
            rng,
            next_sg_id: 1,
            last_check: None,
        }
    }

    /// Mints a fresh random watcher identity and registers it.
    pub fn new_watcher_id(&mut self, now: Instant) -> Result<String, WatcherIdExhausted> {
        for _ in 0..5 {
            let mut bytes = [0u8; WATCHER_ID_BYTES];
            self.rng.fill(&mut bytes);
            let id = data_encoding::BASE32.encode(&bytes);

            if self.watchers.contains_key(&id) {
                continue;
            }

            tracing::info!(watcher_id = %id, "Created watcher");
            self.watchers.insert(id.clone(), Watcher::new(now));

            return Ok(id);
        }

        Err(WatcherIdExhausted)
    }

    pub fn refresh(&mut self, watcher_id: &str, now: Instant) -> Result<(), UnknownWatcher> {
        let watcher = self
            .watchers
            .get_mut(watcher_id)
            .ok_or_else(|| UnknownWatcher(watcher_id.to_owned()))?;

        watcher.last_refresh = now;

        Ok(())
    }

    /// Replaces the watcher's explicit subscription set. Idempotent; the
    /// watcher is created if it does not exist yet.
    pub fn set_subscribed_sgs(&mut self, watcher_id: &str, sgs: Vec<Sg>, now: Instant) {
        tracing::info!(watcher_id, count = sgs.len(), "Setting subscribed (S,G)s");
        self.check_invariants();

        self.ensure_watcher(watcher_id, now);

        let desired = sgs.iter().copied().collect::<BTreeSet<_>>();
        let current = self
            .watchers
            .get(watcher_id)
            .map(|w| w.subscribed.clone())
            .unwrap_or_default();

        for sg in current.difference(&desired) {
            self.unsubscribe(watcher_id, *sg);
        }
        for sg in sgs {
            self.subscribe(watcher_id, sg);
        }

        self.check_invariants();
    }

    /// Replaces the watcher's monitor set.
    pub fn set_monitors(&mut self, watcher_id: &str, monitors: Vec<(String, Monitor)>, now: Instant) {
        tracing::info!(watcher_id, count = monitors.len(), "Setting monitors");
        self.check_invariants();

        self.ensure_watcher(watcher_id, now);

        if let Some(watcher) = self.watchers.get_mut(watcher_id) {
            watcher.monitors = monitors.into_iter().collect();
        }
    }

    /// The polled view for one watcher: every explicit subscription plus
    /// every active (S,G) matched by one of its monitors, ordered by sg-id.
    pub fn view_for(&self, watcher_id: &str) -> Result<wire::WatcherView, UnknownWatcher> {
        let watcher = self
            .watchers
            .get(watcher_id)
            .ok_or_else(|| UnknownWatcher(watcher_id.to_owned()))?;

        let mut covered = HashSet::new();
        let mut entries = Vec::new();

        for sg in &watcher.subscribed {
            if let Some(gsg) = self.subscribed_sgs.get(sg) {
                covered.insert(*sg);
                entries.push(mapped_sg(sg, gsg));
            }
        }

        for monitor in watcher.monitors.values() {
            for (sg, gsg) in &self.subscribed_sgs {
                if !covered.contains(sg) && monitor.includes(sg) {
                    covered.insert(*sg);
                    entries.push(mapped_sg(sg, gsg));
                }
            }
        }

        entries.sort_by_key(|entry| entry.id);

        Ok(wire::WatcherView {
            id: watcher_id.to_owned(),
            mapped_sg: entries,
        })
    }

    pub fn view_all(&self) -> Vec<wire::WatcherView> {
        let mut ids = self.watchers.keys().cloned().collect::<Vec<_>>();
        ids.sort();

        ids.iter()
            .filter_map(|id| self.view_for(id).ok())
            .collect()
    }

    /// Evicts watchers that have not refreshed within the lease, at most
    /// once per [`RECHECK_DELAY`].
    pub fn check_timeouts(&mut self, now: Instant) {
        if let Some(last) = self.last_check {
            if now.duration_since(last) < RECHECK_DELAY {
                return;
            }
        }
        self.last_check = Some(now);

        self.check_invariants();

        let expired = self
            .watchers
            .iter()
            .filter(|(_, w)| now.duration_since(w.last_refresh) > TIMEOUT_DURATION)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();

        for watcher_id in expired {
            tracing::info!(watcher_id = %watcher_id, "Watcher lease expired, evicting");

            let subscribed = self
                .watchers
                .get(&watcher_id)
                .map(|w| w.subscribed.iter().copied().collect::<Vec<_>>())
                .unwrap_or_default();
            for sg in subscribed {
                self.unsubscribe(&watcher_id, sg);
            }

            self.watchers.remove(&watcher_id);
        }

        self.check_invariants();
    }

    fn ensure_watcher(&mut self, watcher_id: &str, now: Instant) {
        self.watchers
            .entry(watcher_id.to_owned())
            .or_insert_with(|| Watcher::new(now));
    }

    fn subscribe(&mut self, watcher_id: &str, sg: Sg) {
        if !self.subscribed_sgs.contains_key(&sg) {
            let sg_id = self.next_sg_id;
            self.next_sg_id += 1;

            let assignment = self.pool.borrow(&mut self.rng, sg.source());
            match &assignment {
                Some(local) => tracing::info!(%sg, %local, "Assigned local channel"),
                None => tracing::info!(%sg, "Pool exhausted, subscription stays unassigned"),
            }

            self.subscribed_sgs.insert(
                sg,
                GlobalSg {
                    sg_id,
                    subscribed_watchers: BTreeSet::new(),
                    assignment,
                },
            );
        }

        if let Some(gsg) = self.subscribed_sgs.get_mut(&sg) {
            gsg.subscribed_watchers.insert(watcher_id.to_owned());
        }
        if let Some(watcher) = self.watchers.get_mut(watcher_id) {
            watcher.subscribed.insert(sg);
        }
    }

    fn unsubscribe(&mut self, watcher_id: &str, sg: Sg) {
        let Some(watcher) = self.watchers.get_mut(watcher_id) else {
            tracing::warn!(watcher_id, "Unsubscribe for a watcher that does not exist");
            return;
        };
        if !watcher.subscribed.remove(&sg) {
            tracing::warn!(watcher_id, %sg, "Tried to remove an (S,G) that was not subscribed");
            return;
        }

        let Some(gsg) = self.subscribed_sgs.get_mut(&sg) else {
            tracing::warn!(%sg, "Subscription table entry missing during unsubscribe");
            return;
        };
        gsg.subscribed_watchers.remove(watcher_id);

        if !gsg.subscribed_watchers.is_empty() {
            return;
        }

        tracing::info!(%sg, "All subscribers left");
        let Some(gsg) = self.subscribed_sgs.remove(&sg) else {
            return;
        };

        if let Some(local) = gsg.assignment {
            let newly_freed = self.pool.give_back(&local);
            tracing::info!(%local, newly_freed, "Returned local channel to the pool");

            if newly_freed {
                self.assign_first_waiter();
            }
        }
    }

    /// After the pool transitions from full to not-full, hand the freed
    /// slot to the first unassigned subscription we find.
    fn assign_first_waiter(&mut self) {
        let waiter = self
            .subscribed_sgs
            .iter()
            .find(|(_, gsg)| gsg.assignment.is_none())
            .map(|(sg, _)| *sg);

        let Some(sg) = waiter else {
            return;
        };

        if let Some(local) = self.pool.borrow(&mut self.rng, sg.source()) {
            tracing::info!(%sg, %local, "Assigned local channel to waiting subscription");
            if let Some(gsg) = self.subscribed_sgs.get_mut(&sg) {
                gsg.assignment = Some(local);
            }
        }
    }

    /// Panics on any inconsistency in the cross-reference graph. Violations
    /// here mean engine state is corrupt; continuing would hand out wrong
    /// assignments.
    pub fn check_invariants(&self) {
        for (watcher_id, watcher) in &self.watchers {
            for sg in &watcher.subscribed {
                let gsg = self
                    .subscribed_sgs
                    .get(sg)
                    .unwrap_or_else(|| panic!("{watcher_id} subscribed to {sg} which has no subscription entry"));
                assert!(
                    gsg.subscribed_watchers.contains(watcher_id),
                    "{sg} is missing the back-reference to {watcher_id}"
                );
            }
        }

        for (sg, gsg) in &self.subscribed_sgs {
            assert!(
                !gsg.subscribed_watchers.is_empty(),
                "{sg} has no subscribers but is still in the subscription table"
            );
            for watcher_id in &gsg.subscribed_watchers {
                let watcher = self
                    .watchers
                    .get(watcher_id)
                    .unwrap_or_else(|| panic!("{sg} references unknown watcher {watcher_id}"));
                assert!(
                    watcher.subscribed.contains(sg),
                    "{watcher_id} is missing the back-reference to {sg}"
                );
            }
        }

        self.pool.check_invariants();
    }

    #[cfg(test)]
    fn subscribed_sg_count(&self) -> usize {
        self.subscribed_sgs.len()
    }

    #[cfg(test)]
    fn pool_assigned_count(&self) -> usize {
        self.pool.assigned_count()
    }
}

fn mapped_sg(sg: &Sg, gsg: &GlobalSg) -> wire::MappedSg {
    let (state, local_mapping) = match &gsg.assignment {
        Some(LocalSg::Ssm { source, group }) => (
            wire::MappingState::AssignedLocalMulticast,
            Some(wire::LocalMappingEntry::Ssm {
                source: *source,
                group: *group,
            }),
        ),
        Some(LocalSg::Asm { group }) => (
            wire::MappingState::AssignedLocalMulticast,
            Some(wire::LocalMappingEntry::Asm { asm_group: *group }),
        ),
        None => (wire::MappingState::Unassigned, None),
    };

    wire::MappedSg {
        id: gsg.sg_id,
        state,
        global_subscription: wire::GlobalSubscription {
            source: sg.source(),
            group: sg.group(),
        },
        local_mapping,
    }
}
