//! Reconciliation of the polled assignment view against running translators.

use crate::translate_manager::{Direction, Spawn, TranslateManager};
use mnat_model::{Mapping, Sg};
use std::collections::HashMap;
use std::sync::Arc;

/// All translators currently managed by this client, keyed by global (S,G).
pub struct MappingSet {
    direction: Direction,
    in_interface: Option<String>,
    out_interface: Option<String>,
    no_join: bool,
    spawner: Arc<dyn Spawn>,
    current: HashMap<Sg, TranslateManager>,
}

impl MappingSet {
    pub fn new(
        direction: Direction,
        in_interface: Option<String>,
        out_interface: Option<String>,
        no_join: bool,
        spawner: Arc<dyn Spawn>,
    ) -> Self {
        Self {
            direction,
            in_interface,
            out_interface,
            no_join,
            spawner,
            current: HashMap::new(),
        }
    }

    /// The global (S,G)s we currently hold a manager for (assigned or
    /// pending). This is what the ingress dumps to its control file.
    pub fn active_sgs(&self) -> Vec<Sg> {
        let mut sgs = self.current.keys().copied().collect::<Vec<_>>();
        sgs.sort();

        sgs
    }

    /// Applies one polled snapshot: removed mappings are stopped, kept ones
    /// refreshed or restarted, new ones created (and started if assigned).
    pub async fn apply(&mut self, mappings: Vec<Mapping>) {
        let polled = mappings
            .into_iter()
            .map(|m| (m.sg, m))
            .collect::<HashMap<_, _>>();

        let removed = self
            .current
            .keys()
            .filter(|sg| !polled.contains_key(sg))
            .copied()
            .collect::<Vec<_>>();

        for sg in removed {
            if let Some(mut manager) = self.current.remove(&sg) {
                manager.stop().await;
            }
        }

        for (sg, mapping) in polled {
            match self.current.get_mut(&sg) {
                Some(manager) => manager.check_for_update(mapping).await,
                None => {
                    let mut manager = TranslateManager::new(
                        mapping,
                        self.direction,
                        self.in_interface.clone(),
                        self.out_interface.clone(),
                        self.no_join,
                        self.spawner.clone(),
                    );
                    manager.start();
                    self.current.insert(sg, manager);
                }
            }
        }
    }

    pub async fn stop_all(&mut self) {
        for (_, mut manager) in self.current.drain() {
            manager.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate_manager::{TranslateInvocation, TranslatorChild};
    use mnat_model::LocalMapping;
    use std::net::IpAddr;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Started { grp_in: IpAddr, grp_out: IpAddr },
        Stopped { grp_out: IpAddr },
        Refreshed { grp_out: IpAddr },
    }

    #[derive(Default)]
    struct FakeSpawner {
        events: Arc<Mutex<Vec<Event>>>,
    }

    struct FakeChild {
        grp_out: IpAddr,
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl Spawn for FakeSpawner {
        fn spawn(
            &self,
            invocation: TranslateInvocation,
        ) -> anyhow::Result<Box<dyn TranslatorChild>> {
            self.events.lock().unwrap().push(Event::Started {
                grp_in: invocation.grp_in,
                grp_out: invocation.grp_out,
            });

            Ok(Box::new(FakeChild {
                grp_out: invocation.grp_out,
                events: self.events.clone(),
            }))
        }
    }

    #[async_trait::async_trait]
    impl TranslatorChild for FakeChild {
        fn refresh(&mut self) {
            self.events.lock().unwrap().push(Event::Refreshed {
                grp_out: self.grp_out,
            });
        }

        async fn stop(&mut self) {
            self.events.lock().unwrap().push(Event::Stopped {
                grp_out: self.grp_out,
            });
        }
    }

    fn mapping(global: &str, local: Option<&str>) -> Mapping {
        let sg = global.parse::<Sg>().unwrap();
        let local = match local {
            None => LocalMapping::Unassigned,
            Some(l) => {
                let local_sg = l.parse::<Sg>().unwrap();
                LocalMapping::Assigned {
                    source: local_sg.source(),
                    group: local_sg.group(),
                }
            }
        };

        Mapping { sg, local }
    }

    fn set(events: &Arc<Mutex<Vec<Event>>>) -> MappingSet {
        MappingSet::new(
            Direction::ToLocal,
            Some("eth0".to_owned()),
            Some("eth1".to_owned()),
            false,
            Arc::new(FakeSpawner {
                events: events.clone(),
            }),
        )
    }

    fn grp(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn reconciles_changed_kept_and_pending_mappings() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut mappings = set(&events);

        // Initial poll: A assigned to a1, B assigned to b1.
        mappings
            .apply(vec![
                mapping("10.1.1.1,232.1.1.1", Some("10.9.1.2,239.1.1.1")),
                mapping("10.1.1.1,232.1.1.2", Some("10.9.1.2,239.1.1.2")),
            ])
            .await;
        events.lock().unwrap().clear();

        // Next poll: A moved to a2, B unchanged, C pending.
        mappings
            .apply(vec![
                mapping("10.1.1.1,232.1.1.1", Some("10.9.1.2,239.1.1.9")),
                mapping("10.1.1.1,232.1.1.2", Some("10.9.1.2,239.1.1.2")),
                mapping("10.1.1.1,232.1.1.3", None),
            ])
            .await;

        let events = events.lock().unwrap().clone();

        // A: stop-then-start, in that order, never overlapping.
        let stop_idx = events
            .iter()
            .position(|e| *e == Event::Stopped { grp_out: grp("239.1.1.1") })
            .expect("old translator for A stopped");
        let start_idx = events
            .iter()
            .position(|e| matches!(e, Event::Started { grp_out, .. } if *grp_out == grp("239.1.1.9")))
            .expect("new translator for A started");
        assert!(stop_idx < start_idx);

        // B: just a liveness ping.
        assert!(events.contains(&Event::Refreshed { grp_out: grp("239.1.1.2") }));

        // C: no translator spawned while unassigned.
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, Event::Started { .. }))
                .count(),
            1
        );
        assert_eq!(mappings.active_sgs().len(), 3);
    }

    #[tokio::test]
    async fn pending_mapping_starts_once_assigned() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut mappings = set(&events);

        mappings
            .apply(vec![mapping("10.1.1.1,232.1.1.1", None)])
            .await;
        assert!(events.lock().unwrap().is_empty());

        mappings
            .apply(vec![mapping("10.1.1.1,232.1.1.1", Some("10.9.1.2,239.1.1.1"))])
            .await;

        assert_eq!(
            events.lock().unwrap().clone(),
            vec![Event::Started {
                grp_in: grp("232.1.1.1"),
                grp_out: grp("239.1.1.1"),
            }]
        );
    }

    #[tokio::test]
    async fn removed_mapping_is_stopped_and_dropped() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut mappings = set(&events);

        mappings
            .apply(vec![mapping("10.1.1.1,232.1.1.1", Some("10.9.1.2,239.1.1.1"))])
            .await;
        mappings.apply(Vec::new()).await;

        assert!(
            events
                .lock()
                .unwrap()
                .contains(&Event::Stopped { grp_out: grp("239.1.1.1") })
        );
        assert!(mappings.active_sgs().is_empty());
    }
}
