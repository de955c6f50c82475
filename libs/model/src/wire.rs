//! JSON bodies exchanged with the assignment server.
//!
//! All payloads use the `application/yang-data+json` conventions of the
//! `ietf-mnat` module: kebab-case member names, module-qualified top-level
//! keys, addresses as strings.

use crate::{LocalMapping, Mapping, Sg, SgError};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Reply to `operations/ietf-mnat:get-new-watcher-id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherIdReply {
    #[serde(rename = "watcher-id")]
    pub watcher_id: String,
    /// Seconds between `refresh-watcher-id` calls expected from the client.
    #[serde(rename = "refresh-period", default = "default_refresh_period")]
    pub refresh_period: u64,
}

fn default_refresh_period() -> u64 {
    10
}

/// Body of `operations/ietf-mnat:refresh-watcher-id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRequest {
    #[serde(rename = "ietf-mnat:input")]
    pub input: RefreshInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshInput {
    #[serde(rename = "ietf-mnat:watcher-id")]
    pub watcher_id: String,
}

impl RefreshRequest {
    pub fn new(watcher_id: impl Into<String>) -> Self {
        Self {
            input: RefreshInput {
                watcher_id: watcher_id.into(),
            },
        }
    }
}

/// Body PUT/POSTed to `data/ietf-mnat:egress-global-joined`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedPublish {
    #[serde(rename = "ietf-mnat:watcher")]
    pub watcher: JoinedWatcher,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedWatcher {
    pub id: String,
    #[serde(rename = "joined-sg", default)]
    pub joined_sg: Vec<JoinedSgEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedSgEntry {
    pub id: String,
    pub source: IpAddr,
    pub group: IpAddr,
}

impl JoinedPublish {
    pub fn new(watcher_id: impl Into<String>, sgs: impl IntoIterator<Item = Sg>) -> Self {
        let joined_sg = sgs
            .into_iter()
            .enumerate()
            .map(|(idx, sg)| JoinedSgEntry {
                id: idx.to_string(),
                source: sg.source(),
                group: sg.group(),
            })
            .collect();

        Self {
            watcher: JoinedWatcher {
                id: watcher_id.into(),
                joined_sg,
            },
        }
    }
}

/// Body POSTed to `data/ietf-mnat:ingress-watching`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorPublish {
    #[serde(rename = "ietf-mnat:watcher")]
    pub watcher: MonitorWatcher,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorWatcher {
    pub id: String,
    #[serde(default)]
    pub monitor: Vec<MonitorEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorEntry {
    pub id: String,
    /// Only monitor kind currently defined. Entries without it are ignored.
    #[serde(rename = "global-source-prefix", skip_serializing_if = "Option::is_none")]
    pub global_source_prefix: Option<String>,
}

impl MonitorPublish {
    /// The "show me everything" monitor set used by the ingress: one
    /// source-prefix monitor per address family, both zero-length.
    pub fn all_sources(watcher_id: impl Into<String>) -> Self {
        Self {
            watcher: MonitorWatcher {
                id: watcher_id.into(),
                monitor: vec![
                    MonitorEntry {
                        id: "0".to_owned(),
                        global_source_prefix: Some("0.0.0.0/0".to_owned()),
                    },
                    MonitorEntry {
                        id: "1".to_owned(),
                        global_source_prefix: Some("::/0".to_owned()),
                    },
                ],
            },
        }
    }
}

/// Reply to `data/ietf-mnat:assigned-channels[/watcher=<id>]`.
///
/// Item GETs also reply with a one-element list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedChannels {
    #[serde(rename = "ietf-mnat:watcher")]
    pub watcher: Vec<WatcherView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherView {
    pub id: String,
    #[serde(rename = "mapped-sg", default)]
    pub mapped_sg: Vec<MappedSg>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedSg {
    /// Stable per-subscription id, assigned by the server in subscription
    /// order; the polled view is sorted by it.
    pub id: u64,
    pub state: MappingState,
    #[serde(rename = "global-subscription")]
    pub global_subscription: GlobalSubscription,
    #[serde(rename = "local-mapping", skip_serializing_if = "Option::is_none")]
    pub local_mapping: Option<LocalMappingEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingState {
    #[serde(rename = "assigned-local-multicast")]
    AssignedLocalMulticast,
    #[serde(rename = "unassigned")]
    Unassigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSubscription {
    pub source: IpAddr,
    pub group: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocalMappingEntry {
    Ssm { source: IpAddr, group: IpAddr },
    Asm {
        #[serde(rename = "asm-group")]
        asm_group: IpAddr,
    },
}

impl MappedSg {
    pub fn to_mapping(&self) -> Result<Mapping, SgError> {
        let sg = Sg::new(self.global_subscription.source, self.global_subscription.group)?;

        let local = match self.local_mapping {
            None => LocalMapping::Unassigned,
            Some(LocalMappingEntry::Ssm { source, group }) => {
                LocalMapping::Assigned { source, group }
            }
            Some(LocalMappingEntry::Asm { asm_group }) => {
                LocalMapping::AssignedAsm { group: asm_group }
            }
        };

        Ok(Mapping { sg, local })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watcher_id_reply_wire_format() {
        let json = r#"{"watcher-id":"MFRGGZDFMZTWQ2LK","refresh-period":20}"#;

        let reply = serde_json::from_str::<WatcherIdReply>(json).unwrap();

        assert_eq!(reply.watcher_id, "MFRGGZDFMZTWQ2LK");
        assert_eq!(reply.refresh_period, 20);
        assert_eq!(serde_json::to_string(&reply).unwrap(), json);
    }

    #[test]
    fn refresh_period_defaults_to_10() {
        let reply =
            serde_json::from_str::<WatcherIdReply>(r#"{"watcher-id":"A"}"#).unwrap();

        assert_eq!(reply.refresh_period, 10);
    }

    #[test]
    fn refresh_request_wire_format() {
        let req = RefreshRequest::new("MFRGGZDFMZTWQ2LK");

        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"ietf-mnat:input":{"ietf-mnat:watcher-id":"MFRGGZDFMZTWQ2LK"}}"#
        );
    }

    #[test]
    fn joined_publish_wire_format() {
        let publish = JoinedPublish::new(
            "W1",
            vec!["10.1.1.1,232.1.1.1".parse::<Sg>().unwrap()],
        );

        assert_eq!(
            serde_json::to_string(&publish).unwrap(),
            r#"{"ietf-mnat:watcher":{"id":"W1","joined-sg":[{"id":"0","source":"10.1.1.1","group":"232.1.1.1"}]}}"#
        );
    }

    #[test]
    fn monitor_publish_covers_both_families() {
        let publish = MonitorPublish::all_sources("W1");

        assert_eq!(
            serde_json::to_string(&publish).unwrap(),
            r#"{"ietf-mnat:watcher":{"id":"W1","monitor":[{"id":"0","global-source-prefix":"0.0.0.0/0"},{"id":"1","global-source-prefix":"::/0"}]}}"#
        );
    }

    #[test]
    fn parses_assigned_channels_reply() {
        let json = r#"{
            "ietf-mnat:watcher": [{
                "id": "W1",
                "mapped-sg": [
                    {
                        "id": 1,
                        "state": "assigned-local-multicast",
                        "global-subscription": {"source": "10.1.1.1", "group": "232.1.1.1"},
                        "local-mapping": {"source": "10.9.1.2", "group": "239.1.1.1"}
                    },
                    {
                        "id": 2,
                        "state": "unassigned",
                        "global-subscription": {"source": "10.1.1.1", "group": "232.1.1.2"}
                    },
                    {
                        "id": 3,
                        "state": "assigned-local-multicast",
                        "global-subscription": {"source": "10.1.1.1", "group": "232.1.1.3"},
                        "local-mapping": {"asm-group": "239.255.0.1"}
                    }
                ]
            }]
        }"#;

        let channels = serde_json::from_str::<AssignedChannels>(json).unwrap();
        let mappings = channels.watcher[0]
            .mapped_sg
            .iter()
            .map(|m| m.to_mapping().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(
            mappings[0].local,
            LocalMapping::Assigned {
                source: "10.9.1.2".parse().unwrap(),
                group: "239.1.1.1".parse().unwrap(),
            }
        );
        assert_eq!(mappings[1].local, LocalMapping::Unassigned);
        assert_eq!(
            mappings[2].local,
            LocalMapping::AssignedAsm {
                group: "239.255.0.1".parse().unwrap(),
            }
        );
    }

    #[test]
    fn local_mapping_omitted_when_unassigned() {
        let mapped = MappedSg {
            id: 7,
            state: MappingState::Unassigned,
            global_subscription: GlobalSubscription {
                source: "10.1.1.1".parse().unwrap(),
                group: "232.1.1.1".parse().unwrap(),
            },
            local_mapping: None,
        };

        let json = serde_json::to_string(&mapped).unwrap();

        assert!(!json.contains("local-mapping"));
    }
}
