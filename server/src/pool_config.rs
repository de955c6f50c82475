//! Loader for the pool definition file.
//!
//! ```json
//! { "group-pool": {
//!     "default-source-range": "keep",
//!     "ranges": [
//!       { "group-range": "239.1.0.0/16", "source-range": "10.9.1.0/28",
//!         "exclude": [{"groupex-range": "239.1.255.0/24"}] } ] } }
//! ```
//!
//! In strict mode every violation fails the load; in lenient mode it is
//! logged and the offending piece is skipped or kept as-is where harmless.

use crate::pool::{self, LocalPool, PoolRange, SourceRange};
use ip_network::IpNetwork;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Strict,
    Lenient,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read pool config")]
    Io(#[from] std::io::Error),
    #[error("pool config is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error("invalid pool config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "group-pool")]
    group_pool: RawPool,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawPool {
    #[serde(rename = "default-source-range")]
    default_source_range: Option<String>,
    #[serde(default)]
    ranges: Vec<RawRange>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawRange {
    #[serde(rename = "group-range")]
    group_range: Option<String>,
    #[serde(rename = "source-range")]
    source_range: Option<String>,
    #[serde(default)]
    exclude: Vec<RawExclude>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawExclude {
    #[serde(rename = "groupex-range")]
    groupex_range: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

pub fn load(path: &Path, mode: Mode) -> Result<LocalPool, ConfigError> {
    let contents = std::fs::read_to_string(path)?;

    parse(&contents, mode)
}

pub fn parse(contents: &str, mode: Mode) -> Result<LocalPool, ConfigError> {
    let raw = serde_json::from_str::<RawConfig>(contents)?;

    let violation = |msg: String| match mode {
        Mode::Strict => Err(ConfigError::Invalid(msg)),
        Mode::Lenient => {
            tracing::warn!("Pool config: {msg}");
            Ok(())
        }
    };

    check_no_extras(&raw.extra, "top level", violation)?;
    check_no_extras(&raw.group_pool.extra, "group-pool", violation)?;

    let default_source = match &raw.group_pool.default_source_range {
        Some(s) => parse_source_range(s)
            .map_err(|e| ConfigError::Invalid(format!("default-source-range: {e}")))?,
        None => SourceRange::Keep,
    };

    let mut ranges = Vec::new();

    for (idx, raw_range) in raw.group_pool.ranges.iter().enumerate() {
        check_no_extras(&raw_range.extra, &format!("ranges[{idx}]"), violation)?;

        let Some(group_range) = &raw_range.group_range else {
            violation(format!("ranges[{idx}] is missing group-range"))?;
            continue;
        };
        let base = match group_range.parse::<IpNetwork>() {
            Ok(net) => net,
            Err(e) => {
                violation(format!("ranges[{idx}] group-range `{group_range}`: {e}"))?;
                continue;
            }
        };

        if !net_is_multicast(&base) {
            violation(format!(
                "ranges[{idx}] group-range `{group_range}` is not a multicast network"
            ))?;
        }

        let source_range = match &raw_range.source_range {
            Some(s) => match parse_source_range(s) {
                Ok(range) => range,
                Err(e) => {
                    violation(format!("ranges[{idx}] source-range `{s}`: {e}"))?;
                    continue;
                }
            },
            None => default_source.clone(),
        };

        if let SourceRange::Net(net) = &source_range {
            if matches!(net, IpNetwork::V4(_)) != matches!(base, IpNetwork::V4(_)) {
                violation(format!(
                    "ranges[{idx}] source-range and group-range are different address families"
                ))?;
                continue;
            }
        }

        let mut excludes: Vec<IpNetwork> = Vec::new();
        for (ex_idx, raw_exclude) in raw_range.exclude.iter().enumerate() {
            check_no_extras(
                &raw_exclude.extra,
                &format!("ranges[{idx}].exclude[{ex_idx}]"),
                violation,
            )?;

            let Some(groupex) = &raw_exclude.groupex_range else {
                violation(format!(
                    "ranges[{idx}].exclude[{ex_idx}] is missing groupex-range"
                ))?;
                continue;
            };
            let exclude = match groupex.parse::<IpNetwork>() {
                Ok(net) => net,
                Err(e) => {
                    violation(format!(
                        "ranges[{idx}].exclude[{ex_idx}] `{groupex}`: {e}"
                    ))?;
                    continue;
                }
            };

            if !pool::is_subnet(&base, &exclude) || exclude == base {
                violation(format!(
                    "ranges[{idx}].exclude[{ex_idx}] `{groupex}` is not a proper subnet of `{group_range}`"
                ))?;
                continue;
            }

            if let Some(other) = excludes.iter().find(|other| pool::overlaps(other, &exclude)) {
                violation(format!(
                    "ranges[{idx}].exclude[{ex_idx}] `{groupex}` overlaps `{other}`"
                ))?;
                continue;
            }

            excludes.push(exclude);
        }

        ranges.push(PoolRange::new(base, source_range, &excludes));
    }

    if ranges.is_empty() {
        return Err(ConfigError::Invalid("no usable ranges".to_owned()));
    }

    Ok(LocalPool::new(ranges))
}

fn check_no_extras(
    extra: &BTreeMap<String, serde_json::Value>,
    context: &str,
    violation: impl Fn(String) -> Result<(), ConfigError>,
) -> Result<(), ConfigError> {
    for key in extra.keys() {
        violation(format!("unknown field `{key}` in {context}"))?;
    }

    Ok(())
}

fn parse_source_range(s: &str) -> Result<SourceRange, String> {
    match s {
        "keep" => Ok(SourceRange::Keep),
        "asm" => Ok(SourceRange::Asm),
        cidr => cidr
            .parse::<IpNetwork>()
            .map(SourceRange::Net)
            .map_err(|e| e.to_string()),
    }
}

fn net_is_multicast(net: &IpNetwork) -> bool {
    match net {
        IpNetwork::V4(net) => net.network_address().is_multicast(),
        IpNetwork::V6(net) => net.network_address().is_multicast(),
    }
}
