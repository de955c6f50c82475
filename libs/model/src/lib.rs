#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod sg_file;
pub mod wire;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A source-specific multicast channel: a unicast sender and the multicast
/// group it sends to, both of the same address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sg {
    source: IpAddr,
    group: IpAddr,
}

impl Sg {
    pub fn new(source: IpAddr, group: IpAddr) -> Result<Self, SgError> {
        if source.is_ipv4() != group.is_ipv4() {
            return Err(SgError::MixedFamilies {
                src: source,
                group,
            });
        }

        if !group.is_multicast() {
            return Err(SgError::NotMulticast(group));
        }

        Ok(Self { source, group })
    }

    pub fn source(&self) -> IpAddr {
        self.source
    }

    pub fn group(&self) -> IpAddr {
        self.group
    }
}

impl fmt::Display for Sg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.group)
    }
}

impl FromStr for Sg {
    type Err = SgError;

    /// Parses the `"<source>,<group>"` notation used by the join and
    /// assignment files.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source, group) = s
            .split_once(',')
            .ok_or_else(|| SgError::MissingComma(s.to_owned()))?;

        let source = source
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| SgError::BadAddress(source.trim().to_owned()))?;
        let group = group
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| SgError::BadAddress(group.trim().to_owned()))?;

        Sg::new(source, group)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SgError {
    #[error("source {src} and group {group} must be of the same address family")]
    MixedFamilies { src: IpAddr, group: IpAddr },
    #[error("{0} is not a multicast address")]
    NotMulticast(IpAddr),
    #[error("expected `<source>,<group>`, got `{0}`")]
    MissingComma(String),
    #[error("`{0}` is not an IP address")]
    BadAddress(String),
}

/// The local side of a mapping as last polled from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalMapping {
    /// The server has not (yet) leased a local channel for this subscription.
    Unassigned,
    Assigned { source: IpAddr, group: IpAddr },
    /// Any-source pool entry, only a group is leased.
    AssignedAsm { group: IpAddr },
}

impl LocalMapping {
    pub fn is_assigned(&self) -> bool {
        !matches!(self, LocalMapping::Unassigned)
    }
}

impl fmt::Display for LocalMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalMapping::Unassigned => write!(f, "(unassigned)"),
            LocalMapping::Assigned { source, group } => write!(f, "{source}->{group}"),
            LocalMapping::AssignedAsm { group } => write!(f, "*->{group}"),
        }
    }
}

/// One entry of the polled assignment view: a global channel together with
/// the local channel it is currently translated to (if any).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub sg: Sg,
    pub local: LocalMapping,
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.sg, self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sg_line() {
        let sg = "192.168.1.2,232.1.1.1".parse::<Sg>().unwrap();

        assert_eq!(sg.source(), "192.168.1.2".parse::<IpAddr>().unwrap());
        assert_eq!(sg.group(), "232.1.1.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn parses_sg_line_with_whitespace() {
        let sg = " 2001:db8::1 , ff3e::8000:1 ".parse::<Sg>().unwrap();

        assert_eq!(sg.group(), "ff3e::8000:1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn rejects_mixed_families() {
        let err = "192.168.1.2,ff3e::8000:1".parse::<Sg>().unwrap_err();

        assert!(matches!(err, SgError::MixedFamilies { .. }));
    }

    #[test]
    fn rejects_unicast_group() {
        let err = "192.168.1.2,10.0.0.1".parse::<Sg>().unwrap_err();

        assert_eq!(
            err,
            SgError::NotMulticast("10.0.0.1".parse::<IpAddr>().unwrap())
        );
    }
}
