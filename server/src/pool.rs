//! The inventory of local (S,G)s available for leasing.
//!
//! Every leasable pair has a position in a single linear index space:
//! ranges are laid out one after another, and within a range the index is
//! `src_idx * group_count + grp_idx`. Draws are uniform over the free part
//! of that space; the two assignment maps translate between pairs and
//! indexes in both directions.

use ip_network::{IpNetwork, Ipv4Network, Ipv6Network};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;

/// A leased local channel. ASM pools lease only a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LocalSg {
    Ssm { source: IpAddr, group: IpAddr },
    Asm { group: IpAddr },
}

impl fmt::Display for LocalSg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalSg::Ssm { source, group } => write!(f, "{source}->{group}"),
            LocalSg::Asm { group } => write!(f, "*->{group}"),
        }
    }
}

/// Where the source half of a leased pair comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRange {
    /// Reuse the borrower's global source.
    Keep,
    /// Any-source: no source at all.
    Asm,
    Net(IpNetwork),
}

impl SourceRange {
    fn source_count(&self) -> u128 {
        match self {
            SourceRange::Keep | SourceRange::Asm => 1,
            SourceRange::Net(net) => net_size(net),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolRange {
    base_group_range: IpNetwork,
    source_range: SourceRange,
    /// What is left of `base_group_range` after subtracting the excludes,
    /// in address order.
    usable_ranges: Vec<IpNetwork>,
    group_count: u128,
    source_count: u128,
}

impl PoolRange {
    /// `excludes` must each be a proper subnet of `base_group_range`; the
    /// config loader validates that before we get here.
    pub fn new(
        base_group_range: IpNetwork,
        source_range: SourceRange,
        excludes: &[IpNetwork],
    ) -> Self {
        let mut usable_ranges = vec![base_group_range];
        for exclude in excludes {
            usable_ranges = subtract(usable_ranges, exclude);
        }
        usable_ranges.sort_by_key(net_base);

        let group_count = usable_ranges.iter().map(net_size).sum();
        let source_count = source_range.source_count();

        Self {
            base_group_range,
            source_range,
            usable_ranges,
            group_count,
            source_count,
        }
    }

    pub fn base_group_range(&self) -> &IpNetwork {
        &self.base_group_range
    }

    pub fn usable_ranges(&self) -> &[IpNetwork] {
        &self.usable_ranges
    }

    pub fn group_count(&self) -> u128 {
        self.group_count
    }

    pub fn sg_count(&self) -> u128 {
        self.group_count.saturating_mul(self.source_count)
    }

    /// Materializes the (src_idx, grp_idx) cell of this range.
    fn materialize(&self, src_idx: u128, grp_idx: u128, global_source: IpAddr) -> LocalSg {
        let mut grp_idx = grp_idx;
        let mut group = None;
        for net in &self.usable_ranges {
            let size = net_size(net);
            if grp_idx < size {
                group = Some(nth_addr(net, grp_idx));
                break;
            }
            grp_idx -= size;
        }
        let group = group.expect("grp_idx is < group_count by construction");

        match &self.source_range {
            SourceRange::Keep => LocalSg::Ssm {
                source: global_source,
                group,
            },
            SourceRange::Asm => LocalSg::Asm { group },
            SourceRange::Net(net) => LocalSg::Ssm {
                source: nth_addr(net, src_idx),
                group,
            },
        }
    }
}

/// Give up on a draw after this many distinct (S,G) collisions.
const MAX_COLLISIONS: u32 = 50;

pub struct LocalPool {
    ranges: Vec<PoolRange>,
    sg_count: u128,
    assigned_sgs: HashMap<LocalSg, u128>,
    assigned_idxs: BTreeMap<u128, LocalSg>,
}

impl LocalPool {
    pub fn new(ranges: Vec<PoolRange>) -> Self {
        let sg_count = ranges.iter().map(PoolRange::sg_count).sum();

        Self {
            ranges,
            sg_count,
            assigned_sgs: HashMap::new(),
            assigned_idxs: BTreeMap::new(),
        }
    }

    pub fn sg_count(&self) -> u128 {
        self.sg_count
    }

    pub fn assigned_count(&self) -> usize {
        self.assigned_sgs.len()
    }

    fn is_full(&self) -> bool {
        self.assigned_idxs.len() as u128 >= self.sg_count
    }

    /// Draws a uniformly random free slot, stepping over address collisions
    /// (possible when a `keep` source maps several linear indexes onto the
    /// same pair).
    pub fn borrow(&mut self, rng: &mut impl Rng, global_source: IpAddr) -> Option<LocalSg> {
        if self.is_full() {
            return None;
        }

        let free = self.sg_count - self.assigned_idxs.len() as u128;
        let mut idx = rng.gen_range(0..free);

        // Map the free-space position to an absolute index by stepping past
        // every assigned index at or below it, in ascending order.
        for assigned in self.assigned_idxs.keys() {
            if *assigned <= idx {
                idx += 1;
            } else {
                break;
            }
        }

        let mut collisions = 0;
        let mut steps = 0u128;
        loop {
            if steps >= self.sg_count {
                tracing::warn!("Pool draw wrapped the whole index space without a free pair");
                return None;
            }

            if !self.assigned_idxs.contains_key(&idx) {
                let sg = self.decode(idx, global_source);

                if !self.assigned_sgs.contains_key(&sg) {
                    self.assigned_sgs.insert(sg, idx);
                    self.assigned_idxs.insert(idx, sg);
                    return Some(sg);
                }

                collisions += 1;
                tracing::debug!(%sg, idx, collisions, "Pool draw collided");
                if collisions >= MAX_COLLISIONS {
                    tracing::warn!("Giving up on pool draw after {MAX_COLLISIONS} collisions");
                    return None;
                }
            }

            idx = (idx + 1) % self.sg_count;
            steps += 1;
        }
    }

    /// Returns a leased pair to the pool. The boolean reports whether this
    /// freed space in a previously full pool, i.e. whether unassigned
    /// waiters may now be served.
    pub fn give_back(&mut self, sg: &LocalSg) -> bool {
        let was_full = self.is_full();

        let Some(idx) = self.assigned_sgs.remove(sg) else {
            tracing::error!(%sg, "Tried to return a pair that was not leased");
            return false;
        };
        self.assigned_idxs.remove(&idx);

        was_full
    }

    fn decode(&self, idx: u128, global_source: IpAddr) -> LocalSg {
        let mut idx = idx;
        for range in &self.ranges {
            let count = range.sg_count();
            if idx < count {
                let src_idx = idx / range.group_count;
                let grp_idx = idx % range.group_count;
                return range.materialize(src_idx, grp_idx, global_source);
            }
            idx -= count;
        }

        unreachable!("index is < sg_count by construction")
    }

    pub fn check_invariants(&self) {
        assert_eq!(
            self.assigned_sgs.len(),
            self.assigned_idxs.len(),
            "assignment maps diverged in size"
        );

        for (sg, idx) in &self.assigned_sgs {
            assert_eq!(
                self.assigned_idxs.get(idx),
                Some(sg),
                "reverse lookup for {sg} (idx {idx}) diverged"
            );
        }
    }
}

fn net_bits(net: &IpNetwork) -> u8 {
    match net {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    }
}

fn net_base(net: &IpNetwork) -> u128 {
    match net {
        IpNetwork::V4(net) => u128::from(u32::from(net.network_address())),
        IpNetwork::V6(net) => u128::from(net.network_address()),
    }
}

pub(crate) fn net_size(net: &IpNetwork) -> u128 {
    let host_bits = u32::from(net_bits(net) - net.netmask());

    match 1u128.checked_shl(host_bits) {
        Some(size) => size,
        None => u128::MAX, // a ::/0 pool can never be fully indexed anyway
    }
}

fn nth_addr(net: &IpNetwork, idx: u128) -> IpAddr {
    match net {
        IpNetwork::V4(net) => {
            let base = u32::from(net.network_address());
            IpAddr::V4((base + idx as u32).into())
        }
        IpNetwork::V6(net) => {
            let base = u128::from(net.network_address());
            IpAddr::V6((base + idx).into())
        }
    }
}

/// True if `inner` lies entirely within `outer`.
pub(crate) fn is_subnet(outer: &IpNetwork, inner: &IpNetwork) -> bool {
    match (outer, inner) {
        (IpNetwork::V4(outer), IpNetwork::V4(inner)) => {
            inner.netmask() >= outer.netmask() && outer.contains(inner.network_address())
        }
        (IpNetwork::V6(outer), IpNetwork::V6(inner)) => {
            inner.netmask() >= outer.netmask() && outer.contains(inner.network_address())
        }
        (IpNetwork::V4(_), IpNetwork::V6(_)) | (IpNetwork::V6(_), IpNetwork::V4(_)) => false,
    }
}

pub(crate) fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    is_subnet(a, b) || is_subnet(b, a)
}

/// Removes `exclude` from every network in `from` by splitting containers
/// in half until the exclude falls out.
fn subtract(from: Vec<IpNetwork>, exclude: &IpNetwork) -> Vec<IpNetwork> {
    let mut result = Vec::new();

    for net in from {
        if is_subnet(exclude, &net) {
            // Fully shadowed.
            continue;
        }

        if !is_subnet(&net, exclude) {
            result.push(net);
            continue;
        }

        let (low, high) = halves(&net);
        result.extend(subtract(vec![low, high], exclude));
    }

    result
}

fn halves(net: &IpNetwork) -> (IpNetwork, IpNetwork) {
    match net {
        IpNetwork::V4(net) => {
            let prefix = net.netmask() + 1;
            let base = net.network_address();
            let upper = u32::from(base) + (1u32 << (32 - prefix));

            (
                IpNetwork::V4(
                    Ipv4Network::new(base, prefix).expect("base is aligned to the shorter prefix"),
                ),
                IpNetwork::V4(
                    Ipv4Network::new(upper.into(), prefix)
                        .expect("upper half is aligned by construction"),
                ),
            )
        }
        IpNetwork::V6(net) => {
            let prefix = net.netmask() + 1;
            let base = net.network_address();
            let upper = u128::from(base) + (1u128 << (128 - u32::from(prefix)));

            (
                IpNetwork::V6(
                    Ipv6Network::new(base, prefix).expect("base is aligned to the shorter prefix"),
                ),
                IpNetwork::V6(
                    Ipv6Network::new(upper.into(), prefix)
                        .expect("upper half is aligned by construction"),
                ),
            )
        }
    }
}
