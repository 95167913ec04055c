//! The k-bucket tree.
//!
//! The tree is a binary trie over the identifier space: the root covers the whole space and each
//! split hands one more prefix bit to two children. Only leaves hold contacts, in three bounded
//! lists (good, stale and pending) ordered from least to most recently seen.
//!
//! Buckets live in an arena and refer to each other through [`BucketId`] handles. Buckets are
//! never merged, so handles stay valid until [`RoutingTable::shutdown`].

mod bucket;
mod maintenance;
mod process;
#[cfg(feature = "sync")]
pub(crate) mod sync;

use std::{
    cmp::Ordering,
    collections::{HashMap, VecDeque},
    net::SocketAddr,
};

use rand::{thread_rng, Rng};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, trace, warn};

pub use bucket::{BucketId, BucketInfo};
use bucket::{Bucket, List, NodeLists, Timers};
pub use maintenance::{Action, LookupKind};
use maintenance::{BootState, PendingRpc};

use crate::{
    core::{
        config::{Config, Mode},
        knode::{Knode, Status, VendorCode, Version},
        kuid::Kuid,
        message::Nonce,
    },
    estimate::SizeEstimator,
};

const ROOT: BucketId = BucketId(0);

/// The outcome of offering a contact to the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Added to the good list of its bucket.
    Inserted,
    /// Added to the pending list of its bucket.
    Pending,
    /// Already held; its metadata was refreshed.
    Exists,
    /// Another address holds the identifier, the original address is being verified.
    Verifying,
    /// The contact is the local node.
    SelfEntry,
    /// The contact wasn't added.
    Rejected(Rejection),
}

impl EntryState {
    /// Returns `true` if the contact was added to a bucket.
    pub fn is_added(&self) -> bool {
        matches!(self, EntryState::Inserted | EntryState::Pending)
    }
}

/// Why a contact wasn't added. These are policy decisions, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// A different host claims the local identifier.
    OwnIdCollision,
    /// The bucket already holds the maximum number of contacts from that network.
    ClassC,
    /// The bucket is full, can't be split and has no pending room.
    BucketFull,
    /// The contact can't be reached directly.
    Firewalled,
}

/// Routing table statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub buckets: usize,
    pub leaves: usize,
    pub max_depth: u8,
    pub good: usize,
    pub stale: usize,
    pub pending: usize,
}

/// The core routing table implementation.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    // The node's local identifier.
    local_id: Kuid,
    // The node's own address, if known, used to tell ourselves apart from identifier thieves.
    local_addr: Option<SocketAddr>,
    config: Config,
    // Bucket arena, the root is always at index 0.
    buckets: Vec<Bucket>,
    leaves: usize,
    max_depth: u8,
    // RPCs issued by the table and not yet settled.
    rpcs: HashMap<Nonce, PendingRpc>,
    // Actions queued for the caller.
    outbox: VecDeque<Action>,
    estimator: SizeEstimator,
    // Last time any tracked RPC was answered.
    last_reply: Option<OffsetDateTime>,
    boot: BootState,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new(Kuid::rand(), Config::default())
    }
}

impl RoutingTable {
    /// Creates a new, empty routing table.
    pub fn new(local_id: Kuid, config: Config) -> Self {
        let estimator = SizeEstimator::new(config.refresh_period);
        let mut rt = Self {
            local_id,
            local_addr: None,
            config,
            buckets: vec![Bucket::leaf(Kuid::ZERO, 0, None, true, 0)],
            leaves: 1,
            max_depth: 0,
            rpcs: HashMap::new(),
            outbox: VecDeque::new(),
            estimator,
            last_reply: None,
            boot: BootState::Idle,
        };
        rt.arm_timers(ROOT, OffsetDateTime::now_utc());

        rt
    }

    /// Sets the local node's own address.
    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// Returns this table's local identifier.
    pub fn local_id(&self) -> Kuid {
        self.local_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    /// Switches between active and passive operation. Existing buckets are kept, the new mode
    /// applies to future splits and timer periods.
    pub fn set_mode(&mut self, mode: Mode) {
        if self.config.mode != mode {
            debug!(?mode, "switching routing table mode");
            self.config.mode = mode;
        }
    }

    // QUERIES

    /// Returns the leaf bucket managing the identifier's range.
    pub fn find_bucket(&self, id: &Kuid) -> BucketId {
        let mut current = ROOT;
        while let Some([zero, one]) = self.buckets[current.0].children {
            let depth = self.buckets[current.0].depth as usize;
            current = if id.bit(depth) { one } else { zero };
        }

        current
    }

    /// Returns a view of the bucket, if the handle is valid.
    pub fn bucket(&self, id: BucketId) -> Option<BucketInfo> {
        self.buckets.get(id.0).map(Bucket::info)
    }

    /// Iterates over the leaf buckets.
    pub fn leaves(&self) -> impl Iterator<Item = BucketId> + '_ {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| bucket.is_leaf())
            .map(|(i, _)| BucketId(i))
    }

    /// Returns the contacts in one of the bucket's lists, least recently seen first.
    pub fn nodes_in(&self, bucket: BucketId, status: Status) -> Vec<Knode> {
        match (self.leaf(bucket), List::of(status)) {
            (Some(nodes), Some(list)) => nodes.iter(list).cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Iterates over every contact held by the table.
    pub fn nodes(&self) -> impl Iterator<Item = &Knode> + '_ {
        self.buckets
            .iter()
            .filter_map(|bucket| bucket.nodes.as_ref())
            .flat_map(|nodes| List::ALL.into_iter().flat_map(move |list| nodes.iter(list)))
    }

    /// Returns the contact holding the identifier, if it is routed.
    pub fn get(&self, id: &Kuid) -> Option<&Knode> {
        self.leaf(self.find_bucket(id))?.get(id)
    }

    /// Returns the contact's status, [`Status::Unknown`] if it isn't routed.
    pub fn status_of(&self, id: &Kuid) -> Status {
        self.get(id).map_or(Status::Unknown, |kn| kn.status)
    }

    /// Returns the number of contacts held, whatever their status.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .filter_map(|bucket| bucket.nodes.as_ref())
            .map(NodeLists::count)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Stats {
        let mut stats = Stats {
            buckets: self.buckets.len(),
            leaves: self.leaves,
            max_depth: self.max_depth,
            ..Default::default()
        };

        for nodes in self.buckets.iter().filter_map(|b| b.nodes.as_ref()) {
            stats.good += nodes.len(List::Good);
            stats.stale += nodes.len(List::Stale);
            stats.pending += nodes.len(List::Pending);
        }

        stats
    }

    /// Returns up to `k` good contacts closest to the target, closest first. Shutting down
    /// contacts and the excluded identifier are skipped.
    pub fn fill_closest(&self, target: &Kuid, k: usize, exclude: Option<&Kuid>) -> Vec<Knode> {
        let mut closest = Vec::with_capacity(k);
        self.fill_from(ROOT, target, k, exclude, &mut closest);

        closest
    }

    // Visiting the child sharing the target's next bit first yields buckets in increasing
    // distance order.
    fn fill_from(
        &self,
        current: BucketId,
        target: &Kuid,
        k: usize,
        exclude: Option<&Kuid>,
        closest: &mut Vec<Knode>,
    ) {
        if closest.len() >= k {
            return;
        }

        let bucket = &self.buckets[current.0];
        if let Some([zero, one]) = bucket.children {
            let (near, far) = if target.bit(bucket.depth as usize) {
                (one, zero)
            } else {
                (zero, one)
            };
            self.fill_from(near, target, k, exclude, closest);
            self.fill_from(far, target, k, exclude, closest);
            return;
        }

        if let Some(nodes) = &bucket.nodes {
            let mut candidates: Vec<&Knode> = nodes
                .iter(List::Good)
                .filter(|kn| !kn.flags.shutdowning && Some(&kn.id) != exclude)
                .collect();
            candidates.sort_by(|a, b| target.cmp_distance(&a.id, &b.id));

            let room = k - closest.len();
            closest.extend(candidates.into_iter().take(room).cloned());
        }
    }

    // INSERTION

    /// Offers a contact to the table. Contacts only learnt about second-hand (`from_traffic` set
    /// to `false`) are never kept as pending.
    pub fn add_node(&mut self, kn: Knode, from_traffic: bool) -> EntryState {
        if let Some(state) = self.check_own_id(&kn) {
            return state;
        }

        if kn.flags.firewalled {
            trace!(id = %kn.id, "not adding firewalled contact");
            return EntryState::Rejected(Rejection::Firewalled);
        }

        let mut b = self.find_bucket(&kn.id);
        let held = match self.leaf(b) {
            Some(nodes) => nodes.contains(&kn.id),
            None => return EntryState::Rejected(Rejection::BucketFull),
        };

        if held {
            return if from_traffic {
                self.record_traffic(kn)
            } else {
                EntryState::Exists
            };
        }

        let k = self.config.k;
        let now = OffsetDateTime::now_utc();
        while self.leaf(b).map_or(k, |nodes| nodes.len(List::Good)) >= k && self.is_splitable(b) {
            self.split(b, now);
            b = self.find_bucket(&kn.id);
        }

        let max_per_class_c = self.config.max_per_class_c;
        let depth = self.buckets[b.0].depth;
        let nodes = match self.leaf_mut(b) {
            Some(nodes) => nodes,
            None => return EntryState::Rejected(Rejection::BucketFull),
        };

        // The quota applies to the leaf the contact ends up in.
        if nodes.network_count(&kn.network()) >= max_per_class_c {
            debug!(id = %kn.id, addr = %kn.addr, "network quota reached, not adding contact");
            return EntryState::Rejected(Rejection::ClassC);
        }

        if nodes.len(List::Good) < k {
            trace!(id = %kn.id, depth, "adding good contact");
            nodes.insert(kn, List::Good);
            return EntryState::Inserted;
        }

        if from_traffic && nodes.len(List::Pending) < k {
            trace!(id = %kn.id, "adding pending contact");
            nodes.insert(kn, List::Pending);
            return EntryState::Pending;
        }

        EntryState::Rejected(Rejection::BucketFull)
    }

    /// Records traffic received directly from a contact. Known contacts are refreshed and moved
    /// to the most recently seen end of their list, unknown ones go through insertion.
    pub fn record_traffic(&mut self, kn: Knode) -> EntryState {
        if let Some(state) = self.check_own_id(&kn) {
            return state;
        }

        let b = self.find_bucket(&kn.id);
        let (held_addr, status) = match self.leaf(b).and_then(|nodes| nodes.get(&kn.id)) {
            Some(held) => (held.addr, held.status),
            None => return self.add_node(kn, true),
        };

        if held_addr != kn.addr {
            return self.verify_collision(b, kn);
        }

        if kn.flags.firewalled {
            debug!(id = %kn.id, "contact became firewalled, removing it");
            self.remove_node(&kn.id);
            return EntryState::Rejected(Rejection::Firewalled);
        }

        let list = match List::of(status) {
            Some(list) => list,
            None => return EntryState::Exists,
        };

        let now = OffsetDateTime::now_utc();
        let k = self.config.k;
        let (good, stale) = match self.leaf_mut(b) {
            Some(nodes) => {
                if let Some(held) = nodes.get_mut(&kn.id) {
                    held.last_seen = now;
                    held.rpc_timeouts = 0;
                    held.flags.alive = true;
                    held.flags.cached = false;
                    held.flags.shutdowning = kn.flags.shutdowning;
                    if kn.vendor != VendorCode::UNKNOWN {
                        held.vendor = kn.vendor;
                    }
                    if kn.version != Version::default() {
                        held.version = kn.version;
                    }
                }
                nodes.move_to(&kn.id, list);

                (nodes.len(List::Good), nodes.len(List::Stale))
            }
            None => return EntryState::Exists,
        };

        match status {
            Status::Stale if good < k => {
                trace!(id = %kn.id, "stale contact is alive again");
                self.set_status(&kn.id, Status::Good);
            }
            Status::Pending if good + stale < k && !kn.flags.shutdowning => {
                trace!(id = %kn.id, "promoting pending contact");
                self.set_status(&kn.id, Status::Good);
            }
            _ => {}
        }

        EntryState::Exists
    }

    fn check_own_id(&self, kn: &Knode) -> Option<EntryState> {
        if kn.id != self.local_id {
            return None;
        }

        if self.local_addr == Some(kn.addr) {
            return Some(EntryState::SelfEntry);
        }

        warn!(addr = %kn.addr, "contact claims our own identifier");
        Some(EntryState::Rejected(Rejection::OwnIdCollision))
    }

    // STATUS TRANSITIONS

    /// Moves a contact to the list matching `status`, [`Status::Unknown`] removes it. Returns
    /// `false` if the contact isn't routed.
    ///
    /// When the target list overflows, its least recently seen contact is evicted: an evicted good
    /// contact is demoted to pending if there is room, anything else is forgotten. A contact
    /// leaving the good list is replaced by the most recently seen pending contact.
    pub fn set_status(&mut self, id: &Kuid, status: Status) -> bool {
        let b = self.find_bucket(id);
        let k = self.config.k;

        let old = match self.leaf(b).and_then(|nodes| nodes.get(id)) {
            Some(kn) => kn.status,
            None => return false,
        };

        if old == status {
            return true;
        }

        let nodes = match self.leaf_mut(b) {
            Some(nodes) => nodes,
            None => return false,
        };

        match List::of(status) {
            None => {
                nodes.remove(id);
            }
            Some(to) => {
                nodes.move_to(id, to);

                if nodes.len(to) > k {
                    if let Some(evicted) = nodes.head(to) {
                        if to == List::Good && nodes.len(List::Pending) < k {
                            trace!(id = %evicted, "demoting oldest good contact");
                            nodes.move_to(&evicted, List::Pending);
                        } else {
                            trace!(id = %evicted, list = ?to, "forgetting oldest contact");
                            nodes.remove(&evicted);
                        }
                    }
                }
            }
        }

        if old == Status::Good && status != Status::Good {
            self.backfill(b);
        }

        true
    }

    /// Removes a contact from the table.
    pub fn remove_node(&mut self, id: &Kuid) -> bool {
        self.set_status(id, Status::Unknown)
    }

    // Promotes the most recently seen pending contact that isn't shutting down.
    fn backfill(&mut self, b: BucketId) {
        let k = self.config.k;
        let nodes = match self.leaf_mut(b) {
            Some(nodes) if nodes.len(List::Good) < k => nodes,
            _ => return,
        };

        let candidate = nodes
            .iter(List::Pending)
            .rev()
            .find(|kn| !kn.flags.shutdowning)
            .map(|kn| kn.id);

        if let Some(id) = candidate {
            trace!(%id, "backfilling good list from pending");
            nodes.move_to(&id, List::Good);
        }
    }

    // SPLITTING

    /// Returns whether a leaf may be split in two.
    pub(crate) fn is_splitable(&self, b: BucketId) -> bool {
        let bucket = &self.buckets[b.0];
        debug_assert!(bucket.is_leaf());

        if bucket.depth >= self.config.depth_ceiling() {
            return false;
        }

        // Our own bucket can always be split, up to the ceiling.
        if bucket.ours {
            return true;
        }

        // Passive nodes only split their own bucket.
        if self.config.mode == Mode::Passive {
            return false;
        }

        // Branches keep splitting a few levels past the point they left the closest subtree.
        let subdivided = bucket
            .split_depth
            .saturating_add(self.config.subdivide)
            .saturating_sub(1);
        if bucket.depth < subdivided {
            return true;
        }

        self.is_among_our_closest(b)
    }

    // The bucket lies in the branch next to our own leaf and, at every level up to it, on the side
    // closer to the local identifier.
    fn is_among_our_closest(&self, b: BucketId) -> bool {
        let mut current = b;
        loop {
            let bucket = &self.buckets[current.0];
            let parent = match bucket.parent {
                Some(parent) => parent,
                None => return bucket.ours,
            };

            let sibling = match self.buckets[parent.0].children {
                Some([zero, one]) if zero == current => one,
                Some([zero, _]) => zero,
                None => return false,
            };
            let sibling = &self.buckets[sibling.0];

            if sibling.ours {
                return sibling.is_leaf();
            }

            if self.local_id.cmp_distance(&bucket.prefix, &sibling.prefix) != Ordering::Less {
                return false;
            }

            current = parent;
        }
    }

    /// Splits a leaf, redistributing its contacts to the two new children.
    fn split(&mut self, b: BucketId, now: OffsetDateTime) {
        let (prefix, depth, ours, split_depth) = {
            let bucket = &self.buckets[b.0];
            debug_assert!(bucket.is_leaf());
            (bucket.prefix, bucket.depth, bucket.ours, bucket.split_depth)
        };

        let child_depth = depth + 1;
        let ours_bit = self.local_id.bit(depth as usize);
        let child_ours = |bit: bool| ours && ours_bit == bit;
        // The child leaving the closest subtree records where it happened.
        let child_split_depth = |bit: bool| {
            if ours && ours_bit != bit {
                child_depth
            } else {
                split_depth
            }
        };

        let zero = BucketId(self.buckets.len());
        let one = BucketId(self.buckets.len() + 1);
        self.buckets.push(Bucket::leaf(
            prefix,
            child_depth,
            Some(b),
            child_ours(false),
            child_split_depth(false),
        ));
        self.buckets.push(Bucket::leaf(
            prefix.with_bit(depth as usize),
            child_depth,
            Some(b),
            child_ours(true),
            child_split_depth(true),
        ));

        let parent = &mut self.buckets[b.0];
        let nodes = parent.nodes.take().unwrap_or_default();
        parent.children = Some([zero, one]);
        parent.timers = Timers::default();

        let count = nodes.count();
        for (list, kn) in nodes.into_ordered() {
            let child = if kn.id.bit(depth as usize) { one } else { zero };
            if let Some(child_nodes) = self.buckets[child.0].nodes.as_mut() {
                child_nodes.insert(kn, list);
            }
        }

        self.arm_timers(zero, now);
        self.arm_timers(one, now);
        self.leaves += 1;
        self.max_depth = self.max_depth.max(child_depth);

        debug!(
            depth,
            ours,
            count,
            buckets = self.buckets.len(),
            "split bucket"
        );
    }

    // TIMERS

    fn arm_timers(&mut self, b: BucketId, now: OffsetDateTime) {
        let alive = now + self.jittered(self.config.alive());
        let refresh = now + self.jittered(self.refresh_period(b));
        self.buckets[b.0].timers = Timers {
            alive: Some(alive),
            refresh: Some(refresh),
        };
    }

    pub(crate) fn refresh_period(&self, b: BucketId) -> Duration {
        if self.buckets[b.0].ours {
            self.config.our_refresh_period
        } else {
            self.config.refresh_period
        }
    }

    pub(crate) fn jittered(&self, period: Duration) -> Duration {
        let span = (period.whole_milliseconds() * self.config.jitter_percent as i128 / 100) as i64;
        if span <= 0 {
            return period;
        }

        period + Duration::milliseconds(thread_rng().gen_range(-span..=span))
    }

    // TEARDOWN

    /// Tears the table down: tracked RPCs and queued actions are cancelled, every contact is
    /// dropped and the tree is reset to an empty root.
    pub fn shutdown(&mut self) {
        let stats = self.stats();

        self.rpcs.clear();
        self.outbox.clear();
        for bucket in &mut self.buckets {
            bucket.timers = Timers::default();
        }
        self.buckets.clear();
        self.buckets
            .push(Bucket::leaf(Kuid::ZERO, 0, None, true, 0));
        self.leaves = 1;
        self.max_depth = 0;
        self.boot = BootState::Idle;
        self.arm_timers(ROOT, OffsetDateTime::now_utc());

        info!(
            buckets = stats.buckets,
            good = stats.good,
            stale = stats.stale,
            pending = stats.pending,
            "routing table shut down"
        );
    }

    // HELPERS

    pub(crate) fn leaf(&self, b: BucketId) -> Option<&NodeLists> {
        self.buckets.get(b.0)?.nodes.as_ref()
    }

    pub(crate) fn leaf_mut(&mut self, b: BucketId) -> Option<&mut NodeLists> {
        self.buckets.get_mut(b.0)?.nodes.as_mut()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    // Produces an address on its own /24 for every index.
    pub(crate) fn addr(i: u32) -> SocketAddr {
        let [_, a, b, c] = i.to_be_bytes();
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10 + a, b, c, 1)), 6346)
    }

    pub(crate) fn config(k: usize) -> Config {
        Config {
            k,
            ..Default::default()
        }
    }

    // An identifier in the upper half of the space, far from a zero local identifier.
    pub(crate) fn far_id(low: u64) -> Kuid {
        Kuid::from_u64(low).with_bit(0)
    }

    pub(crate) fn check_invariants(rt: &RoutingTable) {
        let k = rt.config.k;
        let mut ours_leaves = 0;

        for (i, bucket) in rt.buckets.iter().enumerate() {
            let id = BucketId(i);

            match (&bucket.children, &bucket.nodes) {
                (Some([zero, one]), None) => {
                    for child in [zero, one] {
                        let child = &rt.buckets[child.0];
                        assert_eq!(child.depth, bucket.depth + 1);
                        assert_eq!(child.parent, Some(id));
                        assert!(child.prefix.match_nth(&bucket.prefix, bucket.depth as usize));
                    }
                    assert!(rt.buckets[one.0].prefix.bit(bucket.depth as usize));
                    assert!(!rt.buckets[zero.0].prefix.bit(bucket.depth as usize));
                }
                (None, Some(nodes)) => {
                    nodes.check(k);
                    for list in List::ALL {
                        for kn in nodes.iter(list) {
                            assert_eq!(rt.find_bucket(&kn.id), id);
                            assert!(nodes.network_count(&kn.network()) <= rt.config.max_per_class_c);
                        }
                    }
                    if bucket.ours {
                        ours_leaves += 1;
                        assert_eq!(rt.find_bucket(&rt.local_id), id);
                    }
                }
                _ => panic!("bucket {i} is neither a leaf nor internal"),
            }

            if bucket.ours {
                assert!(rt.local_id.match_nth(&bucket.prefix, bucket.depth as usize));
            }
        }

        assert_eq!(ours_leaves, 1);
        assert_eq!(rt.leaves, rt.leaves().count());
    }

    #[test]
    fn default() {
        let rt = RoutingTable::default();

        assert_ne!(rt.local_id(), Kuid::ZERO);
        assert_eq!(rt.config().k, 20);
        assert!(rt.is_empty());

        let stats = rt.stats();
        assert_eq!(stats.buckets, 1);
        assert_eq!(stats.leaves, 1);
        assert_eq!(stats.max_depth, 0);
        check_invariants(&rt);
    }

    #[test]
    fn insert_self() {
        let local = addr(0);
        let mut rt = RoutingTable::new(Kuid::ZERO, config(20)).with_local_addr(local);

        assert_eq!(
            rt.add_node(Knode::new(Kuid::ZERO, local), true),
            EntryState::SelfEntry
        );
        assert_eq!(
            rt.record_traffic(Knode::new(Kuid::ZERO, addr(1))),
            EntryState::Rejected(Rejection::OwnIdCollision)
        );
        assert!(rt.is_empty());
    }

    #[test]
    fn insert_duplicate() {
        let mut rt = RoutingTable::new(Kuid::ZERO, config(20));
        let kn = Knode::new(far_id(1), addr(1));

        assert_eq!(rt.add_node(kn.clone(), false), EntryState::Inserted);
        assert_eq!(rt.add_node(kn, false), EntryState::Exists);
        assert_eq!(rt.len(), 1);
    }

    #[test]
    fn insert_firewalled() {
        let mut rt = RoutingTable::new(Kuid::ZERO, config(20));
        let flags = crate::Flags {
            firewalled: true,
            ..Default::default()
        };

        assert_eq!(
            rt.add_node(Knode::new(far_id(1), addr(1)).with_flags(flags), true),
            EntryState::Rejected(Rejection::Firewalled)
        );
    }

    #[test]
    fn class_c_quota() {
        let mut rt = RoutingTable::new(Kuid::ZERO, config(20));
        let same_net = |host: u8| SocketAddr::new(IpAddr::V4(Ipv4Addr::new(82, 1, 1, host)), 6346);

        for i in 1..=3 {
            assert_eq!(
                rt.add_node(Knode::new(far_id(i), same_net(i as u8)), true),
                EntryState::Inserted
            );
        }
        assert_eq!(
            rt.add_node(Knode::new(far_id(4), same_net(4)), true),
            EntryState::Rejected(Rejection::ClassC)
        );

        // Freeing a slot makes room again.
        assert!(rt.remove_node(&far_id(1)));
        assert_eq!(
            rt.add_node(Knode::new(far_id(4), same_net(4)), true),
            EntryState::Inserted
        );
        check_invariants(&rt);
    }

    #[test]
    fn class_c_quota_applies_after_split() {
        let mut rt = RoutingTable::new(Kuid::ZERO, config(4));
        let same_net = |host: u8| SocketAddr::new(IpAddr::V4(Ipv4Addr::new(82, 1, 1, host)), 6346);

        for i in 1..=3 {
            rt.add_node(Knode::new(far_id(i), same_net(i as u8)), true);
        }
        rt.add_node(Knode::new(far_id(4), addr(4)), true);
        assert_eq!(rt.stats().leaves, 1);

        // The root is full, but the contact lands in the lower half once it splits.
        assert_eq!(
            rt.add_node(Knode::new(Kuid::from_u64(1), same_net(9)), true),
            EntryState::Inserted
        );
        assert_eq!(rt.stats().leaves, 2);
        check_invariants(&rt);
    }

    #[test]
    fn root_split_redistributes() {
        let mut rt = RoutingTable::new(Kuid::ZERO, config(4));

        // Two on each side of the first bit.
        for i in 1..=2 {
            rt.add_node(Knode::new(Kuid::from_u64(i), addr(i as u32)), true);
            rt.add_node(Knode::new(far_id(i), addr(10 + i as u32)), true);
        }
        assert!(rt.set_status(&far_id(1), Status::Stale));
        let before = rt.len();

        rt.split(ROOT, OffsetDateTime::now_utc());

        let [zero, one] = rt.buckets[0].children.unwrap();
        let zero_info = rt.bucket(zero).unwrap();
        let one_info = rt.bucket(one).unwrap();

        assert_eq!(before, zero_info.count() + one_info.count());
        assert!(zero_info.ours);
        assert!(!one_info.ours);
        assert_eq!(rt.buckets[one.0].split_depth, 1);
        // Statuses survive the split.
        assert_eq!(rt.status_of(&far_id(1)), Status::Stale);
        assert_eq!(rt.status_of(&far_id(2)), Status::Good);
        assert_eq!(one_info.stale, 1);
        assert!(rt.buckets[0].nodes.is_none());
        assert!(rt.buckets[0].timers.alive.is_none());
        check_invariants(&rt);
    }

    #[test]
    fn split_on_full_own_bucket() {
        let mut rt = RoutingTable::new(Kuid::ZERO, config(4));

        for i in 0..4 {
            assert_eq!(
                rt.add_node(Knode::new(far_id(i + 1), addr(i as u32)), true),
                EntryState::Inserted
            );
        }
        assert_eq!(rt.stats().leaves, 1);

        // The root holds our identifier, so the fifth contact splits it.
        assert_eq!(
            rt.add_node(Knode::new(Kuid::from_u64(1), addr(9)), true),
            EntryState::Inserted
        );
        assert!(rt.stats().leaves >= 2);
        check_invariants(&rt);
    }

    #[test]
    fn splitable_rules() {
        let config = Config {
            k: 2,
            subdivide: 1,
            ..Default::default()
        };
        let mut rt = RoutingTable::new(Kuid::ZERO, config);
        let now = OffsetDateTime::now_utc();

        // Root: ours.
        assert!(rt.is_splitable(ROOT));
        rt.split(ROOT, now);
        let [zero, one] = rt.buckets[0].children.unwrap();

        // The far half is the sibling of our leaf.
        assert!(rt.is_splitable(one));

        // Once our leaf is deeper, the far half no longer is.
        rt.split(zero, now);
        assert!(!rt.is_splitable(one));

        // Below our leaf's sibling only the side closer to us stays splitable.
        let [_, zero_one] = rt.buckets[zero.0].children.unwrap();
        rt.split(zero_one, now);
        let [near, far] = rt.buckets[zero_one.0].children.unwrap();
        assert!(rt.is_splitable(near));
        assert!(!rt.is_splitable(far));

        // Passive mode only splits our own bucket.
        rt.set_mode(Mode::Passive);
        assert!(!rt.is_splitable(near));
        assert!(rt.is_splitable(rt.find_bucket(&Kuid::ZERO)));
    }

    #[test]
    fn subdivide_past_closest_subtree() {
        let config = Config {
            k: 2,
            subdivide: 3,
            ..Default::default()
        };
        let mut rt = RoutingTable::new(Kuid::ZERO, config);
        let now = OffsetDateTime::now_utc();

        rt.split(ROOT, now);
        let [zero, one] = rt.buckets[0].children.unwrap();
        rt.split(zero, now);
        rt.split(rt.find_bucket(&Kuid::ZERO), now);

        // The far half left at depth 1: it may go two levels further.
        assert!(rt.is_splitable(one));
        rt.split(one, now);
        let [one_zero, one_one] = rt.buckets[one.0].children.unwrap();
        assert!(rt.is_splitable(one_one));
        rt.split(one_zero, now);
        let leaf = rt.find_bucket(&far_id(1));
        assert_eq!(rt.buckets[leaf.0].depth, 3);
        assert!(!rt.is_splitable(leaf));
        check_invariants(&rt);
    }

    #[test]
    fn depth_ceiling() {
        let config = Config {
            k: 1,
            max_depth_passive: 2,
            mode: Mode::Passive,
            ..Default::default()
        };
        let mut rt = RoutingTable::new(Kuid::ZERO, config);

        for i in 1..=8u64 {
            rt.add_node(Knode::new(Kuid::from_u64(i), addr(i as u32)), false);
        }

        assert_eq!(rt.stats().max_depth, 2);
        check_invariants(&rt);
    }

    #[test]
    fn depth_ceiling_stops_at_last_bit() {
        let config = Config {
            k: 1,
            max_depth: u8::MAX,
            ..Default::default()
        };
        let mut rt = RoutingTable::new(Kuid::ZERO, config);

        for i in 1..=2u64 {
            assert_eq!(
                rt.add_node(Knode::new(Kuid::from_u64(i), addr(i as u32)), true),
                EntryState::Inserted
            );
        }
        assert_eq!(rt.stats().max_depth, 159);

        // Shares the last leaf with the second contact.
        assert_eq!(
            rt.add_node(Knode::new(Kuid::from_u64(3), addr(3)), true),
            EntryState::Pending
        );
        assert_eq!(rt.stats().max_depth, 159);
        check_invariants(&rt);
    }

    #[test]
    fn good_overflow_demotes_to_pending() {
        let mut rt = RoutingTable::new(Kuid::ZERO, Config {
            k: 2,
            mode: Mode::Passive,
            max_depth_passive: 0,
            ..Default::default()
        });

        rt.add_node(Knode::new(far_id(1), addr(1)), true);
        rt.add_node(Knode::new(far_id(2), addr(2)), true);
        assert_eq!(
            rt.add_node(Knode::new(far_id(3), addr(3)), true),
            EntryState::Pending
        );
        rt.set_status(&far_id(1), Status::Stale);
        // far_id(3) was backfilled into the good list.
        assert_eq!(rt.status_of(&far_id(3)), Status::Good);

        // Forcing the stale contact back into a full good list evicts the oldest good one.
        assert!(rt.set_status(&far_id(1), Status::Good));
        assert_eq!(rt.status_of(&far_id(2)), Status::Pending);
        assert_eq!(rt.status_of(&far_id(1)), Status::Good);
        check_invariants(&rt);
    }

    #[test]
    fn good_overflow_forgets_without_pending_room() {
        let mut rt = RoutingTable::new(Kuid::ZERO, Config {
            k: 1,
            mode: Mode::Passive,
            max_depth_passive: 0,
            ..Default::default()
        });

        rt.add_node(Knode::new(far_id(1), addr(1)), true);
        assert_eq!(
            rt.add_node(Knode::new(far_id(2), addr(2)), true),
            EntryState::Pending
        );
        // Demote the good contact: the pending one is backfilled, the demoted one goes stale.
        rt.set_status(&far_id(1), Status::Stale);
        assert_eq!(rt.status_of(&far_id(2)), Status::Good);
        assert_eq!(
            rt.add_node(Knode::new(far_id(3), addr(3)), true),
            EntryState::Pending
        );

        // Pending is full: the evicted good contact is forgotten.
        assert!(rt.set_status(&far_id(1), Status::Good));
        assert_eq!(rt.status_of(&far_id(2)), Status::Unknown);
        assert_eq!(rt.status_of(&far_id(3)), Status::Pending);
        check_invariants(&rt);
    }

    #[test]
    fn backfill_skips_shutdowning() {
        let mut rt = RoutingTable::new(Kuid::ZERO, Config {
            k: 1,
            mode: Mode::Passive,
            max_depth_passive: 0,
            ..Default::default()
        });
        let shutdowning = crate::Flags {
            shutdowning: true,
            ..Default::default()
        };

        rt.add_node(Knode::new(far_id(1), addr(1)), true);
        rt.add_node(Knode::new(far_id(2), addr(2)), true);
        rt.record_traffic(Knode::new(far_id(2), addr(2)).with_flags(shutdowning));
        assert_eq!(rt.status_of(&far_id(2)), Status::Pending);

        rt.remove_node(&far_id(1));
        assert_eq!(rt.status_of(&far_id(2)), Status::Pending);
        assert_eq!(rt.stats().good, 0);
    }

    #[test]
    fn traffic_refreshes_position() {
        let mut rt = RoutingTable::new(Kuid::ZERO, config(20));
        for i in 1..=3 {
            rt.add_node(Knode::new(far_id(i), addr(i as u32)), true);
        }
        let b = rt.find_bucket(&far_id(1));
        assert_eq!(rt.leaf(b).unwrap().head(List::Good), Some(far_id(1)));

        assert_eq!(
            rt.record_traffic(Knode::new(far_id(1), addr(1))),
            EntryState::Exists
        );
        assert_eq!(rt.leaf(b).unwrap().head(List::Good), Some(far_id(2)));
    }

    #[test]
    fn traffic_revives_stale() {
        let mut rt = RoutingTable::new(Kuid::ZERO, config(20));
        rt.add_node(Knode::new(far_id(1), addr(1)), true);
        rt.node_timed_out(&far_id(1));
        assert_eq!(rt.status_of(&far_id(1)), Status::Stale);
        assert_eq!(rt.get(&far_id(1)).unwrap().rpc_timeouts(), 1);

        rt.record_traffic(Knode::new(far_id(1), addr(1)));
        let kn = rt.get(&far_id(1)).unwrap();
        assert_eq!(kn.status(), Status::Good);
        assert_eq!(kn.rpc_timeouts(), 0);
        assert!(kn.flags().alive);
    }

    #[test]
    fn random_population_keeps_invariants() {
        let mut rng = StdRng::seed_from_u64(42);
        let local = Kuid::random_with(&mut rng);
        let mut rt = RoutingTable::new(local, config(8));

        for i in 0..2_000u32 {
            let kn = Knode::new(Kuid::random_with(&mut rng), addr(i));
            let state = rt.add_node(kn, i % 2 == 0);
            assert!(!matches!(state, EntryState::Rejected(Rejection::ClassC)));
        }

        // Shuffle some statuses around.
        let ids: Vec<Kuid> = rt.nodes().map(|kn| kn.id).collect();
        for (i, id) in ids.iter().enumerate() {
            match i % 7 {
                0 => {
                    rt.set_status(id, Status::Stale);
                }
                1 => {
                    rt.node_timed_out(id);
                }
                2 => {
                    rt.record_traffic(Knode::new(*id, rt.get(id).map_or(addr(0), |kn| kn.addr)));
                }
                3 => {
                    rt.remove_node(id);
                }
                _ => {}
            }
        }

        check_invariants(&rt);
        let stats = rt.stats();
        assert_eq!(stats.good + stats.stale + stats.pending, rt.len());
    }

    #[test]
    fn fill_closest_orders_by_distance() {
        let mut rng = StdRng::seed_from_u64(3);
        let local = Kuid::random_with(&mut rng);
        let mut rt = RoutingTable::new(local, config(20));

        for i in 0..300u32 {
            rt.add_node(Knode::new(Kuid::random_with(&mut rng), addr(i)), false);
        }

        let target = Kuid::random_with(&mut rng);
        let closest = rt.fill_closest(&target, 20, None);
        assert_eq!(closest.len(), 20);

        let mut expected: Vec<Kuid> = rt
            .nodes()
            .filter(|kn| kn.status == Status::Good)
            .map(|kn| kn.id)
            .collect();
        expected.sort_by(|a, b| target.cmp_distance(a, b));
        expected.truncate(20);

        let ids: Vec<Kuid> = closest.iter().map(|kn| kn.id).collect();
        assert_eq!(ids, expected);

        // Excluding the closest shifts the window by one.
        let excluded = rt.fill_closest(&target, 20, Some(&expected[0]));
        assert_eq!(excluded[0].id, expected[1]);
    }

    #[test]
    fn shutdown_resets() {
        let mut rt = RoutingTable::new(Kuid::ZERO, config(2));
        for i in 1..=10u64 {
            rt.add_node(Knode::new(Kuid::from_u64(i << 40), addr(i as u32)), true);
        }
        assert!(rt.stats().leaves > 1);

        rt.shutdown();

        assert!(rt.is_empty());
        assert_eq!(rt.stats().buckets, 1);
        assert!(rt.drain_actions().is_empty());
        check_invariants(&rt);
    }
}
