//! Buckets and the node lists held by leaves.

use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    ops::{Index, IndexMut},
};

use time::OffsetDateTime;

use crate::core::{
    knode::{Knode, Status},
    kuid::Kuid,
};

/// A stable handle to a bucket in the table's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(pub(crate) usize);

/// The lists a leaf keeps, one per routed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum List {
    Good,
    Stale,
    Pending,
}

impl List {
    pub(crate) const ALL: [List; 3] = [List::Good, List::Stale, List::Pending];

    pub(crate) fn of(status: Status) -> Option<List> {
        match status {
            Status::Good => Some(List::Good),
            Status::Stale => Some(List::Stale),
            Status::Pending => Some(List::Pending),
            Status::Unknown => None,
        }
    }

    pub(crate) fn status(self) -> Status {
        match self {
            List::Good => Status::Good,
            List::Stale => Status::Stale,
            List::Pending => Status::Pending,
        }
    }
}

// Head is the least recently seen, tail the most recently seen.
#[derive(Debug, Clone, Default)]
struct Lists([VecDeque<Kuid>; 3]);

impl Index<List> for Lists {
    type Output = VecDeque<Kuid>;

    fn index(&self, list: List) -> &Self::Output {
        &self.0[list as usize]
    }
}

impl IndexMut<List> for Lists {
    fn index_mut(&mut self, list: List) -> &mut Self::Output {
        &mut self.0[list as usize]
    }
}

/// The contacts held by a leaf bucket.
#[derive(Debug, Clone, Default)]
pub(crate) struct NodeLists {
    lists: Lists,
    // Combined index over the three lists.
    all: HashMap<Kuid, Knode>,
    // Contacts per network, regardless of status.
    networks: HashMap<IpAddr, usize>,
}

impl NodeLists {
    pub(crate) fn len(&self, list: List) -> usize {
        self.lists[list].len()
    }

    pub(crate) fn count(&self) -> usize {
        self.all.len()
    }

    pub(crate) fn contains(&self, id: &Kuid) -> bool {
        self.all.contains_key(id)
    }

    pub(crate) fn get(&self, id: &Kuid) -> Option<&Knode> {
        self.all.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &Kuid) -> Option<&mut Knode> {
        self.all.get_mut(id)
    }

    pub(crate) fn ids(&self, list: List) -> &VecDeque<Kuid> {
        &self.lists[list]
    }

    /// Iterates over a list from the least to the most recently seen contact.
    pub(crate) fn iter(&self, list: List) -> impl DoubleEndedIterator<Item = &Knode> + '_ {
        self.lists[list].iter().filter_map(|id| self.all.get(id))
    }

    pub(crate) fn network_count(&self, network: &IpAddr) -> usize {
        self.networks.get(network).copied().unwrap_or(0)
    }

    /// Appends the contact at the most recently seen end of the list.
    pub(crate) fn insert(&mut self, mut kn: Knode, list: List) {
        debug_assert!(!self.all.contains_key(&kn.id));

        kn.status = list.status();
        *self.networks.entry(kn.network()).or_insert(0) += 1;
        self.lists[list].push_back(kn.id);
        self.all.insert(kn.id, kn);
    }

    pub(crate) fn remove(&mut self, id: &Kuid) -> Option<Knode> {
        let mut kn = self.all.remove(id)?;

        if let Some(list) = List::of(kn.status) {
            self.unlink(id, list);
        }

        let network = kn.network();
        if let Some(count) = self.networks.get_mut(&network) {
            *count -= 1;
            if *count == 0 {
                self.networks.remove(&network);
            }
        }

        kn.status = Status::Unknown;
        Some(kn)
    }

    /// Moves the contact to the most recently seen end of `list`, which may be its current one.
    pub(crate) fn move_to(&mut self, id: &Kuid, list: List) -> bool {
        let current = match self.all.get(id).and_then(|kn| List::of(kn.status)) {
            Some(current) => current,
            None => return false,
        };

        self.unlink(id, current);
        self.lists[list].push_back(*id);
        if let Some(kn) = self.all.get_mut(id) {
            kn.status = list.status();
        }

        true
    }

    /// Moves a held identifier over to the candidate's address, keeping its list.
    pub(crate) fn readdress(&mut self, candidate: &Knode) -> bool {
        let old_network = match self.all.get(&candidate.id) {
            Some(held) => held.network(),
            None => return false,
        };

        if let Some(count) = self.networks.get_mut(&old_network) {
            *count -= 1;
            if *count == 0 {
                self.networks.remove(&old_network);
            }
        }
        *self.networks.entry(candidate.network()).or_insert(0) += 1;

        if let Some(held) = self.all.get_mut(&candidate.id) {
            held.addr = candidate.addr;
            held.vendor = candidate.vendor;
            held.version = candidate.version;
            held.rpc_timeouts = 0;
            held.last_sent = None;
        }

        true
    }

    /// Returns the least recently seen contact of the list.
    pub(crate) fn head(&self, list: List) -> Option<Kuid> {
        self.lists[list].front().copied()
    }

    /// Consumes the lists, yielding every contact in list order.
    pub(crate) fn into_ordered(mut self) -> Vec<(List, Knode)> {
        let mut ordered = Vec::with_capacity(self.all.len());
        for list in List::ALL {
            for id in std::mem::take(&mut self.lists[list]) {
                if let Some(kn) = self.all.remove(&id) {
                    ordered.push((list, kn));
                }
            }
        }

        ordered
    }

    fn unlink(&mut self, id: &Kuid, list: List) {
        if let Some(pos) = self.lists[list].iter().position(|x| x == id) {
            self.lists[list].remove(pos);
        }
    }

    /// Checks the lists partition the combined index and respect the capacity.
    #[cfg(test)]
    pub(crate) fn check(&self, k: usize) {
        let listed: usize = List::ALL.iter().map(|&list| self.len(list)).sum();
        assert_eq!(listed, self.all.len());

        for list in List::ALL {
            assert!(self.len(list) <= k, "{list:?} over capacity");
            for id in self.ids(list) {
                let kn = self.all.get(id).expect("listed contact must be indexed");
                assert_eq!(kn.status, list.status());
            }
        }

        let networks: usize = self.networks.values().sum();
        assert_eq!(networks, self.all.len());
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Timers {
    pub(crate) alive: Option<OffsetDateTime>,
    pub(crate) refresh: Option<OffsetDateTime>,
}

/// A node of the routing trie. Leaves hold contacts, internal buckets only link their children.
#[derive(Debug, Clone)]
pub(crate) struct Bucket {
    pub(crate) prefix: Kuid,
    pub(crate) depth: u8,
    pub(crate) parent: Option<BucketId>,
    // [zero, one]
    pub(crate) children: Option<[BucketId; 2]>,
    // The range contains the local identifier.
    pub(crate) ours: bool,
    // Depth at which this branch left the closest subtree.
    pub(crate) split_depth: u8,
    pub(crate) nodes: Option<NodeLists>,
    pub(crate) timers: Timers,
    pub(crate) last_lookup: Option<OffsetDateTime>,
}

impl Bucket {
    pub(crate) fn leaf(
        prefix: Kuid,
        depth: u8,
        parent: Option<BucketId>,
        ours: bool,
        split_depth: u8,
    ) -> Self {
        Self {
            prefix,
            depth,
            parent,
            children: None,
            ours,
            split_depth,
            nodes: Some(NodeLists::default()),
            timers: Timers::default(),
            last_lookup: None,
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        debug_assert_ne!(self.children.is_none(), self.nodes.is_none());
        self.children.is_none()
    }

    pub(crate) fn info(&self) -> BucketInfo {
        let len = |list| self.nodes.as_ref().map_or(0, |nodes| nodes.len(list));

        BucketInfo {
            prefix: self.prefix,
            depth: self.depth,
            ours: self.ours,
            is_leaf: self.is_leaf(),
            parent: self.parent,
            children: self.children,
            good: len(List::Good),
            stale: len(List::Stale),
            pending: len(List::Pending),
        }
    }
}

/// A read-only view of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketInfo {
    pub prefix: Kuid,
    pub depth: u8,
    /// The bucket's range contains the local identifier.
    pub ours: bool,
    pub is_leaf: bool,
    pub parent: Option<BucketId>,
    pub children: Option<[BucketId; 2]>,
    pub good: usize,
    pub stale: usize,
    pub pending: usize,
}

impl BucketInfo {
    pub fn count(&self) -> usize {
        self.good + self.stale + self.pending
    }
}
