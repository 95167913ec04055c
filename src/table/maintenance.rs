//! Bucket maintenance: timers, liveness RPCs, identifier collisions and bootstrap.
//!
//! The table never performs I/O. Every maintenance step it wants carried out is returned as an
//! [`Action`] from [`RoutingTable::tick`] (or [`RoutingTable::drain_actions`]), and the caller
//! reports back with [`RoutingTable::rpc_reply`], [`RoutingTable::rpc_timeout`] and
//! [`RoutingTable::lookup_completed`].

use std::net::SocketAddr;

use rand::{thread_rng, Rng};
use time::OffsetDateTime;
use tracing::{debug, info, trace, warn};

use super::{BucketId, EntryState, List, RoutingTable};
use crate::core::{
    knode::{Knode, Status},
    kuid::Kuid,
    message::Nonce,
    traits::LookupOutcome,
};

/// Why a lookup was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    /// A lookup for the local identifier, populating the table.
    Bootstrap,
    /// A lookup for a random identifier in an idle bucket's range.
    Refresh,
}

/// A maintenance step the caller should carry out on the table's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a PING to the contact and report the outcome with the nonce.
    Ping { nonce: Nonce, contact: Knode },
    /// Run a node lookup for the target and report it with
    /// [`RoutingTable::lookup_completed`].
    Lookup { target: Kuid, kind: LookupKind },
}

#[derive(Debug, Clone)]
pub(crate) enum Purpose {
    // Liveness check of a routed contact.
    Alive,
    // The original holder of an identifier claimed by the candidate.
    Verify { candidate: Knode },
}

#[derive(Debug, Clone)]
pub(crate) struct PendingRpc {
    id: Kuid,
    addr: SocketAddr,
    purpose: Purpose,
    sent: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BootState {
    Idle,
    Running,
    Done,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    Alive,
    Refresh,
}

impl RoutingTable {
    /// Advances the maintenance clock: expires unanswered RPCs, bootstraps once there is someone
    /// to ask and runs the alive checks and refreshes that are due. Returns the resulting actions.
    pub fn tick(&mut self, now: OffsetDateTime) -> Vec<Action> {
        self.expire_rpcs(now);

        if self.boot == BootState::Idle && self.stats().good > 0 {
            self.bootstrap();
        }

        let mut due = Vec::new();
        for id in self.leaves() {
            let timers = self.buckets[id.0].timers;
            if let Some(at) = timers.alive.filter(|at| *at <= now) {
                due.push((at, id, Timer::Alive));
            }
            if let Some(at) = timers.refresh.filter(|at| *at <= now) {
                due.push((at, id, Timer::Refresh));
            }
        }
        due.sort_by_key(|(at, ..)| *at);

        for (_, b, timer) in due {
            // A bucket due earlier in the pass may have split this one.
            if !self.buckets[b.0].is_leaf() {
                continue;
            }

            match timer {
                Timer::Alive => self.alive_check(b, now),
                // Skipped if the alive check already forced one.
                Timer::Refresh => {
                    if self.buckets[b.0].timers.refresh.map_or(false, |at| at <= now) {
                        self.refresh(b, now);
                    }
                }
            }
        }

        self.drain_actions()
    }

    /// Takes the actions queued outside of [`RoutingTable::tick`], collision verifications and
    /// bootstrap requests.
    pub fn drain_actions(&mut self) -> Vec<Action> {
        self.outbox.drain(..).collect()
    }

    /// Queues a lookup for the local identifier. The more distant buckets are refreshed once it
    /// succeeds.
    pub fn bootstrap(&mut self) {
        if self.boot == BootState::Running {
            return;
        }

        debug!(id = %self.local_id, "bootstrapping routing table");
        self.boot = BootState::Running;
        self.outbox.push_back(Action::Lookup {
            target: self.local_id,
            kind: LookupKind::Bootstrap,
        });
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.boot == BootState::Done
    }

    /// Returns `true` if any of the table's RPCs was answered within the alive period.
    pub fn is_connected(&self, now: OffsetDateTime) -> bool {
        self.last_reply
            .map_or(false, |at| now - at <= self.config.alive())
    }

    /// Returns the current network size estimate, zero until a sample is taken.
    pub fn size_estimate(&self) -> Kuid {
        self.estimator.estimate()
    }

    /// Settles one of the table's RPCs with the contact that answered. Returns `false` if the
    /// nonce is unknown or already settled.
    pub fn rpc_reply(&mut self, nonce: Nonce, reply: Knode) -> bool {
        let rpc = match self.rpcs.remove(&nonce) {
            Some(rpc) => rpc,
            None => {
                trace!(nonce, "ignoring reply to an unknown rpc");
                return false;
            }
        };

        self.last_reply = Some(OffsetDateTime::now_utc());

        match rpc.purpose {
            Purpose::Alive => {
                if reply.id != rpc.id {
                    debug!(old = %rpc.id, new = %reply.id, addr = %rpc.addr, "contact changed identifier");
                    self.remove_node(&rpc.id);
                }
                self.record_traffic(reply);
            }
            Purpose::Verify { candidate } => {
                self.clear_verifying(&rpc.id);

                if reply.id == rpc.id && reply.addr == rpc.addr {
                    debug!(id = %rpc.id, addr = %rpc.addr, "original holder confirmed its identifier");
                    self.record_traffic(reply);
                } else {
                    if reply.id != rpc.id {
                        self.record_traffic(reply);
                    }
                    self.replace(candidate);
                }
            }
        }

        true
    }

    /// Settles one of the table's RPCs as unanswered. Returns `false` if the nonce is unknown or
    /// already settled.
    pub fn rpc_timeout(&mut self, nonce: Nonce) -> bool {
        let rpc = match self.rpcs.remove(&nonce) {
            Some(rpc) => rpc,
            None => return false,
        };

        match rpc.purpose {
            Purpose::Alive => {
                // The identifier may have moved to another address in the meantime.
                if self.get(&rpc.id).map(|kn| kn.addr) == Some(rpc.addr) {
                    self.node_timed_out(&rpc.id);
                }
            }
            Purpose::Verify { candidate } => {
                debug!(id = %rpc.id, addr = %rpc.addr, "original holder is silent");
                self.clear_verifying(&rpc.id);
                self.replace(candidate);
            }
        }

        true
    }

    /// Records an RPC timeout for the contact. Good contacts become stale; once the contact hits
    /// the timeout limit it is dropped, unless it can't be replaced.
    pub fn node_timed_out(&mut self, id: &Kuid) {
        let now = OffsetDateTime::now_utc();
        let b = self.find_bucket(id);
        let (k, max) = (self.config.k, self.config.max_timeouts);
        let connected = self.is_connected(now);

        let (status, timeouts) = match self.leaf_mut(b).and_then(|nodes| nodes.get_mut(id)) {
            Some(kn) => {
                kn.rpc_timeouts = kn.rpc_timeouts.saturating_add(1).min(max);
                kn.flags.alive = false;
                (kn.status, kn.rpc_timeouts)
            }
            None => return,
        };

        trace!(%id, timeouts, "rpc timeout");

        if status == Status::Good {
            self.set_status(id, Status::Stale);
        }

        if timeouts < max {
            return;
        }

        let replaceable = match self.leaf(b) {
            Some(nodes) => {
                status == Status::Pending
                    || nodes.len(List::Good) >= k
                    || (connected && nodes.len(List::Pending) > 0)
            }
            None => false,
        };

        if replaceable {
            debug!(%id, "dropping unresponsive contact");
            self.remove_node(id);
        } else {
            // Dead contacts stay until something can replace them.
            trace!(%id, "keeping unresponsive contact, nothing to replace it with");
        }
    }

    /// Records that a lookup for the target was started, postponing the refresh of the bucket
    /// covering it.
    pub fn notify_lookup(&mut self, target: &Kuid, now: OffsetDateTime) {
        let b = self.find_bucket(target);
        let next = now + self.jittered(self.refresh_period(b));

        let bucket = &mut self.buckets[b.0];
        bucket.last_lookup = Some(now);
        bucket.timers.refresh = Some(next);
    }

    /// Reports the end of a lookup. Successful lookups feed the size estimator; the local
    /// identifier's lookup completes the bootstrap.
    pub fn lookup_completed(&mut self, target: &Kuid, outcome: LookupOutcome, nodes: &[Knode]) {
        let now = OffsetDateTime::now_utc();

        if *target == self.local_id && self.boot == BootState::Running {
            if outcome.is_success() {
                info!(found = nodes.len(), "bootstrap complete");
                self.boot = BootState::Done;

                // Populate the rest of the table.
                for bucket in self.buckets.iter_mut() {
                    if bucket.is_leaf() && !bucket.ours {
                        bucket.timers.refresh = Some(now);
                    }
                }
            } else {
                debug!(?outcome, "bootstrap lookup failed");
                self.boot = BootState::Idle;
            }
        }

        if outcome == LookupOutcome::Ok && !nodes.is_empty() {
            let mut ids: Vec<Kuid> = nodes.iter().map(|kn| kn.id).collect();
            ids.sort_by(|a, b| target.cmp_distance(a, b));
            ids.dedup();
            ids.truncate(self.config.estimate_sample());

            self.estimator.record(target, &ids, now);
        }
    }

    /// Samples the network density around the local identifier from our own buckets.
    pub fn update_local_estimate(&mut self, now: OffsetDateTime) {
        let ids: Vec<Kuid> = self
            .fill_closest(&self.local_id, self.config.estimate_sample(), None)
            .iter()
            .map(|kn| kn.id)
            .collect();

        let local_id = self.local_id;
        self.estimator.record_local(&local_id, &ids, now);
    }

    // Another address claims a routed identifier: ask the original holder before believing it.
    pub(crate) fn verify_collision(&mut self, b: BucketId, candidate: Knode) -> EntryState {
        let held = match self
            .leaf_mut(b)
            .and_then(|nodes| nodes.get_mut(&candidate.id))
        {
            Some(held) => held,
            None => return self.add_node(candidate, true),
        };

        if held.flags.verifying {
            return EntryState::Verifying;
        }

        held.flags.verifying = true;
        let contact = held.clone();

        warn!(
            id = %candidate.id,
            held = %contact.addr,
            claimed = %candidate.addr,
            "identifier collision, verifying the original holder"
        );
        self.issue_ping(contact, Purpose::Verify { candidate }, OffsetDateTime::now_utc());

        EntryState::Verifying
    }

    fn clear_verifying(&mut self, id: &Kuid) {
        let b = self.find_bucket(id);
        if let Some(kn) = self.leaf_mut(b).and_then(|nodes| nodes.get_mut(id)) {
            kn.flags.verifying = false;
        }
    }

    // Hands the identifier over to the candidate's address, or forgets it if the candidate's
    // network is already at its quota in the leaf.
    fn replace(&mut self, candidate: Knode) {
        let b = self.find_bucket(&candidate.id);
        let max_per_class_c = self.config.max_per_class_c;
        let over_quota = self.leaf(b).map_or(false, |nodes| {
            nodes.get(&candidate.id).map_or(false, |held| {
                held.network() != candidate.network()
                    && nodes.network_count(&candidate.network()) >= max_per_class_c
            })
        });

        if over_quota {
            debug!(id = %candidate.id, addr = %candidate.addr, "network quota reached, dropping contested identifier");
            self.remove_node(&candidate.id);
            return;
        }

        let readdressed = self
            .leaf_mut(b)
            .map_or(false, |nodes| nodes.readdress(&candidate));

        debug!(id = %candidate.id, addr = %candidate.addr, readdressed, "identifier taken over");
        self.record_traffic(candidate);
    }

    fn expire_rpcs(&mut self, now: OffsetDateTime) {
        let timeout = self.config.rpc_timeout;
        let expired: Vec<Nonce> = self
            .rpcs
            .iter()
            .filter(|(_, rpc)| now - rpc.sent >= timeout)
            .map(|(nonce, _)| *nonce)
            .collect();

        for nonce in expired {
            self.rpc_timeout(nonce);
        }
    }

    fn has_rpc_for(&self, id: &Kuid) -> bool {
        self.rpcs.values().any(|rpc| rpc.id == *id)
    }

    fn issue_ping(&mut self, contact: Knode, purpose: Purpose, now: OffsetDateTime) {
        let nonce: Nonce = thread_rng().gen();

        let b = self.find_bucket(&contact.id);
        if let Some(kn) = self.leaf_mut(b).and_then(|nodes| nodes.get_mut(&contact.id)) {
            kn.last_sent = Some(now);
        }

        self.rpcs.insert(
            nonce,
            PendingRpc {
                id: contact.id,
                addr: contact.addr,
                purpose,
                sent: now,
            },
        );
        self.outbox.push_back(Action::Ping { nonce, contact });
    }

    fn alive_check(&mut self, b: BucketId, now: OffsetDateTime) {
        let k = self.config.k;
        let alive_period = self.config.alive();
        let next = now + self.jittered(alive_period);
        self.buckets[b.0].timers.alive = Some(next);

        // Fill the gap with pending contacts, most recently seen first.
        let promote: Vec<Kuid> = match self.leaf(b) {
            Some(nodes) => {
                let gap = k.saturating_sub(nodes.len(List::Good) + nodes.len(List::Stale));
                nodes
                    .iter(List::Pending)
                    .rev()
                    .filter(|kn| !kn.flags.shutdowning)
                    .take(gap)
                    .map(|kn| kn.id)
                    .collect()
            }
            None => return,
        };
        for id in promote {
            self.set_status(&id, Status::Good);
        }

        let good = self.leaf(b).map_or(0, |nodes| nodes.len(List::Good));
        let refreshed = self.buckets[b.0].last_lookup.map_or(false, |at| at >= now);
        if good < k / 2 && !refreshed {
            trace!(depth = self.buckets[b.0].depth, good, "bucket running low, forcing refresh");
            self.refresh(b, now);
        }

        let targets: Vec<Knode> = match self.leaf(b) {
            Some(nodes) => {
                let good = nodes
                    .iter(List::Good)
                    .filter(|kn| now - kn.last_seen >= alive_period);
                let stale = nodes
                    .iter(List::Stale)
                    .filter(|kn| kn.can_recontact(now));
                let pending = nodes
                    .iter(List::Pending)
                    .filter(|kn| kn.flags.shutdowning && kn.can_recontact(now));

                good.chain(stale)
                    .chain(pending)
                    .filter(|kn| !self.has_rpc_for(&kn.id))
                    .cloned()
                    .collect()
            }
            None => return,
        };

        if !targets.is_empty() {
            debug!(
                depth = self.buckets[b.0].depth,
                count = targets.len(),
                "checking contacts are alive"
            );
        }
        for contact in targets {
            self.issue_ping(contact, Purpose::Alive, now);
        }

        if self.buckets[b.0].ours {
            self.update_local_estimate(now);
        }
    }

    fn refresh(&mut self, b: BucketId, now: OffsetDateTime) {
        let next = now + self.jittered(self.refresh_period(b));
        self.buckets[b.0].timers.refresh = Some(next);

        let full = self
            .leaf(b)
            .map_or(false, |nodes| nodes.len(List::Good) >= self.config.k);
        if full && !self.is_splitable(b) {
            trace!(depth = self.buckets[b.0].depth, "bucket is full, skipping refresh");
            return;
        }

        let bucket = &mut self.buckets[b.0];
        let target = Kuid::random_within(&bucket.prefix, bucket.depth as usize);
        bucket.last_lookup = Some(now);

        debug!(depth = bucket.depth, %target, "refreshing bucket");
        self.outbox.push_back(Action::Lookup {
            target,
            kind: LookupKind::Refresh,
        });
    }
}
