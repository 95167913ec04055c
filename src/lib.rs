//! A Kademlia routing table implemented as a binary tree of k-buckets.
//!
//! Contacts are kept in leaf buckets split on demand along the local identifier's path, as in
//! the [Kademlia paper](https://pdos.csail.mit.edu/~petar/papers/maymounkov-kademlia-lncs.pdf),
//! with a few refinements:
//!
//! 1. Each bucket keeps three lists: good contacts, stale ones that missed an RPC, and pending
//!    replacements learnt from traffic while the bucket was full.
//! 2. Buckets close to the local identifier are split past the strict Kademlia rule, keeping a
//!    finer resolution where lookups converge.
//! 3. A contact is never dropped unless something can replace it, so a node cut off from the
//!    network keeps its table.
//! 4. Another address claiming a routed identifier is only believed once the original holder
//!    fails to answer.
//!
//! The table performs no I/O: maintenance steps are returned as [`Action`]s from
//! [`RoutingTable::tick`] and their outcome is reported back. With the `sync` feature,
//! [`SyncRoutingTable`] drives them over a [`Transport`].
//!
//! The table also estimates the network size from the density of contacts around lookup targets,
//! see [`SizeEstimator`].

#![cfg_attr(doc_cfg, feature(doc_cfg))]

#[cfg(feature = "codec")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "codec")))]
pub mod codec;
pub mod error;
pub mod estimate;
pub mod persist;

mod core;
mod table;

pub use crate::{
    core::{
        config::{Config, Mode, K},
        knode::{is_bogon, network_prefix, Flags, Knode, Status, VendorCode, Version},
        kuid::Kuid,
        message,
        traits::{LookupOutcome, Transport},
    },
    estimate::SizeEstimator,
    table::{
        Action, BucketId, BucketInfo, EntryState, LookupKind, Rejection, RoutingTable, Stats,
    },
};

#[cfg(feature = "sync")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
pub use crate::table::sync::{Maintenance, SyncRoutingTable};
