use std::future::Future;

use crate::core::{knode::Knode, kuid::Kuid};

/// The completion code of a node lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    /// The lookup converged.
    Ok,
    /// The lookup ended before converging, some of the returned nodes may not be the closest.
    Partial,
    /// No node answered in time.
    Timeout,
    /// The lookup was abandoned.
    Cancelled,
}

impl LookupOutcome {
    /// Returns `true` if the lookup produced usable results.
    pub fn is_success(&self) -> bool {
        matches!(self, LookupOutcome::Ok | LookupOutcome::Partial)
    }
}

/// The network side the routing table relies on: liveness RPCs and node lookups.
///
/// Kadtree doesn't make any assumptions about the wire format or the transport protocol, it only
/// expects every call to eventually resolve. A ping resolves to the contact that answered, as seen
/// by the transport, or `None` if no valid answer came back; the maintenance driver applies its
/// own timeout on top.
pub trait Transport: Clone + Send + Sync + 'static {
    /// Sends a PING to the contact's address.
    fn ping(&self, contact: Knode) -> impl Future<Output = Option<Knode>> + Send;

    /// Runs an iterative lookup for the target and returns the contacts found, closest first.
    fn find_node(&self, target: Kuid) -> impl Future<Output = (LookupOutcome, Vec<Knode>)> + Send;
}
