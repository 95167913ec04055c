use std::{net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use time::OffsetDateTime;
use tokio::{
    task::{JoinHandle, JoinSet},
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, trace};

use super::{Action, EntryState, RoutingTable};
use crate::core::{
    config::Config,
    knode::Knode,
    kuid::Kuid,
    message::Message,
    traits::Transport,
};

// Used if the configured RPC timeout can't be represented as a std duration.
const FALLBACK_RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
#[derive(Debug, Default, Clone)]
/// A routing table implementation suitable for use in async contexts.
///
/// It wraps [`RoutingTable`] behind a lock and can drive its maintenance over a [`Transport`].
pub struct SyncRoutingTable {
    routing_table: Arc<RwLock<RoutingTable>>,
}

impl From<RoutingTable> for SyncRoutingTable {
    fn from(routing_table: RoutingTable) -> Self {
        Self {
            routing_table: Arc::new(RwLock::new(routing_table)),
        }
    }
}

impl SyncRoutingTable {
    pub fn new(local_id: Kuid, config: Config) -> Self {
        RoutingTable::new(local_id, config).into()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, RoutingTable> {
        self.routing_table.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, RoutingTable> {
        self.routing_table.write()
    }

    pub fn local_id(&self) -> Kuid {
        self.routing_table.read().local_id()
    }

    pub fn record_traffic(&self, kn: Knode) -> EntryState {
        self.routing_table.write().record_traffic(kn)
    }

    pub fn fill_closest(&self, target: &Kuid, k: usize) -> Vec<Knode> {
        self.routing_table.read().fill_closest(target, k, None)
    }

    pub fn size_estimate(&self) -> Kuid {
        self.routing_table.read().size_estimate()
    }

    pub fn process_message(&self, message: Message, source: SocketAddr) -> Option<Message> {
        self.routing_table.write().process_message(message, source)
    }

    /// Spawns a task ticking the table every `period` and carrying out the resulting actions over
    /// the transport. Must be called from within a tokio runtime.
    pub fn spawn_maintenance<T: Transport>(&self, transport: T, period: Duration) -> Maintenance {
        let driver = tokio::spawn(drive(self.clone(), transport, period));

        Maintenance {
            table: self.clone(),
            driver,
        }
    }
}

/// A handle to the maintenance task of a [`SyncRoutingTable`].
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
#[derive(Debug)]
pub struct Maintenance {
    table: SyncRoutingTable,
    driver: JoinHandle<()>,
}

impl Maintenance {
    pub fn is_running(&self) -> bool {
        !self.driver.is_finished()
    }

    /// Stops the task, cancelling the RPCs and lookups in flight, and shuts the table down.
    pub async fn shutdown(self) {
        self.driver.abort();
        if let Err(e) = self.driver.await {
            if !e.is_cancelled() {
                debug!("maintenance task failed: {e}");
            }
        }

        self.table.write().shutdown();
    }
}

async fn drive<T: Transport>(table: SyncRoutingTable, transport: T, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Dropping the set aborts whatever is still running.
    let mut inflight = JoinSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (actions, rpc_timeout) = {
                    // Scope the lock.
                    let mut rt = table.write();
                    (rt.tick(OffsetDateTime::now_utc()), rt.config().rpc_timeout)
                };
                let rpc_timeout = Duration::try_from(rpc_timeout).unwrap_or(FALLBACK_RPC_TIMEOUT);

                if !actions.is_empty() {
                    trace!(count = actions.len(), "carrying out maintenance actions");
                }
                for action in actions {
                    inflight.spawn(perform(table.clone(), transport.clone(), action, rpc_timeout));
                }
            }
            Some(result) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = result {
                    debug!("maintenance task failed: {e}");
                }
            }
        }
    }
}

async fn perform<T: Transport>(
    table: SyncRoutingTable,
    transport: T,
    action: Action,
    rpc_timeout: Duration,
) {
    match action {
        Action::Ping { nonce, contact } => {
            match timeout(rpc_timeout, transport.ping(contact)).await {
                Ok(Some(reply)) => {
                    table.write().rpc_reply(nonce, reply);
                }
                _ => {
                    table.write().rpc_timeout(nonce);
                }
            }
        }
        Action::Lookup { target, kind } => {
            table
                .write()
                .notify_lookup(&target, OffsetDateTime::now_utc());
            trace!(%target, ?kind, "starting lookup");

            let (outcome, nodes) = transport.find_node(target).await;
            table.write().lookup_completed(&target, outcome, &nodes);
        }
    }
}
