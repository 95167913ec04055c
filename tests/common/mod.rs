#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use kadtree::{Knode, Kuid};
use tracing_subscriber::{fmt, EnvFilter};

pub fn enable_tracing() {
    fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

/// An address on its own /24 for every index, so network quotas never interfere.
pub fn addr(i: u32) -> SocketAddr {
    let [_, a, b, c] = i.to_be_bytes();
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10 + a, b, c, 1)), 6346)
}

/// An identifier in the upper half of the space, far from [`Kuid::ZERO`].
pub fn far_id(low: u64) -> Kuid {
    Kuid::from_u64(low).with_bit(0)
}

pub fn knode(id: Kuid, i: u32) -> Knode {
    Knode::new(id, addr(i))
}

#[cfg(feature = "sync")]
pub use transport::MockTransport;

#[cfg(feature = "sync")]
mod transport {
    use std::{
        future::Future,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
    };

    use kadtree::{Knode, Kuid, LookupOutcome, Transport};

    /// Answers every RPC from memory.
    #[derive(Clone, Default)]
    pub struct MockTransport {
        pub responsive: Arc<AtomicBool>,
        pub pings: Arc<AtomicUsize>,
        pub lookups: Arc<AtomicUsize>,
        // Returned by lookups, closest to the target first.
        pub peers: Arc<Vec<Knode>>,
    }

    impl MockTransport {
        pub fn responsive(peers: Vec<Knode>) -> Self {
            Self {
                responsive: Arc::new(AtomicBool::new(true)),
                peers: Arc::new(peers),
                ..Default::default()
            }
        }

        pub fn unresponsive() -> Self {
            Self::default()
        }
    }

    impl Transport for MockTransport {
        fn ping(&self, contact: Knode) -> impl Future<Output = Option<Knode>> + Send {
            self.pings.fetch_add(1, Ordering::SeqCst);
            let responsive = self.responsive.load(Ordering::SeqCst);

            async move { responsive.then_some(contact) }
        }

        fn find_node(
            &self,
            target: Kuid,
        ) -> impl Future<Output = (LookupOutcome, Vec<Knode>)> + Send {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let mut nodes = self.peers.as_ref().clone();
            nodes.sort_by(|a, b| target.cmp_distance(a.id(), b.id()));

            async move {
                if nodes.is_empty() {
                    (LookupOutcome::Timeout, nodes)
                } else {
                    (LookupOutcome::Ok, nodes)
                }
            }
        }
    }
}
