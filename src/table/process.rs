use std::net::SocketAddr;

use tracing::trace;

use super::RoutingTable;
use crate::core::{
    knode::{is_bogon, Knode},
    message::{FindNode, Message, Nodes, Ping, Pong},
};

impl RoutingTable {
    /// Processes a peer's message: the sender is recorded as traffic, replies settle the table's
    /// own RPCs. If the message is a query, the response to send back is returned.
    pub fn process_message(&mut self, message: Message, source: SocketAddr) -> Option<Message> {
        let sender = Knode::new(message.sender(), source);
        trace!(kind = message.variant_as_str(), %source, "processing message");

        match message {
            Message::Ping(ping) => {
                self.record_traffic(sender);
                Some(Message::Pong(self.process_ping(ping)))
            }
            Message::Pong(pong) => {
                if !self.rpc_reply(pong.nonce, sender.clone()) {
                    self.record_traffic(sender);
                }
                None
            }
            Message::FindNode(find_node) => {
                self.record_traffic(sender);
                Some(Message::Nodes(self.process_find_node(find_node)))
            }
            Message::Nodes(nodes) => {
                self.record_traffic(sender);
                self.process_nodes(nodes);
                None
            }
        }
    }

    fn process_ping(&self, ping: Ping) -> Pong {
        Pong {
            nonce: ping.nonce,
            id: self.local_id,
            estimate: self.size_estimate().to_compact_bytes(),
        }
    }

    fn process_find_node(&self, find_node: FindNode) -> Nodes {
        let nodes = self
            .fill_closest(&find_node.target, self.config.k, Some(&find_node.id))
            .into_iter()
            .map(|kn| (kn.id, kn.addr))
            .collect();

        Nodes {
            nonce: find_node.nonce,
            id: self.local_id,
            nodes,
        }
    }

    // Contacts learnt second-hand are only kept if there is room for them.
    fn process_nodes(&mut self, nodes: Nodes) {
        for (id, addr) in nodes.nodes {
            if is_bogon(&addr) {
                trace!(%addr, "ignoring unroutable contact");
                continue;
            }

            self.add_node(Knode::new(id, addr), false);
        }
    }
}
