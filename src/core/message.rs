//! RPC contract message types.

use std::net::SocketAddr;

#[cfg(feature = "codec")]
use bincode::{Decode, Encode};

use crate::core::kuid::Kuid;

pub type Nonce = u128;

/// Routing message variants.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub enum Message {
    /// PING messages require a PONG response, used to check contact liveness and to verify an
    /// identifier is still held by an address.
    Ping(Ping),
    /// PONG is the correct response to PING, it must contain the same NONCE.
    Pong(Pong),

    /// FIND_NODE messages ask a peer for the contacts it knows closest to a target.
    FindNode(FindNode),
    /// NODES is the correct response to FIND_NODE, it must contain the same NONCE.
    Nodes(Nodes),
}

impl Message {
    pub fn variant_as_str(&self) -> &str {
        match self {
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::FindNode(_) => "find_node",
            Message::Nodes(_) => "nodes",
        }
    }

    pub fn nonce(&self) -> Nonce {
        match self {
            Message::Ping(ping) => ping.nonce,
            Message::Pong(pong) => pong.nonce,
            Message::FindNode(find_node) => find_node.nonce,
            Message::Nodes(nodes) => nodes.nonce,
        }
    }

    /// The identifier of the node that sent the message.
    pub fn sender(&self) -> Kuid {
        match self {
            Message::Ping(ping) => ping.id,
            Message::Pong(pong) => pong.id,
            Message::FindNode(find_node) => find_node.id,
            Message::Nodes(nodes) => nodes.id,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Message::Pong(_) | Message::Nodes(_))
    }
}

/// The data making up a PING message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct Ping {
    pub nonce: Nonce,
    pub id: Kuid,
}

/// The data making up a PONG message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct Pong {
    pub nonce: Nonce,
    pub id: Kuid,
    /// The responder's network size estimate in compact big-endian form.
    pub estimate: Vec<u8>,
}

/// The data making up a FIND_NODE message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct FindNode {
    pub nonce: Nonce,
    pub id: Kuid,
    pub target: Kuid,
}

/// The data making up a NODES message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct Nodes {
    pub nonce: Nonce,
    pub id: Kuid,
    pub nodes: Vec<(Kuid, SocketAddr)>,
}
