//! Foundational and often-reused types.

pub(crate) mod config;
pub(crate) mod knode;
pub(crate) mod kuid;
pub mod message;
pub(crate) mod traits;
