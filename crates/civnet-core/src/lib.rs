//! civnet-core
//!
//! Shared vocabulary for civnet nodes: peer identifiers, self-describing
//! multiaddresses, discovery records and the protocol constants every other
//! crate agrees on.

pub mod constants;
pub mod error;
pub mod multiaddr;
pub mod record;
pub mod types;

pub use constants::*;
pub use error::PeerIdError;
pub use multiaddr::{parse as parse_multiaddr, Multiaddr, MultiaddrError, MultiaddrExt, Protocol};
pub use record::{DiscoverySource, PeerRecord};
pub use types::*;
