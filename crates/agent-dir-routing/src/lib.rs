//! Agent Directory Routing Library
//!
//! The distributed discovery plane: a sled-backed label index, a libp2p host
//! carrying the Kademlia provider records and the gossip mesh, and the search
//! engine composing both.
//!
//! # Modules
//!
//! - [`index`]: Label index over sled
//! - [`gossip`]: Label announcement wire format and protocol constants
//! - [`net`]: libp2p peer host (DHT, gossipsub, identify)
//! - [`routing`]: Publish/unpublish façade and the gossip receive loop
//! - [`search`]: Remote discovery stream

pub mod gossip;
pub mod index;
pub mod net;
pub mod routing;
pub mod search;

pub use gossip::{LabelAnnouncement, LABEL_TOPIC, MAX_ANNOUNCEMENT_BYTES, MAX_ANNOUNCEMENT_LABELS};
pub use index::{IndexEntry, LabelIndex, ListMatch, ScoredMatch};
pub use net::{Network, NetworkConfig};
pub use routing::{index_writer, spawn_receive_loop, Routing};
pub use search::SearchHit;
