pub mod bootstrap;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod firewall;
pub mod flood;
mod handlers;
pub mod identifier;
pub mod index;
pub mod node;
pub mod persistence;
pub mod protocol;
pub mod routing;
pub mod search;
pub mod transport;

pub use bootstrap::{BootstrapSource, SeedNode, StaticBootstrap};
pub use collaborators::{
    Collaborators, ConnectionHandler, ContentIndex, MessageSink, NoopCollaborator,
    PartialFileSource, ValueStore,
};
pub use config::DhtConfig;
pub use engine::DhtEngine;
pub use identifier::{Cid, Distance, Tth};
pub use index::Source;
pub use node::{Node, NodeSnapshot};
pub use persistence::{JsonFileStore, MemoryStore, PersistError, SledStore, SnapshotStore};
pub use protocol::{AdcCommand, CommandTag, InfType, ProtocolError};
pub use routing::RoutingTable;
pub use search::{SearchKind, SearchOutcome};
pub use transport::{MemoryTransport, Transport, TransportError, UdpTransport};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("No nodes available to start a search")]
    NoCandidates,

    #[error("A search with token '{0}' is already running")]
    DuplicateSearch(String),

    #[error("Engine is not running")]
    NotRunning,

    #[error("Unknown node: {0}")]
    UnknownNode(Cid),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/*
 * Kademlia-style DHT for ADC file-sharing peers
 *
 * Peers are addressed by 192-bit client identifiers and talk plain ADC
 * commands over UDP. The engine keeps:
 *
 * 1. A routing table of known peers bucketed by XOR distance
 * 2. Iterative lookups for nodes, file sources and publish targets
 * 3. Passive reachability (firewall) detection
 * 4. Periodic snapshots of the routing table
 */
