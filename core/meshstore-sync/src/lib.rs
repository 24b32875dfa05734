//! Peer-to-peer replication for meshstore.
//!
//! Nodes replicate by exchanging rows of each other's change log over plain
//! TCP. There is no coordinator: every node accepts connections, dials its
//! configured peers, and pushes whatever the peer has not yet acknowledged.
//!
//! # Sync Process
//!
//! 1. **Hello**: both sides announce their stable node name
//! 2. **Setup**: both sides report their log high-water mark and how far they
//!    have read the other's log, which also detects logs that were reset
//! 3. **Push**: each side streams `Update`s in serial order, closing every
//!    batch with a `Checkpoint` carrying the last serial covered
//! 4. **Apply**: updates are merged last-writer-wins and the checkpoint is
//!    persisted as the resume point for the next connection
//!
//! Rows a node just received from a peer are never pushed back to that same
//! peer.

mod error;
pub mod p2p;
pub mod protocol;

pub use error::{SyncError, SyncResult};
pub use p2p::{
    ConnectionConfig, ConnectionState, HandshakeOutcome, NodeConfig, PeerInfo, SyncCodec,
    SyncConnection, SyncNode,
};
pub use protocol::{Checkpoint, Hello, MessageType, Setup, SyncMessage, Update, WireMessage};
