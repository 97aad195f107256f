//! # Meshstore Node Crate
//!
//! The running node: TCP peer transport plus the file server that owns the
//! peer set, the local blob store, and the put/get operations.

pub mod server;
pub mod transport;

pub use server::{FileServer, FileServerOpts, ServerError};
pub use transport::{
    AcceptAll, Handshake, HandshakeError, TcpPeer, TcpTransport, TcpTransportOpts,
};
