//! # Meshstore Storage Crate
//!
//! On-disk blob persistence. Blobs live under
//! `root/<node-id>/<cas path>/<digest>`; the node-id segment partitions the
//! namespace so several simulated nodes can share one physical root.

pub mod store;

pub use store::{BlobStore, StoreError, DEFAULT_ROOT};
