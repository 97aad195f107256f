//! # Meshstore Common Crate
//!
//! Shared building blocks for the meshstore node:
//! - `cas`: content-addressed path mapping (key → nested on-disk path)
//! - `crypto`: node identities, wire key hashing, AES-256-CTR stream codec
//! - `config`: TOML node configuration

pub mod cas;
pub mod config;
pub mod crypto;

pub use cas::{cas_path, CasPath};
pub use crypto::{decrypt_stream, encrypt_stream, generate_key, generate_node_id, hash_key, CryptoError};

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
