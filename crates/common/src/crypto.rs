//! Crypto helpers: node identity generation, wire-level key hashing, and the
//! AES-256-CTR stream codec used when replicating blobs between peers.
//!
//! Wire format of an encrypted transfer:
//!
//! ```text
//! ┌──────────────┬─────────────────────────────┐
//! │ IV (16 bytes)│  ciphertext (= |plaintext|) │
//! └──────────────┴─────────────────────────────┘
//! ```
//!
//! The IV is generated fresh per transfer and counted in every byte total
//! this module reports, so a transfer of N plaintext bytes is N + 16 bytes
//! on the wire.

use std::io::{Read, Write};

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// AES block size; also the IV length prepended to every encrypted stream.
pub const IV_LEN: usize = 16;

/// Working buffer for the streaming XOR passes.
const COPY_BUF_LEN: usize = 32 * 1024;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, found {found}")]
    InvalidKeyLength { expected: usize, found: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Generate a fresh node identity: 32 random bytes rendered as 64 lowercase
/// hex characters. Stable for the node's lifetime.
pub fn generate_node_id() -> String {
    let mut buf = [0u8; 32];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Generate a random AES-256 key. Key distribution between nodes is not
/// handled here; see the config layer.
pub fn generate_key() -> Vec<u8> {
    let mut buf = vec![0u8; KEY_LEN];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Hash a caller-supplied key into the identifier used on the wire and in
/// peers' stores. MD5 is not collision-resistant; it is used as a compact
/// content label, not for security.
pub fn hash_key(key: &str) -> String {
    let digest = Md5::digest(key.as_bytes());
    hex::encode(digest)
}

fn new_cipher(key: &[u8], iv: &[u8; IV_LEN]) -> Result<Aes256Ctr, CryptoError> {
    Aes256Ctr::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_LEN,
        found: key.len(),
    })
}

/// Pump `src` through the keystream into `dst` in 32 KiB chunks.
/// The returned total starts at `IV_LEN` so both directions report
/// IV-inclusive byte counts.
fn copy_stream(
    cipher: &mut Aes256Ctr,
    src: &mut dyn Read,
    dst: &mut dyn Write,
) -> Result<u64, CryptoError> {
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut written = IV_LEN as u64;

    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n])?;
        written += n as u64;
    }

    Ok(written)
}

/// Encrypt `src` into `dst`: emit a random 16-byte IV, then the CTR
/// ciphertext. Returns the total bytes emitted (IV included).
pub fn encrypt_stream(
    key: &[u8],
    src: &mut dyn Read,
    dst: &mut dyn Write,
) -> Result<u64, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut cipher = new_cipher(key, &iv)?;

    dst.write_all(&iv)?;
    copy_stream(&mut cipher, src, dst)
}

/// Decrypt `src` into `dst`: read exactly 16 IV bytes, then CTR-decrypt the
/// remainder. A short IV read is fatal. Returns the total bytes processed
/// (IV included).
pub fn decrypt_stream(
    key: &[u8],
    src: &mut dyn Read,
    dst: &mut dyn Write,
) -> Result<u64, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    src.read_exact(&mut iv)?;

    let mut cipher = new_cipher(key, &iv)?;
    copy_stream(&mut cipher, src, dst)
}
