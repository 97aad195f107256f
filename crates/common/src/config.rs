//! Node configuration loaded from TOML.
//! Every field is optional; consumers fall back to generated identities and
//! the default storage root when a value is absent.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::crypto::KEY_LEN;
use crate::Result;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Optional pre-set node id (64 hex chars). Generated when absent.
    pub node_id: Option<String>,

    /// Listen address for the peer transport (e.g. ":3000" or "0.0.0.0:3000").
    pub listen_addr: Option<String>,

    /// Peer addresses to dial at startup. Empty entries are skipped.
    pub bootstrap: Option<Vec<String>>,

    /// Root directory for blob storage.
    pub storage_root: Option<String>,

    /// 32-byte AES key as 64 hex chars. Nodes that should replicate to each
    /// other must be provisioned with the same key; when absent a key is
    /// generated and the node can only read its own blobs.
    pub enc_key_hex: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: None,
            listen_addr: Some("127.0.0.1:3000".to_string()),
            bootstrap: Some(Vec::new()),
            storage_root: Some("meshstore".to_string()),
            enc_key_hex: None,
        }
    }
}

impl Config {
    /// Decode the provisioned encryption key, if any.
    /// Rejects values that are not exactly 32 bytes of hex.
    pub fn enc_key(&self) -> Result<Option<Vec<u8>>> {
        match &self.enc_key_hex {
            None => Ok(None),
            Some(h) => {
                let key = hex::decode(h)?;
                if key.len() != KEY_LEN {
                    return Err(format!(
                        "enc_key_hex must decode to {} bytes, got {}",
                        KEY_LEN,
                        key.len()
                    )
                    .into());
                }
                Ok(Some(key))
            }
        }
    }
}

/// Load config from a TOML file path.
/// A missing file or a parse failure is an error.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
    let s = fs::read_to_string(path.as_ref())?;
    let cfg: Config = toml::from_str(&s)?;
    Ok(cfg)
}
