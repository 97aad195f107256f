//! Local blob store.
//!
//! Keys are mapped through the CAS path mapper, so the store never sees a
//! caller key as a filename. Writes create parent directories on demand and
//! truncate any existing file; there is no rollback for a write that fails
//! midway. Reads hand the open file back to the caller, who owns the handle.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use mesh_common::cas::cas_path;
use mesh_common::crypto::{decrypt_stream, CryptoError};

/// Root directory used when the caller does not supply one.
pub const DEFAULT_ROOT: &str = "meshstore";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Content-addressed blob store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Create a store rooted at `root`. Falls back to [`DEFAULT_ROOT`] when
    /// given an empty path. The directory is created lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let mut root = root.into();
        if root.as_os_str().is_empty() {
            root = PathBuf::from(DEFAULT_ROOT);
        }
        BlobStore { root }
    }

    fn blob_path(&self, id: &str, key: &str) -> PathBuf {
        self.root.join(id).join(cas_path(key).full_path())
    }

    /// Whether a blob exists for `key` in node `id`'s namespace.
    /// Any stat failure reads as absence.
    pub fn has(&self, id: &str, key: &str) -> bool {
        fs::metadata(self.blob_path(id, key)).is_ok()
    }

    fn open_for_writing(&self, id: &str, key: &str) -> Result<File, StoreError> {
        let p = cas_path(key);
        let dir = self.root.join(id).join(&p.path);
        fs::create_dir_all(&dir)?;
        Ok(File::create(dir.join(&p.filename))?)
    }

    /// Stream `r` to EOF into the blob for `key`, creating or truncating it.
    /// Returns the number of bytes written.
    pub fn write(&self, id: &str, key: &str, r: &mut dyn Read) -> Result<u64, StoreError> {
        let mut f = self.open_for_writing(id, key)?;
        Ok(io::copy(r, &mut f)?)
    }

    /// As [`write`](Self::write), but `r` carries an encrypted transfer:
    /// a 16-byte IV followed by AES-256-CTR ciphertext. The plaintext lands
    /// on disk; the returned count includes the IV.
    pub fn write_decrypt(
        &self,
        enc_key: &[u8],
        id: &str,
        key: &str,
        r: &mut dyn Read,
    ) -> Result<u64, StoreError> {
        let mut f = self.open_for_writing(id, key)?;
        Ok(decrypt_stream(enc_key, r, &mut f)?)
    }

    /// Open the blob for reading. Returns its size together with the open
    /// file; the caller is responsible for the handle.
    pub fn read(&self, id: &str, key: &str) -> Result<(u64, File), StoreError> {
        let file = File::open(self.blob_path(id, key))?;
        let size = file.metadata()?.len();
        Ok((size, file))
    }

    /// Remove the subtree holding `key`. Note this removes the whole
    /// first-segment prefix directory, taking any blob whose digest shares
    /// the same leading 5 hex chars with it. A missing path is not an error.
    pub fn delete(&self, id: &str, key: &str) -> Result<(), StoreError> {
        let p = cas_path(key);
        let subtree = self.root.join(id).join(p.first_dir());
        match fs::remove_dir_all(&subtree) {
            Ok(()) => {
                debug!("removed {} from disk", p.filename);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the entire store root.
    pub fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_common::crypto::{encrypt_stream, generate_key, generate_node_id};
    use tempfile::TempDir;

    fn new_store() -> (TempDir, BlobStore) {
        let tmp = TempDir::new().expect("tmpdir");
        let store = BlobStore::new(tmp.path());
        (tmp, store)
    }

    #[test]
    fn test_blob_lifecycle() {
        let (_tmp, store) = new_store();
        let id = generate_node_id();

        for i in 0..50 {
            let key = format!("foo_{}", i);
            let data = b"some jpg bytes";

            let n = store.write(&id, &key, &mut data.as_slice()).expect("write");
            assert_eq!(n, data.len() as u64);
            assert!(store.has(&id, &key), "expected to have key {}", key);

            let (size, mut f) = store.read(&id, &key).expect("read");
            assert_eq!(size, data.len() as u64);
            let mut back = Vec::new();
            f.read_to_end(&mut back).expect("read_to_end");
            assert_eq!(back, data);

            store.delete(&id, &key).expect("delete");
            assert!(!store.has(&id, &key), "expected to NOT have key {}", key);
        }
    }

    #[test]
    fn test_has_on_empty_store() {
        let (_tmp, store) = new_store();
        assert!(!store.has("someid", "missing"));
    }

    #[test]
    fn test_read_missing_blob_fails() {
        let (_tmp, store) = new_store();
        assert!(store.read("someid", "missing").is_err());
    }

    #[test]
    fn test_delete_missing_is_ok() {
        let (_tmp, store) = new_store();
        store.delete("someid", "missing").expect("delete of absent key");
    }

    #[test]
    fn test_write_truncates_existing() {
        let (_tmp, store) = new_store();
        let id = generate_node_id();

        store.write(&id, "k", &mut b"a longer first version".as_slice()).expect("write 1");
        store.write(&id, "k", &mut b"short".as_slice()).expect("write 2");

        let (size, mut f) = store.read(&id, "k").expect("read");
        assert_eq!(size, 5);
        let mut back = Vec::new();
        f.read_to_end(&mut back).expect("read_to_end");
        assert_eq!(back, b"short");
    }

    #[test]
    fn test_write_decrypt_restores_plaintext() {
        let (_tmp, store) = new_store();
        let id = generate_node_id();
        let enc_key = generate_key();
        let data = b"my big data file here!";

        let mut wire = Vec::new();
        encrypt_stream(&enc_key, &mut data.as_slice(), &mut wire).expect("encrypt");

        let n = store
            .write_decrypt(&enc_key, &id, "remote", &mut wire.as_slice())
            .expect("write_decrypt");
        assert_eq!(n, (data.len() + 16) as u64);

        let (size, mut f) = store.read(&id, "remote").expect("read");
        assert_eq!(size, data.len() as u64);
        let mut back = Vec::new();
        f.read_to_end(&mut back).expect("read_to_end");
        assert_eq!(back, data);
    }

    #[test]
    fn test_node_id_partitions_namespace() {
        let (_tmp, store) = new_store();

        store.write("node-a", "shared", &mut b"from a".as_slice()).expect("write a");
        assert!(store.has("node-a", "shared"));
        assert!(!store.has("node-b", "shared"));

        store.write("node-b", "shared", &mut b"from b".as_slice()).expect("write b");
        let (_, mut f) = store.read("node-a", "shared").expect("read a");
        let mut back = Vec::new();
        f.read_to_end(&mut back).expect("read_to_end");
        assert_eq!(back, b"from a");
    }

    #[test]
    fn test_clear_removes_root() {
        let (tmp, store) = new_store();
        let id = generate_node_id();

        store.write(&id, "k", &mut b"bytes".as_slice()).expect("write");
        store.clear().expect("clear");
        assert!(!store.has(&id, "k"));
        assert!(!tmp.path().join(&id).exists());
    }
}
