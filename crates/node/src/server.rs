//! File server: the node's orchestrator.
//!
//! Owns the peer set, the local blob store, and the event loop draining the
//! transport's frame queue. Exposes the two network operations (`put`
//! replicates a blob to every peer, `get` pulls one out of the network) and
//! serves the corresponding inbound requests from remote peers.
//!
//! ## Replication flow
//!
//! ```text
//! put:  local write ──► StoreFile{origin, md5(key), size+16} to all peers
//!                   ──► 0x02 + IV + AES-CTR ciphertext to all peers
//! get:  local miss  ──► GetFile{origin, md5(key)} to all peers
//!                   ◄── 0x02 + LE i64 size + raw blob bytes from holders
//! ```
//!
//! Blobs pushed by peers are stored in their encrypted wire form under the
//! origin's namespace; blobs pulled via `get` are decrypted on ingest. The
//! short sleeps after each broadcast give receivers time to switch into
//! stream mode; ordering on a single connection is what actually keeps the
//! metadata ahead of the bytes.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info, warn};

use mesh_common::crypto::{encrypt_stream, generate_node_id, hash_key, CryptoError, IV_LEN};
use mesh_proto::{
    decode_message, encode_message, ControlMessage, Frame, TagDecoder, INCOMING_MESSAGE,
    INCOMING_STREAM,
};
use mesh_storage::{BlobStore, StoreError};

use crate::transport::{AcceptAll, TcpPeer, TcpTransport, TcpTransportOpts};

/// Settle time between a StoreFile broadcast and the stream bytes.
const BROADCAST_SETTLE: Duration = Duration::from_millis(5);

/// Window for peers holding a requested blob to begin streaming it back.
const RESPONSE_WINDOW: Duration = Duration::from_millis(500);

/// How often the event loop checks the shutdown flag while idle.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("peer {0} not in peer set")]
    UnknownPeer(String),

    #[error("blob {key_hash} requested by {from} is not on disk")]
    MissingBlob { from: String, key_hash: String },
}

type PeerMap = Mutex<HashMap<String, Arc<TcpPeer>>>;

pub struct FileServerOpts {
    /// Node identity; generated when absent.
    pub id: Option<String>,
    /// 32-byte AES key used for replication streams.
    pub enc_key: Vec<u8>,
    /// Root directory of the local blob store.
    pub storage_root: PathBuf,
    /// Peer transport listen address.
    pub listen_addr: String,
    /// Peers to dial at startup. Empty entries are skipped.
    pub bootstrap: Vec<String>,
}

pub struct FileServer {
    id: String,
    enc_key: Vec<u8>,
    store: BlobStore,
    transport: Arc<TcpTransport>,
    frames: Mutex<Option<Receiver<Frame>>>,
    bootstrap: Vec<String>,
    peers: Arc<PeerMap>,
    shutdown: AtomicBool,
}

impl FileServer {
    pub fn new(opts: FileServerOpts) -> Self {
        let id = opts.id.unwrap_or_else(generate_node_id);

        let transport = Arc::new(TcpTransport::new(TcpTransportOpts {
            listen_addr: opts.listen_addr,
            handshake: Arc::new(AcceptAll),
            decoder: Arc::new(TagDecoder),
        }));

        let peers: Arc<PeerMap> = Arc::new(Mutex::new(HashMap::new()));
        {
            let peers = Arc::clone(&peers);
            transport.set_on_peer(move |peer| {
                let addr = peer.remote_addr().to_string();
                peers.lock().insert(addr.clone(), peer);
                info!("connected with remote {}", addr);
                Ok(())
            });
        }

        let frames = transport.consume();

        FileServer {
            id,
            enc_key: opts.enc_key,
            store: BlobStore::new(opts.storage_root),
            transport,
            frames: Mutex::new(frames),
            bootstrap: opts.bootstrap,
            peers,
            shutdown: AtomicBool::new(false),
        }
    }

    /// This node's identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Actual transport address once the listener is up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Bring the node up: listen, dial the bootstrap peers, then block in
    /// the event loop until [`stop`](Self::stop).
    pub fn start(&self) -> Result<(), ServerError> {
        info!("[{}] starting file server", self.transport.listen_addr());
        self.transport.listen_and_accept()?;
        self.bootstrap_network();
        self.event_loop();
        Ok(())
    }

    /// Ask the event loop to shut down. Returns immediately.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn bootstrap_network(&self) {
        for addr in &self.bootstrap {
            if addr.is_empty() {
                continue;
            }
            let transport = Arc::clone(&self.transport);
            let addr = addr.clone();
            thread::spawn(move || {
                info!("attempting to connect with remote {}", addr);
                if let Err(e) = transport.dial(&addr) {
                    warn!("dial {} failed: {}", addr, e);
                }
            });
        }
    }

    fn event_loop(&self) {
        let frames = match self.frames.lock().take() {
            Some(rx) => rx,
            None => {
                error!("frame queue already taken; refusing to start a second event loop");
                return;
            }
        };

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match frames.recv_timeout(SHUTDOWN_POLL) {
                Ok(frame) => {
                    let msg = match decode_message(&frame.payload) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!("decoding error from {}: {}", frame.from, e);
                            continue;
                        }
                    };
                    if let Err(e) = self.handle_message(&frame.from, msg) {
                        warn!("handle message error: {}", e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!("[{}] file server stopped", self.id);
        self.transport.close();
    }

    fn snapshot_peers(&self) -> Vec<Arc<TcpPeer>> {
        self.peers.lock().values().cloned().collect()
    }

    fn lookup_peer(&self, from: &str) -> Result<Arc<TcpPeer>, ServerError> {
        self.peers
            .lock()
            .get(from)
            .cloned()
            .ok_or_else(|| ServerError::UnknownPeer(from.to_string()))
    }

    /// Send a control message to every peer: one sentinel byte, then the
    /// encoded message, in order on each connection.
    fn broadcast(&self, msg: &ControlMessage) -> Result<(), ServerError> {
        let encoded = encode_message(msg);
        for peer in self.snapshot_peers() {
            peer.send(&[INCOMING_MESSAGE])?;
            peer.send(&encoded)?;
        }
        Ok(())
    }

    /// Store a blob locally and replicate it, encrypted, to every peer.
    pub fn put(&self, key: &str, r: &mut dyn Read) -> Result<(), ServerError> {
        let mut file_buf = Vec::new();
        let size = {
            let mut tee = TeeReader::new(r, &mut file_buf);
            self.store.write(&self.id, key, &mut tee)?
        };

        let msg = ControlMessage::StoreFile {
            origin: self.id.clone(),
            key_hash: hash_key(key),
            // The receiver reads size bytes raw: IV plus ciphertext.
            size: size as i64 + IV_LEN as i64,
        };
        self.broadcast(&msg)?;

        thread::sleep(BROADCAST_SETTLE);

        let peers = self.snapshot_peers();
        let mut fan = FanOutWriter::new(&peers);
        fan.write_all(&[INCOMING_STREAM])?;
        let n = encrypt_stream(&self.enc_key, &mut file_buf.as_slice(), &mut fan)?;

        info!(
            "[{}] stored {} locally, streamed {} bytes to {} peers",
            self.id, key, n, peers.len()
        );
        Ok(())
    }

    /// Fetch a blob: from local disk when present, otherwise from whichever
    /// peers hold it. The blob ends up on local disk either way and the open
    /// file is returned.
    ///
    /// A peer that was asked but never streams a response leaves this call
    /// blocked on its connection; there is no per-operation timeout.
    pub fn get(&self, key: &str) -> Result<File, ServerError> {
        if self.store.has(&self.id, key) {
            info!("[{}] serving {} from local disk", self.id, key);
            let (_, f) = self.store.read(&self.id, key)?;
            return Ok(f);
        }

        info!("[{}] {} not on local disk, fetching from the network", self.id, key);
        self.broadcast(&ControlMessage::GetFile {
            origin: self.id.clone(),
            key_hash: hash_key(key),
        })?;

        thread::sleep(RESPONSE_WINDOW);

        for peer in self.snapshot_peers() {
            // Size prefix first, then exactly that many encrypted bytes.
            let mut reader: &TcpPeer = &peer;
            let mut size_buf = [0u8; 8];
            reader.read_exact(&mut size_buf)?;
            let file_size = i64::from_le_bytes(size_buf);

            let mut limited = reader.take(file_size.max(0) as u64);
            let n = self.store.write_decrypt(&self.enc_key, &self.id, key, &mut limited)?;
            info!(
                "[{}] received {} bytes over the network from {}",
                self.id,
                n,
                peer.remote_addr()
            );
            peer.close_stream();
        }

        let (_, f) = self.store.read(&self.id, key)?;
        Ok(f)
    }

    /// Remove the local copy of a blob. Peers holding replicas are not told.
    pub fn delete(&self, key: &str) -> Result<(), ServerError> {
        Ok(self.store.delete(&self.id, key)?)
    }

    /// Whether a blob exists on local disk.
    pub fn has(&self, key: &str) -> bool {
        self.store.has(&self.id, key)
    }

    fn handle_message(&self, from: &str, msg: ControlMessage) -> Result<(), ServerError> {
        match msg {
            ControlMessage::StoreFile {
                origin,
                key_hash,
                size,
            } => self.handle_store_file(from, &origin, &key_hash, size),
            ControlMessage::GetFile { origin, key_hash } => {
                self.handle_get_file(from, &origin, &key_hash)
            }
        }
    }

    /// A peer is about to stream `size` bytes for us to hold. The bytes are
    /// the encrypted wire form and are stored as-is under the origin's
    /// namespace.
    fn handle_store_file(
        &self,
        from: &str,
        origin: &str,
        key_hash: &str,
        size: i64,
    ) -> Result<(), ServerError> {
        let peer = self.lookup_peer(from)?;

        let reader: &TcpPeer = &peer;
        let mut limited = reader.take(size.max(0) as u64);
        let n = self.store.write(origin, key_hash, &mut limited)?;
        info!("[{}] written {} bytes to disk for {}", self.id, n, origin);

        peer.close_stream();
        Ok(())
    }

    /// A peer wants a blob back. Stream it raw: sentinel, LE i64 size, then
    /// the file bytes exactly as they are on disk.
    fn handle_get_file(&self, from: &str, origin: &str, key_hash: &str) -> Result<(), ServerError> {
        if !self.store.has(origin, key_hash) {
            return Err(ServerError::MissingBlob {
                from: from.to_string(),
                key_hash: key_hash.to_string(),
            });
        }

        info!("[{}] serving {} over the network", self.id, key_hash);
        let (size, mut file) = self.store.read(origin, key_hash)?;

        let peer = self.lookup_peer(from)?;
        peer.send(&[INCOMING_STREAM])?;
        peer.send(&(size as i64).to_le_bytes())?;
        let mut writer: &TcpPeer = &peer;
        let n = io::copy(&mut file, &mut writer)?;

        info!("[{}] written {} bytes over the network to {}", self.id, n, from);
        Ok(())
    }
}

/// Mirrors everything read from `inner` into `copy`, so a blob can be
/// written locally and replayed to peers without re-reading the source.
struct TeeReader<'a> {
    inner: &'a mut dyn Read,
    copy: &'a mut Vec<u8>,
}

impl<'a> TeeReader<'a> {
    fn new(inner: &'a mut dyn Read, copy: &'a mut Vec<u8>) -> Self {
        TeeReader { inner, copy }
    }
}

impl Read for TeeReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.copy.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// Writes each chunk to every peer in turn. Write errors surface the first
/// failing peer.
struct FanOutWriter<'a> {
    peers: &'a [Arc<TcpPeer>],
}

impl<'a> FanOutWriter<'a> {
    fn new(peers: &'a [Arc<TcpPeer>]) -> Self {
        FanOutWriter { peers }
    }
}

impl Write for FanOutWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for peer in self.peers {
            let mut writer: &TcpPeer = peer;
            writer.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
