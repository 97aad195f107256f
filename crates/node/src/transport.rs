//! TCP peer transport.
//!
//! One accept thread per listener, one handler thread per connection. The
//! handler runs the handshake, announces the peer, then loops on the frame
//! decoder. Message frames are stamped with the remote address and pushed
//! onto a bounded queue; a stream frame parks the read loop on the peer's
//! gate so the application can read the raw bytes off the connection itself,
//! resuming only when `close_stream` is called.
//!
//! ## Thread Safety
//!
//! A `TcpPeer` is shared as `Arc` between its read-loop thread and the
//! application. Reads and writes go through `&TcpStream`, which is safe to
//! use from several threads; during a stream handoff the read loop is parked,
//! so the application is the only reader.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use mesh_proto::{Frame, FrameDecoder};

/// Capacity of the inbound frame queue. Senders block when it is full.
const INBOUND_QUEUE_CAP: usize = 1024;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake rejected: {0}")]
    Rejected(String),
}

/// Peer admission check run before a connection enters the read loop.
/// A rejection closes the connection immediately.
pub trait Handshake: Send + Sync {
    fn verify(&self, peer: &TcpPeer) -> Result<(), HandshakeError>;
}

/// Default handshake: admits every connection without any exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Handshake for AcceptAll {
    fn verify(&self, _peer: &TcpPeer) -> Result<(), HandshakeError> {
        Ok(())
    }
}

/// Per-peer barrier parking the read loop during a raw stream handoff.
/// Exactly one `release` matches each `begin`.
#[derive(Debug, Default)]
struct StreamGate {
    pending: Mutex<u32>,
    cv: Condvar,
}

impl StreamGate {
    fn begin(&self) {
        *self.pending.lock() += 1;
    }

    fn wait(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.cv.wait(&mut pending);
        }
    }

    fn release(&self) {
        let mut pending = self.pending.lock();
        if *pending > 0 {
            *pending -= 1;
        }
        self.cv.notify_all();
    }
}

/// A live connection to another node.
#[derive(Debug)]
pub struct TcpPeer {
    stream: TcpStream,
    remote_addr: SocketAddr,
    outbound: bool,
    gate: StreamGate,
}

impl TcpPeer {
    fn new(stream: TcpStream, outbound: bool) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        Ok(TcpPeer {
            stream,
            remote_addr,
            outbound,
            gate: StreamGate::default(),
        })
    }

    /// Remote address; also the peer's key in the peer set.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether this side initiated the connection.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Write bytes straight to the connection.
    pub fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut stream = &self.stream;
        stream.write_all(bytes)
    }

    /// Release the read loop after the raw bytes of a stream handoff have
    /// been consumed. Must be called exactly once per handoff.
    pub fn close_stream(&self) {
        self.gate.release();
    }

    fn park_for_stream(&self) {
        self.gate.begin();
        self.gate.wait();
    }
}

/// Raw read-through: during a stream handoff the application reads the
/// connection directly via the peer.
impl Read for &TcpPeer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = &self.stream;
        stream.read(buf)
    }
}

impl Write for &TcpPeer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = &self.stream;
        stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut stream = &self.stream;
        stream.flush()
    }
}

/// Callback invoked once per admitted peer. An error closes the connection.
pub type OnPeer = Arc<dyn Fn(Arc<TcpPeer>) -> mesh_common::Result<()> + Send + Sync>;

pub struct TcpTransportOpts {
    /// Address to listen on. A bare `":3000"` form is accepted.
    pub listen_addr: String,
    pub handshake: Arc<dyn Handshake>,
    pub decoder: Arc<dyn FrameDecoder>,
}

/// State shared with the accept loop and every connection thread.
struct Shared {
    handshake: Arc<dyn Handshake>,
    decoder: Arc<dyn FrameDecoder>,
    on_peer: Mutex<Option<OnPeer>>,
    frame_tx: SyncSender<Frame>,
    closed: AtomicBool,
}

/// Listener + dialer with one thread per connection.
pub struct TcpTransport {
    listen_addr: String,
    shared: Arc<Shared>,
    frame_rx: Mutex<Option<Receiver<Frame>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Fill in a default host for addresses given as `":port"`.
fn with_default_host(addr: &str, host: &str) -> String {
    if addr.starts_with(':') {
        format!("{}{}", host, addr)
    } else {
        addr.to_string()
    }
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Self {
        let (frame_tx, frame_rx) = sync_channel(INBOUND_QUEUE_CAP);
        TcpTransport {
            listen_addr: opts.listen_addr,
            shared: Arc::new(Shared {
                handshake: opts.handshake,
                decoder: opts.decoder,
                on_peer: Mutex::new(None),
                frame_tx,
                closed: AtomicBool::new(false),
            }),
            frame_rx: Mutex::new(Some(frame_rx)),
            local_addr: Mutex::new(None),
        }
    }

    /// Install the new-peer callback. Done after construction so the owner
    /// of the transport can capture its own state in the closure.
    pub fn set_on_peer<F>(&self, f: F)
    where
        F: Fn(Arc<TcpPeer>) -> mesh_common::Result<()> + Send + Sync + 'static,
    {
        *self.shared.on_peer.lock() = Some(Arc::new(f));
    }

    /// The configured listen address.
    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// The actual bound address, available once `listen_and_accept` has run.
    /// Useful when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Take the receiving side of the inbound frame queue. Yields `Some`
    /// exactly once; the queue has a single consumer.
    pub fn consume(&self) -> Option<Receiver<Frame>> {
        self.frame_rx.lock().take()
    }

    /// Bind the listen address and start accepting connections on a
    /// dedicated thread.
    pub fn listen_and_accept(&self) -> io::Result<()> {
        let listener = TcpListener::bind(with_default_host(&self.listen_addr, "0.0.0.0"))?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);

        let shared = Arc::clone(&self.shared);
        thread::spawn(move || Shared::accept_loop(shared, listener));

        info!("transport listening on {}", local);
        Ok(())
    }

    /// Open an outbound connection and hand it to a connection thread.
    pub fn dial(&self, addr: &str) -> io::Result<()> {
        let stream = TcpStream::connect(with_default_host(addr, "127.0.0.1"))?;
        let shared = Arc::clone(&self.shared);
        thread::spawn(move || Shared::handle_conn(shared, stream, true));
        Ok(())
    }

    /// Stop accepting new connections. Connections already established keep
    /// running until their own I/O fails.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        // Wake the accept loop so it observes the flag.
        if let Some(addr) = self.local_addr() {
            let _ = TcpStream::connect(addr);
        }
    }
}

impl Shared {
    fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if shared.closed.load(Ordering::SeqCst) {
                        debug!("listener closed, stopping accept loop");
                        return;
                    }
                    debug!("accepted connection from {}", addr);
                    let shared = Arc::clone(&shared);
                    thread::spawn(move || Shared::handle_conn(shared, stream, false));
                }
                Err(e) => {
                    if shared.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    warn!("accept error: {}", e);
                }
            }
        }
    }

    fn handle_conn(shared: Arc<Shared>, stream: TcpStream, outbound: bool) {
        let peer = match TcpPeer::new(stream, outbound) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                debug!("dropping connection before handshake: {}", e);
                return;
            }
        };

        if let Err(e) = shared.handshake.verify(&peer) {
            debug!("dropping peer {}: {}", peer.remote_addr(), e);
            return;
        }

        let on_peer = shared.on_peer.lock().clone();
        if let Some(on_peer) = on_peer {
            if let Err(e) = on_peer(Arc::clone(&peer)) {
                warn!("peer {} rejected: {}", peer.remote_addr(), e);
                return;
            }
        }

        loop {
            let mut reader: &TcpPeer = &peer;
            let mut frame = match shared.decoder.decode(&mut reader) {
                Ok(f) => f,
                Err(e) => {
                    debug!("dropping peer connection {}: {}", peer.remote_addr(), e);
                    return;
                }
            };
            frame.from = peer.remote_addr().to_string();

            if frame.stream {
                debug!("incoming stream from {}, pausing read loop", peer.remote_addr());
                peer.park_for_stream();
                debug!("stream from {} closed, resuming read loop", peer.remote_addr());
                continue;
            }

            if shared.frame_tx.send(frame).is_err() {
                // Consumer is gone; nothing left to deliver to.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_proto::{TagDecoder, INCOMING_MESSAGE};
    use std::time::Duration;

    fn new_transport(listen_addr: &str) -> Arc<TcpTransport> {
        Arc::new(TcpTransport::new(TcpTransportOpts {
            listen_addr: listen_addr.to_string(),
            handshake: Arc::new(AcceptAll),
            decoder: Arc::new(TagDecoder),
        }))
    }

    #[test]
    fn test_listen_and_accept_binds() {
        let t = new_transport("127.0.0.1:0");
        assert_eq!(t.listen_addr(), "127.0.0.1:0");
        t.listen_and_accept().expect("listen");
        assert!(t.local_addr().is_some());
        t.close();
    }

    #[test]
    fn test_consume_is_take_once() {
        let t = new_transport("127.0.0.1:0");
        assert!(t.consume().is_some());
        assert!(t.consume().is_none());
    }

    #[test]
    fn test_dial_delivers_frames() {
        let listener = new_transport("127.0.0.1:0");
        let frames = listener.consume().expect("queue");

        let accepted: Arc<Mutex<Vec<Arc<TcpPeer>>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let accepted = Arc::clone(&accepted);
            listener.set_on_peer(move |peer| {
                accepted.lock().push(peer);
                Ok(())
            });
        }
        listener.listen_and_accept().expect("listen");
        let addr = listener.local_addr().expect("bound").to_string();

        let dialed: Arc<Mutex<Vec<Arc<TcpPeer>>>> = Arc::new(Mutex::new(Vec::new()));
        let dialer = new_transport("127.0.0.1:0");
        {
            let dialed = Arc::clone(&dialed);
            dialer.set_on_peer(move |peer| {
                dialed.lock().push(peer);
                Ok(())
            });
        }
        dialer.dial(&addr).expect("dial");

        // Let both connection threads run handshake + on_peer.
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(accepted.lock().len(), 1);
        assert_eq!(dialed.lock().len(), 1);

        let peer = dialed.lock()[0].clone();
        assert!(peer.is_outbound());
        peer.send(&[INCOMING_MESSAGE]).expect("send tag");
        peer.send(b"ping").expect("send payload");

        let frame = frames
            .recv_timeout(Duration::from_secs(2))
            .expect("frame delivered");
        assert!(!frame.stream);
        assert_eq!(frame.payload, b"ping");
        assert!(!frame.from.is_empty());

        listener.close();
        dialer.close();
    }

    #[test]
    fn test_stream_gate_release_matches_acquire() {
        let gate = StreamGate::default();
        gate.begin();

        let done = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(gate);
        let waiter = {
            let gate = Arc::clone(&gate);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                gate.wait();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst), "waiter must stay parked");

        gate.release();
        waiter.join().expect("join");
        assert!(done.load(Ordering::SeqCst));
    }
}
