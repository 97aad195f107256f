//! Frame decoders: turn raw connection bytes into [`Frame`]s.
//!
//! The production decoder is [`TagDecoder`]: one tag byte picks between a
//! message frame and a raw-stream handoff. [`BincodeDecoder`] is an
//! alternative that reads self-describing encoded frames; it is kept for
//! experiments and is not wired into the production transport.

use std::io::{self, Read};

use crate::message::{Frame, INCOMING_STREAM};

/// Largest message payload consumed in a single read. Control messages are
/// tens of bytes; anything longer than one read's worth is truncated.
const MAX_MESSAGE_READ: usize = 1028;

/// Reads one frame off a connection. Implementations are chosen at
/// transport construction.
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, r: &mut dyn Read) -> io::Result<Frame>;
}

/// Default tag-dispatched decoder.
///
/// - `0x2` tag → stream frame with empty payload; the caller reads the
///   connection directly from here on.
/// - any other tag → up to [`MAX_MESSAGE_READ`] bytes from a single read
///   become the payload. The tag byte itself is discarded.
/// - a zero-byte tag read is swallowed and yields an empty frame rather
///   than an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagDecoder;

impl FrameDecoder for TagDecoder {
    fn decode(&self, r: &mut dyn Read) -> io::Result<Frame> {
        let mut tag = [0u8; 1];
        let n = r.read(&mut tag)?;
        if n == 0 {
            return Ok(Frame::default());
        }

        if tag[0] == INCOMING_STREAM {
            return Ok(Frame {
                stream: true,
                ..Frame::default()
            });
        }

        let mut buf = vec![0u8; MAX_MESSAGE_READ];
        let n = r.read(&mut buf)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.truncate(n);

        Ok(Frame {
            payload: buf,
            ..Frame::default()
        })
    }
}

/// Alternative decoder that expects whole frames in self-describing bincode
/// form. Not used by the production transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeDecoder;

impl FrameDecoder for BincodeDecoder {
    fn decode(&self, r: &mut dyn Read) -> io::Result<Frame> {
        bincode::deserialize_from(r).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
