//! Length-prefixed framing for the mirror stream's TCP transport.
//!
//! Wire format: `[u32 length (big-endian)][u8 kind][payload]`.
//! Kind 0 is a UTF-8 text frame (control-plane message batches), kind 1
//! a binary frame (bulk-data updates). The length covers the payload
//! only.

use std::io::{self, Read, Write};

/// One transport frame, text or binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

const KIND_TEXT: u8 = 0;
const KIND_BINARY: u8 = 1;

/// Write a frame to a stream.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    let (kind, payload): (u8, &[u8]) = match frame {
        Frame::Text(text) => (KIND_TEXT, text.as_bytes()),
        Frame::Binary(bytes) => (KIND_BINARY, bytes),
    };

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&[kind])?;
    writer.write_all(payload)?;
    writer.flush()?;

    Ok(())
}

/// Read a frame from a stream.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    // Sanity check: reject frames larger than 100MB
    if len > 100_000_000 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", len),
        ));
    }

    let mut kind_buf = [0u8; 1];
    reader.read_exact(&mut kind_buf)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    match kind_buf[0] {
        KIND_TEXT => String::from_utf8(payload)
            .map(Frame::Text)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        KIND_BINARY => Ok(Frame::Binary(payload)),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown frame kind: {}", other),
        )),
    }
}
