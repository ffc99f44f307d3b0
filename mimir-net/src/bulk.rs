//! Decoder for the binary bulk-data channel.
//!
//! Every binary frame starts with the target cell's id as a 4-byte
//! little-endian unsigned integer; the rest is laid out per the cell's
//! declared [`BulkFormat`]. Frames are decoded into a single `Vec<f32>`
//! with no per-sample allocation.

use mimir_types::{BulkFormat, ObjectId};

use crate::protocol::ProtocolError;

/// Metadata preceding the sample array of a bulk frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BulkInfo {
    Spectrum { center_freq: f64, sample_rate: f32 },
    Scope { sample_rate: f64 },
}

/// One decoded bulk update: metadata plus the sample array.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkChunk {
    pub info: BulkInfo,
    pub samples: Vec<f32>,
}

/// Extract the target cell id from a binary frame.
pub fn frame_target(frame: &[u8]) -> Result<ObjectId, ProtocolError> {
    let bytes: [u8; 4] = frame
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| {
            ProtocolError::BadFrame(format!("frame shorter than id header: {} bytes", frame.len()))
        })?;
    Ok(ObjectId::new(u32::from_le_bytes(bytes) as u64))
}

/// Decode the payload following the id header.
pub fn decode_payload(format: BulkFormat, payload: &[u8]) -> Result<BulkChunk, ProtocolError> {
    match format {
        BulkFormat::SpectrumByte => decode_spectrum_byte(payload),
        BulkFormat::ScopeFloat => decode_scope_float(payload),
    }
}

/// f64 center frequency, f32 sample rate, f32 zero offset, then signed
/// bytes; each sample is `raw - offset`.
fn decode_spectrum_byte(payload: &[u8]) -> Result<BulkChunk, ProtocolError> {
    if payload.len() < 16 {
        return Err(ProtocolError::BadFrame(format!(
            "spectrum header needs 16 bytes, got {}",
            payload.len()
        )));
    }
    let center_freq = f64::from_le_bytes(payload[0..8].try_into().unwrap());
    let sample_rate = f32::from_le_bytes(payload[8..12].try_into().unwrap());
    let offset = f32::from_le_bytes(payload[12..16].try_into().unwrap());

    let samples = payload[16..]
        .iter()
        .map(|&raw| raw as i8 as f32 - offset)
        .collect();

    Ok(BulkChunk {
        info: BulkInfo::Spectrum {
            center_freq,
            sample_rate,
        },
        samples,
    })
}

/// f64 sample rate, then raw little-endian f32 samples.
fn decode_scope_float(payload: &[u8]) -> Result<BulkChunk, ProtocolError> {
    if payload.len() < 8 {
        return Err(ProtocolError::BadFrame(format!(
            "scope header needs 8 bytes, got {}",
            payload.len()
        )));
    }
    let sample_rate = f64::from_le_bytes(payload[0..8].try_into().unwrap());

    let body = &payload[8..];
    let chunks = body.chunks_exact(4);
    if !chunks.remainder().is_empty() {
        return Err(ProtocolError::BadFrame(format!(
            "scope sample array truncated: {} trailing bytes",
            chunks.remainder().len()
        )));
    }
    let samples = chunks
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Ok(BulkChunk {
        info: BulkInfo::Scope { sample_rate },
        samples,
    })
}
