//! Gzip helpers for frame payloads

use std::io::{Read, Write};

use flate2::Compression as Level;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use super::FrameError;

/// Gzip-compress a payload
///
/// An empty input still produces a valid (non-empty) gzip member, which is what
/// the terminal audio frame carries.
///
/// # Errors
///
/// Returns error if the encoder fails to flush
pub fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Level::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflate a gzip payload
///
/// # Errors
///
/// Returns `FrameError::Decompress` if the payload is not valid gzip
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| FrameError::Decompress(e.to_string()))?;
    Ok(out)
}
