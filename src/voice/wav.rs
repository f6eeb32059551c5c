//! WAV container helpers for raw PCM16 mono audio

use std::path::Path;

use crate::{Error, Result};

fn pcm16_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Wrap little-endian PCM16 bytes in a WAV container
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, pcm16_spec(sample_rate))?;
        for pair in pcm.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Write little-endian PCM16 bytes to a WAV file
///
/// # Errors
///
/// Returns error if the file cannot be written
pub fn write_wav(path: &Path, pcm: &[u8], sample_rate: u32) -> Result<()> {
    std::fs::write(path, pcm_to_wav(pcm, sample_rate)?)?;
    Ok(())
}

/// Read a PCM16 mono WAV file as little-endian bytes plus its sample rate
///
/// # Errors
///
/// Returns error if the file is not 16-bit mono PCM
pub fn read_wav(path: &Path) -> Result<(Vec<u8>, u32)> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels != 1
        || spec.bits_per_sample != 16
        || spec.sample_format != hound::SampleFormat::Int
    {
        return Err(Error::Config(format!(
            "{} must be 16-bit mono PCM (got {} ch, {} bit)",
            path.display(),
            spec.channels,
            spec.bits_per_sample
        )));
    }

    let mut pcm = Vec::with_capacity(reader.len() as usize * 2);
    for sample in reader.samples::<i16>() {
        pcm.extend_from_slice(&sample?.to_le_bytes());
    }
    Ok((pcm, spec.sample_rate))
}
