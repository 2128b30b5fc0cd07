use crate::error::{Error, Result};
use eyre::bail;
use hound::{SampleFormat, WavReader};
use std::path::Path;

pub const SAMPLE_RATE: u32 = 16000;

/// Reads a 16 kHz mono 16-bit WAV file.
pub fn read_wav<P: AsRef<Path>>(file_path: P) -> eyre::Result<(Vec<i16>, u32)> {
    let mut reader = WavReader::open(file_path)?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 || spec.sample_format != SampleFormat::Int {
        bail!(
            "Expected mono 16-bit PCM, got {} channel(s) of {}-bit {:?}",
            spec.channels,
            spec.bits_per_sample,
            spec.sample_format
        );
    }
    if spec.sample_rate != SAMPLE_RATE {
        bail!("The sample rate must be {SAMPLE_RATE}, got {}", spec.sample_rate);
    }
    let samples: Vec<i16> = reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok((samples, spec.sample_rate))
}

/// Decodes little-endian 16-bit mono PCM.
pub fn pcm16_from_bytes(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(Error::InvalidAudio(format!(
            "PCM buffer has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    #[test]
    fn decodes_little_endian_pairs() {
        let samples = pcm16_from_bytes(&[0x01, 0x00, 0xff, 0xff, 0x00, 0x80]).unwrap();
        assert_eq!(samples, vec![1, -1, i16::MIN]);
    }

    #[test]
    fn odd_length_is_rejected() {
        assert!(matches!(pcm16_from_bytes(&[0, 1, 2]), Err(Error::InvalidAudio(_))));
    }

    fn write_wav(path: &Path, spec: WavSpec, samples: &[i16]) {
        let mut writer = WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn reads_mono_16k() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        write_wav(&path, spec, &[3, -4, 5]);
        let (samples, rate) = read_wav(&path).unwrap();
        assert_eq!(samples, vec![3, -4, 5]);
        assert_eq!(rate, SAMPLE_RATE);
    }

    #[test]
    fn rejects_other_sample_rates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        write_wav(&path, spec, &[0; 8]);
        assert!(read_wav(&path).is_err());
    }
}
