use crate::{Result, SessionError};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;
use tracing::debug;

/// Encode samples as an in-memory 16-bit PCM WAV file
///
/// # Arguments
/// * `samples` - Audio samples (f32, range -1.0 to 1.0)
/// * `sample_rate` - Sample rate in Hz
/// * `channels` - Number of channels
pub fn encode_wav(samples: &[f32], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec).map_err(|e| {
            SessionError::AudioProcessingError(format!("Failed to create WAV writer: {}", e))
        })?;

        for &sample in samples {
            let sample_i16 = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer.write_sample(sample_i16).map_err(|e| {
                SessionError::AudioProcessingError(format!("Failed to write sample: {}", e))
            })?;
        }

        writer.finalize().map_err(|e| {
            SessionError::AudioProcessingError(format!("Failed to finalize WAV data: {}", e))
        })?;
    }

    let bytes = cursor.into_inner();
    debug!("Encoded {} samples into {} WAV bytes", samples.len(), bytes.len());
    Ok(bytes)
}

/// Read samples from an in-memory WAV file
///
/// # Returns
/// * Tuple of (samples, sample_rate, channels)
pub fn read_wav_bytes(bytes: &[u8]) -> Result<(Vec<f32>, u32, u16)> {
    let mut reader = WavReader::new(Cursor::new(bytes))
        .map_err(|e| SessionError::DecodeError(format!("Failed to read WAV header: {}", e)))?;

    let spec = reader.spec();
    let read_err = |e: hound::Error| SessionError::DecodeError(format!("Failed to read sample: {}", e));

    let samples: Result<Vec<f32>> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, _) => reader.samples::<f32>().map(|s| s.map_err(read_err)).collect(),
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32).map_err(read_err))
            .collect(),
        (SampleFormat::Int, 24) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 8_388_607.0).map_err(read_err))
            .collect(),
        (SampleFormat::Int, 32) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / i32::MAX as f32).map_err(read_err))
            .collect(),
        (_, bits) => {
            return Err(SessionError::DecodeError(format!(
                "Unsupported bits per sample: {}",
                bits
            )))
        }
    };

    Ok((samples?, spec.sample_rate, spec.channels))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_in_memory() {
        let samples: Vec<f32> = (0..16000)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 16000.0).sin() * 0.5)
            .collect();

        let bytes = encode_wav(&samples, 16000, 1).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");

        let (read_samples, sample_rate, channels) = read_wav_bytes(&bytes).unwrap();
        assert_eq!(sample_rate, 16000);
        assert_eq!(channels, 1);
        assert_eq!(read_samples.len(), samples.len());

        for (original, read) in samples.iter().zip(read_samples.iter()) {
            assert!((original - read).abs() < 0.001);
        }
    }

    #[test]
    fn test_empty_recording_is_valid_wav() {
        let bytes = encode_wav(&[], 48000, 1).unwrap();
        let (samples, sample_rate, _) = read_wav_bytes(&bytes).unwrap();
        assert!(samples.is_empty());
        assert_eq!(sample_rate, 48000);
    }

    #[test]
    fn test_rejects_non_wav() {
        assert!(read_wav_bytes(b"definitely not a wav").is_err());
    }
}
