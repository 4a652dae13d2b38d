//! Decoding of buffered speech bytes into PCM frames

use crate::{Result, SessionError};
use rodio::Source;
use std::io::Cursor;
use std::time::Duration;

/// One decoded audio unit
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Interleaved samples in -1.0..=1.0
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Playback length of this unit
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() as u64 / self.channels as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Turns one contiguous byte region into audio
pub trait AudioDecoder: Send {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio>;
}

/// Decoder backed by rodio (WAV, MP3, FLAC, Vorbis)
#[derive(Debug, Default, Clone, Copy)]
pub struct RodioDecoder;

impl AudioDecoder for RodioDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio> {
        let decoder = rodio::Decoder::new(Cursor::new(bytes.to_vec()))
            .map_err(|e| SessionError::DecodeError(format!("Unrecognized audio data: {}", e)))?;

        let sample_rate = decoder.sample_rate();
        let channels = decoder.channels();
        let samples: Vec<f32> = decoder.convert_samples::<f32>().collect();

        if samples.is_empty() {
            return Err(SessionError::DecodeError(format!(
                "No audio frames in {} bytes",
                bytes.len()
            )));
        }

        Ok(DecodedAudio::new(samples, sample_rate, channels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::encode_wav;

    #[test]
    fn test_duration() {
        let audio = DecodedAudio::new(vec![0.0; 32000], 16000, 2);
        assert_eq!(audio.duration(), Duration::from_secs(1));

        let silent = DecodedAudio::new(Vec::new(), 0, 1);
        assert_eq!(silent.duration(), Duration::ZERO);
    }

    #[test]
    fn test_rodio_decodes_wav() {
        let samples: Vec<f32> = (0..1600).map(|i| ((i as f32) * 0.05).sin() * 0.5).collect();
        let bytes = encode_wav(&samples, 16000, 1).unwrap();

        let decoded = RodioDecoder.decode(&bytes).unwrap();

        assert_eq!(decoded.sample_rate, 16000);
        assert_eq!(decoded.channels, 1);
        assert_eq!(decoded.samples.len(), samples.len());
    }

    #[test]
    fn test_rodio_rejects_garbage() {
        let result = RodioDecoder.decode(&[0x13, 0x37, 0x00, 0x42]);
        assert!(matches!(result, Err(SessionError::DecodeError(_))));
    }
}
