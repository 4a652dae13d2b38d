pub mod buffer;
pub mod capture;
pub mod decoder;
pub mod input;
pub mod output;
pub mod playback;
pub mod wav;

pub use buffer::AudioChunkBuffer;
pub use capture::{AudioCaptureController, EncodedRecording};
pub use decoder::{AudioDecoder, DecodedAudio, RodioDecoder};
#[cfg(feature = "audio-io")]
pub use input::CpalMicrophone;
pub use input::{CaptureDevice, CaptureFormat, NullCaptureDevice};
pub use output::{AudioSink, NullSink, RodioSink, SinkFactory};
pub use playback::{
    PlaybackCommand, PlaybackConfig, PlaybackEvent, SpeechPlayback, StreamingPlaybackEngine,
};
pub use wav::{encode_wav, read_wav_bytes};
