use crate::audio::decoder::DecodedAudio;
use crate::{Result, SessionError};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use tracing::{debug, info};

/// An opened audio output device.
///
/// Sinks are created on the playback worker thread and never leave it, so
/// implementations need not be `Send`. Dropping a sink releases the device.
pub trait AudioSink {
    /// Start playing `audio`, discarding anything still queued
    fn play(&mut self, audio: DecodedAudio) -> Result<()>;

    /// True once everything handed to `play` has finished
    fn is_idle(&self) -> bool;

    /// Stop immediately
    fn halt(&mut self);
}

/// Opens a fresh sink for each speech stream
pub type SinkFactory = Box<dyn Fn() -> Result<Box<dyn AudioSink>> + Send>;

/// Default output device through rodio
pub struct RodioSink {
    sink: Sink,
    _handle: OutputStreamHandle,
    _stream: OutputStream,
}

impl RodioSink {
    pub fn open() -> Result<Self> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| SessionError::PlaybackError(format!("No output device available: {}", e)))?;

        let sink = Sink::try_new(&handle)
            .map_err(|e| SessionError::PlaybackError(format!("Failed to open output sink: {}", e)))?;

        info!("Opened audio output");
        Ok(Self {
            sink,
            _handle: handle,
            _stream: stream,
        })
    }

    pub fn factory() -> SinkFactory {
        Box::new(|| Ok(Box::new(RodioSink::open()?) as Box<dyn AudioSink>))
    }
}

impl AudioSink for RodioSink {
    fn play(&mut self, audio: DecodedAudio) -> Result<()> {
        if !self.sink.empty() {
            debug!("Discarding unfinished audio before next unit");
            self.sink.clear();
        }
        self.sink
            .append(SamplesBuffer::new(audio.channels, audio.sample_rate, audio.samples));
        self.sink.play();
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.sink.empty()
    }

    fn halt(&mut self) {
        self.sink.stop();
    }
}

impl Drop for RodioSink {
    fn drop(&mut self) {
        self.sink.stop();
        debug!("Released audio output");
    }
}

/// Sink that discards audio, for sessions without speakers
#[derive(Debug, Default)]
pub struct NullSink;

impl NullSink {
    pub fn factory() -> SinkFactory {
        Box::new(|| Ok(Box::new(NullSink) as Box<dyn AudioSink>))
    }
}

impl AudioSink for NullSink {
    fn play(&mut self, audio: DecodedAudio) -> Result<()> {
        debug!("Audio output disabled, skipping {:?} of speech", audio.duration());
        Ok(())
    }

    fn is_idle(&self) -> bool {
        true
    }

    fn halt(&mut self) {}
}
