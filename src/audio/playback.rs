//! Streaming playback of synthesized speech
//!
//! Speech arrives as an open-ended sequence of byte chunks. The engine
//! buffers them until a minimum contiguous span is available, decodes the
//! whole span as one unit and plays units strictly one after another. All
//! decoding and output happens on a dedicated worker thread that owns the
//! output device; the public handle only sends commands and watches events.

use crate::audio::buffer::AudioChunkBuffer;
use crate::audio::decoder::AudioDecoder;
use crate::audio::output::{AudioSink, SinkFactory};
use crate::{Result, SessionError};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for the playback engine
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Buffered bytes needed before a decode is attempted
    pub min_buffer_bytes: usize,

    /// Extra time past a unit's duration before it is assumed finished
    pub completion_grace_ms: u64,

    /// How often the worker checks whether the current unit has finished
    pub poll_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            min_buffer_bytes: 16 * 1024,
            completion_grace_ms: 500,
            poll_interval_ms: 10,
        }
    }
}

impl PlaybackConfig {
    pub fn with_min_buffer(mut self, bytes: usize) -> Self {
        self.min_buffer_bytes = bytes;
        self
    }

    pub fn with_completion_grace(mut self, grace_ms: u64) -> Self {
        self.completion_grace_ms = grace_ms;
        self
    }

    fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Commands processed by the playback worker
#[derive(Debug, Clone)]
pub enum PlaybackCommand {
    Begin { stream_id: Uuid },
    Chunk { stream_id: Uuid, bytes: Vec<u8> },
    End { stream_id: Uuid },
    Stop,
    Shutdown,
}

/// Events emitted by the playback worker
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    StreamStarted { stream_id: Uuid },

    /// A decoded unit began playing
    UnitStarted {
        stream_id: Uuid,
        bytes: usize,
        duration: Duration,
    },

    /// A buffered span could not be decoded; the stream goes on
    DecodeFailed { stream_id: Uuid, error: String },

    /// All audio of the stream has been played
    StreamCompleted { stream_id: Uuid },

    /// The stream was cut short by `stop()`
    Stopped { stream_id: Uuid },

    /// The output device could not be opened or used
    Error { stream_id: Option<Uuid>, error: String },
}

/// Playback seam used by the turn coordinator
pub trait SpeechPlayback: Send + Sync {
    /// Open a new stream; refused while another stream is playing
    fn begin_stream(&self) -> Result<Uuid>;

    fn push_chunk(&self, stream_id: Uuid, bytes: Vec<u8>) -> Result<()>;

    /// Mark the end of the inbound stream; residual bytes are still played
    fn finish_stream(&self, stream_id: Uuid) -> Result<()>;

    /// Halt playback and release the output device
    fn stop(&self);

    fn is_playing(&self) -> bool;
}

/// Handle to the playback worker
pub struct StreamingPlaybackEngine {
    command_tx: Sender<PlaybackCommand>,
    event_rx: Receiver<PlaybackEvent>,
    current: Arc<Mutex<Option<Uuid>>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl StreamingPlaybackEngine {
    /// Spawn the worker thread
    pub fn new(config: PlaybackConfig, decoder: Box<dyn AudioDecoder>, sinks: SinkFactory) -> Self {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let current = Arc::new(Mutex::new(None));

        let worker_current = Arc::clone(&current);

        let handle = thread::Builder::new()
            .name("speech-playback".to_string())
            .spawn(move || {
                // Sinks are not Send, so the worker is built on its own thread
                let mut worker = PlaybackWorker {
                    config,
                    decoder,
                    sinks,
                    commands: command_rx,
                    deferred: VecDeque::new(),
                    events: event_tx,
                    current: worker_current,
                    active: None,
                };
                worker.run();
            })
            .map_err(|e| error!("Failed to spawn playback worker: {}", e))
            .ok();

        Self {
            command_tx,
            event_rx,
            current,
            worker: handle,
        }
    }

    /// Get a receiver for playback events
    pub fn event_receiver(&self) -> Receiver<PlaybackEvent> {
        self.event_rx.clone()
    }

    /// Id of the stream being played, if any
    pub fn current_stream(&self) -> Option<Uuid> {
        *self.current.lock()
    }

    fn send(&self, command: PlaybackCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| SessionError::ChannelError("Playback worker is not running".to_string()))
    }

    fn ensure_current(&self, stream_id: Uuid) -> Result<()> {
        if self.current_stream() == Some(stream_id) {
            Ok(())
        } else {
            Err(SessionError::PlaybackError(format!(
                "Stream {} is not active",
                stream_id
            )))
        }
    }

    /// Stop the worker thread and wait for it to exit
    pub fn shutdown(&mut self) {
        self.current.lock().take();
        let _ = self.command_tx.send(PlaybackCommand::Shutdown);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Playback worker panicked");
            }
        }
    }
}

impl SpeechPlayback for StreamingPlaybackEngine {
    fn begin_stream(&self) -> Result<Uuid> {
        let stream_id = {
            let mut current = self.current.lock();
            if let Some(active) = *current {
                return Err(SessionError::PlaybackError(format!(
                    "Stream {} is still playing",
                    active
                )));
            }
            let stream_id = Uuid::new_v4();
            *current = Some(stream_id);
            stream_id
        };

        if let Err(e) = self.send(PlaybackCommand::Begin { stream_id }) {
            self.current.lock().take();
            return Err(e);
        }
        Ok(stream_id)
    }

    fn push_chunk(&self, stream_id: Uuid, bytes: Vec<u8>) -> Result<()> {
        self.ensure_current(stream_id)?;
        self.send(PlaybackCommand::Chunk { stream_id, bytes })
    }

    fn finish_stream(&self, stream_id: Uuid) -> Result<()> {
        self.ensure_current(stream_id)?;
        self.send(PlaybackCommand::End { stream_id })
    }

    fn stop(&self) {
        if let Some(stream_id) = self.current.lock().take() {
            debug!("Stopping speech stream {}", stream_id);
        }
        let _ = self.send(PlaybackCommand::Stop);
    }

    fn is_playing(&self) -> bool {
        self.current.lock().is_some()
    }
}

impl Drop for StreamingPlaybackEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ActiveStream {
    id: Uuid,
    buffer: AudioChunkBuffer,
    sink: Option<Box<dyn AudioSink>>,
}

enum Flow {
    Continue,
    Shutdown,
}

enum UnitOutcome {
    Finished,
    Stopped,
    Shutdown,
}

struct PlaybackWorker {
    config: PlaybackConfig,
    decoder: Box<dyn AudioDecoder>,
    sinks: SinkFactory,
    commands: Receiver<PlaybackCommand>,
    /// Commands received while a unit was playing, handled afterwards in order
    deferred: VecDeque<PlaybackCommand>,
    events: Sender<PlaybackEvent>,
    current: Arc<Mutex<Option<Uuid>>>,
    active: Option<ActiveStream>,
}

impl PlaybackWorker {
    fn run(&mut self) {
        info!("Playback worker starting");

        loop {
            let command = match self.deferred.pop_front() {
                Some(command) => command,
                None => match self.commands.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };

            if let Flow::Shutdown = self.handle(command) {
                break;
            }
        }

        self.release();
        info!("Playback worker stopped");
    }

    /// False once the handle has stopped `stream_id`, even before the
    /// matching Stop command is read
    fn is_current(&self, stream_id: Uuid) -> bool {
        *self.current.lock() == Some(stream_id)
    }

    fn emit(&self, event: PlaybackEvent) {
        let _ = self.events.send(event);
    }

    fn handle(&mut self, command: PlaybackCommand) -> Flow {
        match command {
            PlaybackCommand::Begin { stream_id } => {
                if self.active.is_some() {
                    self.release();
                }
                debug!("Speech stream {} started", stream_id);
                self.active = Some(ActiveStream {
                    id: stream_id,
                    buffer: AudioChunkBuffer::new(),
                    sink: None,
                });
                self.emit(PlaybackEvent::StreamStarted { stream_id });
                Flow::Continue
            }

            PlaybackCommand::Chunk { stream_id, bytes } => {
                if !self.is_current(stream_id) {
                    debug!("Dropping chunk for stopped stream {}", stream_id);
                    return Flow::Continue;
                }
                let threshold = self.config.min_buffer_bytes;
                let Some(active) = self.active.as_mut().filter(|a| a.id == stream_id) else {
                    debug!("Dropping chunk for inactive stream {}", stream_id);
                    return Flow::Continue;
                };

                active.buffer.push(bytes);
                if !active.buffer.reached(threshold) {
                    return Flow::Continue;
                }
                let span = active.buffer.drain_all();
                self.play_span(stream_id, span)
            }

            PlaybackCommand::End { stream_id } => {
                if !self.is_current(stream_id) {
                    debug!("Ignoring end of stopped stream {}", stream_id);
                    return Flow::Continue;
                }
                let Some(active) = self.active.as_mut().filter(|a| a.id == stream_id) else {
                    debug!("Ignoring end of inactive stream {}", stream_id);
                    return Flow::Continue;
                };

                if !active.buffer.is_empty() {
                    let residual = active.buffer.drain_all();
                    debug!("Flushing {} residual bytes", residual.len());
                    if let Flow::Shutdown = self.play_span(stream_id, residual) {
                        return Flow::Shutdown;
                    }
                }

                // A stop may have arrived while the residual was playing
                if self.active.as_ref().map(|a| a.id) == Some(stream_id) {
                    self.complete(stream_id);
                }
                Flow::Continue
            }

            PlaybackCommand::Stop => {
                self.stop_active();
                Flow::Continue
            }

            PlaybackCommand::Shutdown => Flow::Shutdown,
        }
    }

    /// Decode one span and play it to completion
    fn play_span(&mut self, stream_id: Uuid, span: Vec<u8>) -> Flow {
        let bytes = span.len();
        let audio = match self.decoder.decode(&span) {
            Ok(audio) => audio,
            Err(e) => {
                warn!("Failed to decode {} bytes of speech: {}", bytes, e);
                self.emit(PlaybackEvent::DecodeFailed {
                    stream_id,
                    error: e.to_string(),
                });
                return Flow::Continue;
            }
        };

        let Some(active) = self.active.as_mut() else {
            return Flow::Continue;
        };

        if active.sink.is_none() {
            match (self.sinks)() {
                Ok(sink) => active.sink = Some(sink),
                Err(e) => {
                    error!("Failed to open audio output: {}", e);
                    self.emit(PlaybackEvent::Error {
                        stream_id: Some(stream_id),
                        error: e.to_string(),
                    });
                    return Flow::Continue;
                }
            }
        }
        let Some(sink) = active.sink.as_mut() else {
            return Flow::Continue;
        };

        let duration = audio.duration();
        if let Err(e) = sink.play(audio) {
            error!("Failed to play speech unit: {}", e);
            self.emit(PlaybackEvent::Error {
                stream_id: Some(stream_id),
                error: e.to_string(),
            });
            return Flow::Continue;
        }

        self.emit(PlaybackEvent::UnitStarted {
            stream_id,
            bytes,
            duration,
        });

        match self.wait_for_unit(duration) {
            UnitOutcome::Finished => Flow::Continue,
            UnitOutcome::Stopped => {
                self.stop_active();
                Flow::Continue
            }
            UnitOutcome::Shutdown => Flow::Shutdown,
        }
    }

    /// Block until the sink drains or the fallback deadline passes.
    ///
    /// Stop and shutdown interrupt the wait; every other command is kept
    /// for later so arrival order is preserved.
    fn wait_for_unit(&mut self, duration: Duration) -> UnitOutcome {
        let deadline = Instant::now() + duration + self.config.completion_grace();
        let poll = self.config.poll_interval();

        loop {
            let idle = self
                .active
                .as_ref()
                .and_then(|a| a.sink.as_ref())
                .map(|s| s.is_idle())
                .unwrap_or(true);
            if idle {
                return UnitOutcome::Finished;
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("Unit completion not reported, continuing after {:?}", duration);
                return UnitOutcome::Finished;
            }

            match self.commands.recv_timeout(poll.min(deadline - now)) {
                Ok(PlaybackCommand::Stop) => return UnitOutcome::Stopped,
                Ok(PlaybackCommand::Shutdown) => return UnitOutcome::Shutdown,
                Ok(other) => self.deferred.push_back(other),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return UnitOutcome::Shutdown,
            }
        }
    }

    fn complete(&mut self, stream_id: Uuid) {
        self.release();
        {
            let mut current = self.current.lock();
            if *current == Some(stream_id) {
                *current = None;
            }
        }
        info!("Speech stream {} completed", stream_id);
        self.emit(PlaybackEvent::StreamCompleted { stream_id });
    }

    fn stop_active(&mut self) {
        if let Some(stream_id) = self.release() {
            // Anything queued behind the stop for this stream is stale
            self.deferred.retain(|command| match command {
                PlaybackCommand::Chunk { stream_id: id, .. }
                | PlaybackCommand::End { stream_id: id } => *id != stream_id,
                _ => true,
            });
            info!("Speech stream {} stopped", stream_id);
            self.emit(PlaybackEvent::Stopped { stream_id });
        }
    }

    /// Halt and drop the active stream's sink and queue
    fn release(&mut self) -> Option<Uuid> {
        let mut active = self.active.take()?;
        if let Some(mut sink) = active.sink.take() {
            sink.halt();
        }
        active.buffer.clear();
        Some(active.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decoder::DecodedAudio;
    use crate::audio::output::NullSink;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(5);

    /// Treats every byte as one mono sample; 0xFF marks an undecodable span
    struct ByteDecoder;

    impl AudioDecoder for ByteDecoder {
        fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio> {
            if bytes.first() == Some(&0xFF) {
                return Err(SessionError::DecodeError("split frame".to_string()));
            }
            Ok(DecodedAudio::new(
                bytes.iter().map(|b| *b as f32 / 255.0).collect(),
                16000,
                1,
            ))
        }
    }

    /// Finishes units instantly and records what it played
    struct RecordingSink {
        played: Arc<Mutex<Vec<f32>>>,
    }

    impl AudioSink for RecordingSink {
        fn play(&mut self, audio: DecodedAudio) -> Result<()> {
            self.played.lock().extend(audio.samples);
            Ok(())
        }

        fn is_idle(&self) -> bool {
            true
        }

        fn halt(&mut self) {}
    }

    /// Never reports completion; tracks whether it was released
    struct StuckSink {
        open: Arc<AtomicBool>,
    }

    impl AudioSink for StuckSink {
        fn play(&mut self, _audio: DecodedAudio) -> Result<()> {
            Ok(())
        }

        fn is_idle(&self) -> bool {
            false
        }

        fn halt(&mut self) {}
    }

    impl Drop for StuckSink {
        fn drop(&mut self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    fn recording_engine(min_buffer: usize) -> (StreamingPlaybackEngine, Arc<Mutex<Vec<f32>>>) {
        let played = Arc::new(Mutex::new(Vec::new()));
        let sink_played = Arc::clone(&played);
        let engine = StreamingPlaybackEngine::new(
            PlaybackConfig::default().with_min_buffer(min_buffer),
            Box::new(ByteDecoder),
            Box::new(move || {
                Ok(Box::new(RecordingSink {
                    played: Arc::clone(&sink_played),
                }) as Box<dyn AudioSink>)
            }),
        );
        (engine, played)
    }

    fn wait_for<F>(events: &Receiver<PlaybackEvent>, mut matches: F) -> Vec<PlaybackEvent>
    where
        F: FnMut(&PlaybackEvent) -> bool,
    {
        let mut seen = Vec::new();
        loop {
            let event = events.recv_timeout(WAIT).expect("timed out waiting for playback event");
            let done = matches(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    #[test]
    fn test_incremental_playback_matches_whole_decode() {
        let (engine, played) = recording_engine(16);
        let events = engine.event_receiver();

        let bytes: Vec<u8> = (0..203u32).map(|i| (i * 7 % 250) as u8).collect();
        let stream_id = engine.begin_stream().unwrap();
        for chunk in bytes.chunks(5) {
            engine.push_chunk(stream_id, chunk.to_vec()).unwrap();
        }
        engine.finish_stream(stream_id).unwrap();

        let seen = wait_for(&events, |e| matches!(e, PlaybackEvent::StreamCompleted { .. }));

        let units = seen
            .iter()
            .filter(|e| matches!(e, PlaybackEvent::UnitStarted { .. }))
            .count();
        assert!(units > 1);
        assert_eq!(*played.lock(), ByteDecoder.decode(&bytes).unwrap().samples);
        assert!(!engine.is_playing());
    }

    #[test]
    fn test_rejects_second_stream_while_playing() {
        let (engine, _) = recording_engine(16);

        let first = engine.begin_stream().unwrap();
        let second = engine.begin_stream();

        assert!(matches!(second, Err(SessionError::PlaybackError(_))));
        assert_eq!(engine.current_stream(), Some(first));
    }

    #[test]
    fn test_residual_bytes_flushed_on_end() {
        let (engine, played) = recording_engine(16);
        let events = engine.event_receiver();

        let stream_id = engine.begin_stream().unwrap();
        engine.push_chunk(stream_id, vec![10; 10]).unwrap();
        engine.finish_stream(stream_id).unwrap();

        let seen = wait_for(&events, |e| matches!(e, PlaybackEvent::StreamCompleted { .. }));

        assert!(seen.contains(&PlaybackEvent::UnitStarted {
            stream_id,
            bytes: 10,
            duration: Duration::from_micros(10 * 1_000_000 / 16000),
        }));
        assert_eq!(played.lock().len(), 10);
    }

    #[test]
    fn test_decode_failure_does_not_end_stream() {
        let (engine, played) = recording_engine(16);
        let events = engine.event_receiver();

        let stream_id = engine.begin_stream().unwrap();
        engine.push_chunk(stream_id, vec![0xFF; 16]).unwrap();
        engine.push_chunk(stream_id, vec![1; 16]).unwrap();
        engine.finish_stream(stream_id).unwrap();

        let seen = wait_for(&events, |e| matches!(e, PlaybackEvent::StreamCompleted { .. }));

        assert!(seen
            .iter()
            .any(|e| matches!(e, PlaybackEvent::DecodeFailed { .. })));
        assert_eq!(played.lock().len(), 16);
    }

    #[test]
    fn test_stop_mid_stream_releases_output() {
        let open = Arc::new(AtomicBool::new(false));
        let opened = Arc::new(AtomicUsize::new(0));
        let sink_open = Arc::clone(&open);
        let sink_opened = Arc::clone(&opened);

        let engine = StreamingPlaybackEngine::new(
            PlaybackConfig::default().with_min_buffer(16),
            Box::new(ByteDecoder),
            Box::new(move || {
                sink_open.store(true, Ordering::SeqCst);
                sink_opened.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(StuckSink {
                    open: Arc::clone(&sink_open),
                }) as Box<dyn AudioSink>)
            }),
        );
        let events = engine.event_receiver();

        let stream_id = engine.begin_stream().unwrap();
        engine.push_chunk(stream_id, vec![1; 16000]).unwrap();
        wait_for(&events, |e| matches!(e, PlaybackEvent::UnitStarted { .. }));
        assert!(open.load(Ordering::SeqCst));

        engine.stop();
        assert!(!engine.is_playing());
        assert!(engine.push_chunk(stream_id, vec![2; 16000]).is_err());

        wait_for(&events, |e| *e == PlaybackEvent::Stopped { stream_id });
        assert!(!open.load(Ordering::SeqCst));
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_stale_commands_skipped_after_stop() {
        let opened = Arc::new(AtomicUsize::new(0));
        let sink_opened = Arc::clone(&opened);
        let (_command_tx, commands) = unbounded();
        let (events_tx, events) = unbounded();
        let stream_id = Uuid::new_v4();
        let current = Arc::new(Mutex::new(Some(stream_id)));

        let mut worker = PlaybackWorker {
            config: PlaybackConfig::default().with_min_buffer(16),
            decoder: Box::new(ByteDecoder),
            sinks: Box::new(move || {
                sink_opened.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(NullSink) as Box<dyn AudioSink>)
            }),
            commands,
            deferred: VecDeque::new(),
            events: events_tx,
            current: Arc::clone(&current),
            active: None,
        };

        worker.handle(PlaybackCommand::Begin { stream_id });
        // The handle stopped the stream; its Stop command is still queued
        current.lock().take();
        worker.handle(PlaybackCommand::Chunk {
            stream_id,
            bytes: vec![1; 32],
        });
        worker.handle(PlaybackCommand::End { stream_id });

        assert_eq!(opened.load(Ordering::SeqCst), 0);
        let seen: Vec<PlaybackEvent> = events.try_iter().collect();
        assert_eq!(seen, vec![PlaybackEvent::StreamStarted { stream_id }]);

        worker.handle(PlaybackCommand::Stop);
        assert_eq!(
            events.try_recv().ok(),
            Some(PlaybackEvent::Stopped { stream_id })
        );
    }

    #[test]
    fn test_stream_after_stop() {
        let (engine, played) = recording_engine(4);
        let events = engine.event_receiver();

        let first = engine.begin_stream().unwrap();
        engine.push_chunk(first, vec![1, 2]).unwrap();
        engine.stop();

        let second = engine.begin_stream().unwrap();
        engine.push_chunk(second, vec![3, 4, 5, 6]).unwrap();
        engine.finish_stream(second).unwrap();

        wait_for(&events, |e| *e == PlaybackEvent::StreamCompleted { stream_id: second });
        assert_eq!(played.lock().len(), 4);
    }

    #[test]
    fn test_missing_output_reports_error() {
        let engine = StreamingPlaybackEngine::new(
            PlaybackConfig::default().with_min_buffer(4),
            Box::new(ByteDecoder),
            Box::new(|| Err(SessionError::PlaybackError("no speakers".to_string()))),
        );
        let events = engine.event_receiver();

        let stream_id = engine.begin_stream().unwrap();
        engine.push_chunk(stream_id, vec![1; 4]).unwrap();
        engine.finish_stream(stream_id).unwrap();

        let seen = wait_for(&events, |e| matches!(e, PlaybackEvent::StreamCompleted { .. }));
        assert!(seen
            .iter()
            .any(|e| matches!(e, PlaybackEvent::Error { .. })));
    }
}
