//! Turn-gated microphone recording
//!
//! [`AudioCaptureController`] does the device work synchronously.
//! [`CaptureWorker`] owns a controller on its own thread so opening and
//! releasing the microphone never block the caller; outcomes come back as
//! [`CaptureEvent`]s.

use crate::audio::input::{CaptureDevice, CaptureFormat};
use crate::audio::wav::encode_wav;
use crate::{Result, SessionError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A finished recording, ready to send
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRecording {
    pub id: Uuid,
    /// Base64 of a 16-bit PCM WAV file
    pub audio_base64: String,
    pub sample_rate: u32,
    pub sample_count: usize,
    pub duration: Duration,
}

struct Recording {
    id: Uuid,
    format: CaptureFormat,
    samples: Receiver<Vec<f32>>,
    started_at: Instant,
}

/// Owns the microphone and at most one recording at a time
pub struct AudioCaptureController {
    device: Box<dyn CaptureDevice>,
    recording: Option<Recording>,
}

impl AudioCaptureController {
    pub fn new(device: Box<dyn CaptureDevice>) -> Self {
        Self {
            device,
            recording: None,
        }
    }

    /// Start recording.
    ///
    /// A no-op while already recording. `turn_held` is the coordinator's
    /// verdict on whether the local participant holds the floor; without it
    /// the device is not touched.
    pub fn start_recording(&mut self, turn_held: bool) -> Result<()> {
        if self.recording.is_some() {
            debug!("Already recording");
            return Ok(());
        }

        if !turn_held {
            return Err(SessionError::TurnNotHeld);
        }

        let (tx, rx) = unbounded();
        let format = self.device.open(tx).map_err(|e| match e {
            SessionError::DeviceUnavailable(_) => e,
            other => SessionError::DeviceUnavailable(other.to_string()),
        })?;

        let id = Uuid::new_v4();
        self.recording = Some(Recording {
            id,
            format,
            samples: rx,
            started_at: Instant::now(),
        });

        info!("Recording {} started", id);
        Ok(())
    }

    /// Finish the recording and encode everything captured.
    ///
    /// Always releases the device. Returns `Ok(None)` when nothing was being
    /// recorded.
    pub fn stop_recording(&mut self) -> Result<Option<EncodedRecording>> {
        let Some(recording) = self.recording.take() else {
            self.device.close();
            return Ok(None);
        };

        // Closing first guarantees no more blocks arrive while draining
        self.device.close();

        let samples: Vec<f32> = recording.samples.try_iter().flatten().collect();
        let sample_rate = recording.format.sample_rate;
        let wav = encode_wav(&samples, sample_rate, recording.format.channels)?;

        info!(
            "Recording {} finished: {} samples in {:?}",
            recording.id,
            samples.len(),
            recording.started_at.elapsed()
        );

        let duration = if sample_rate > 0 {
            Duration::from_micros(samples.len() as u64 * 1_000_000 / sample_rate as u64)
        } else {
            Duration::ZERO
        };

        Ok(Some(EncodedRecording {
            id: recording.id,
            audio_base64: BASE64.encode(wav),
            sample_rate,
            sample_count: samples.len(),
            duration,
        }))
    }

    /// Drop the recording without encoding it and release the device
    pub fn cancel_recording(&mut self) {
        if let Some(recording) = self.recording.take() {
            warn!("Discarding recording {}", recording.id);
        }
        self.device.close();
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn recording_id(&self) -> Option<Uuid> {
        self.recording.as_ref().map(|r| r.id)
    }
}

impl Drop for AudioCaptureController {
    fn drop(&mut self) {
        self.cancel_recording();
    }
}

/// Commands for the capture worker
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureCommand {
    Start { turn_held: bool },
    Stop,
    Cancel,
    Shutdown,
}

/// Outcomes reported by the capture worker
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// The device is open and recording
    Started { id: Uuid },
    /// Recording could not start
    Failed(SessionError),
    Finished(EncodedRecording),
    /// Stopped, but the recording could not be encoded
    EncodeFailed(SessionError),
}

/// Handle to a capture controller running on its own thread
pub struct CaptureWorker {
    command_tx: Sender<CaptureCommand>,
    event_rx: Receiver<CaptureEvent>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CaptureWorker {
    /// Move `controller` onto a worker thread
    pub fn spawn(mut controller: AudioCaptureController) -> Self {
        let (command_tx, command_rx) = unbounded::<CaptureCommand>();
        let (event_tx, event_rx) = unbounded();

        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                info!("Capture worker starting");
                for command in command_rx.iter() {
                    let event = match command {
                        CaptureCommand::Start { turn_held } => {
                            if controller.is_recording() {
                                debug!("Start ignored, already recording");
                                continue;
                            }
                            match controller.start_recording(turn_held) {
                                Ok(()) => controller.recording_id().map(|id| CaptureEvent::Started { id }),
                                Err(e) => Some(CaptureEvent::Failed(e)),
                            }
                        }
                        CaptureCommand::Stop => match controller.stop_recording() {
                            Ok(recording) => recording.map(CaptureEvent::Finished),
                            Err(e) => Some(CaptureEvent::EncodeFailed(e)),
                        },
                        CaptureCommand::Cancel => {
                            controller.cancel_recording();
                            None
                        }
                        CaptureCommand::Shutdown => break,
                    };

                    if let Some(event) = event {
                        let _ = event_tx.send(event);
                    }
                }
                controller.cancel_recording();
                info!("Capture worker stopped");
            })
            .map_err(|e| error!("Failed to spawn capture worker: {}", e))
            .ok();

        Self {
            command_tx,
            event_rx,
            worker: handle,
        }
    }

    /// Get a receiver for capture events
    pub fn event_receiver(&self) -> Receiver<CaptureEvent> {
        self.event_rx.clone()
    }

    fn send(&self, command: CaptureCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| SessionError::ChannelError("Capture worker is not running".to_string()))
    }

    /// Request a recording; the outcome arrives as `Started` or `Failed`
    pub fn start(&self, turn_held: bool) -> Result<()> {
        self.send(CaptureCommand::Start { turn_held })
    }

    /// Finish the recording; the payload arrives as `Finished`
    pub fn stop(&self) -> Result<()> {
        self.send(CaptureCommand::Stop)
    }

    /// Discard any recording and release the device
    pub fn cancel(&self) {
        let _ = self.send(CaptureCommand::Cancel);
    }

    /// Stop the worker thread and wait for it to exit
    pub fn shutdown(&mut self) {
        let _ = self.command_tx.send(CaptureCommand::Shutdown);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Capture worker panicked");
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        // Not joined; the worker releases the device itself
        let _ = self.command_tx.send(CaptureCommand::Shutdown);
    }
}
