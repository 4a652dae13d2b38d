use crate::{Result, SessionError};
use crossbeam_channel::Sender;
use tracing::debug;

/// Format of the mono samples a capture device delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// A microphone that can be opened and released on demand
pub trait CaptureDevice: Send {
    /// Acquire the device and start sending mono sample blocks to `samples`.
    /// Fails with `DeviceUnavailable` when there is no device or access is denied.
    fn open(&mut self, samples: Sender<Vec<f32>>) -> Result<CaptureFormat>;

    /// Release the device. Safe to call when not open.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Capture device used when audio input is disabled
#[derive(Debug, Default)]
pub struct NullCaptureDevice;

impl CaptureDevice for NullCaptureDevice {
    fn open(&mut self, _samples: Sender<Vec<f32>>) -> Result<CaptureFormat> {
        debug!("Audio input disabled");
        Err(SessionError::DeviceUnavailable(
            "Audio input is disabled".to_string(),
        ))
    }

    fn close(&mut self) {}

    fn is_open(&self) -> bool {
        false
    }
}

#[cfg(feature = "audio-io")]
pub use microphone::CpalMicrophone;

#[cfg(feature = "audio-io")]
mod microphone {
    use super::{CaptureDevice, CaptureFormat};
    use crate::{Result, SessionError};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use crossbeam_channel::{bounded, Sender};
    use std::thread;
    use tracing::{debug, error, info};

    /// Default system microphone through cpal.
    ///
    /// The cpal stream is not `Send`, so it is created and dropped on a
    /// dedicated thread that lives exactly as long as the device is open.
    #[derive(Default)]
    pub struct CpalMicrophone {
        stop_tx: Option<Sender<()>>,
        thread: Option<thread::JoinHandle<()>>,
    }

    impl CpalMicrophone {
        pub fn new() -> Self {
            Self::default()
        }
    }

    fn build_stream(samples: Sender<Vec<f32>>) -> Result<(cpal::Stream, CaptureFormat)> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| SessionError::DeviceUnavailable("No input device available".into()))?;

        info!(
            "Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let config: cpal::StreamConfig = device
            .default_input_config()
            .map_err(|e| SessionError::DeviceUnavailable(format!("Failed to get input config: {}", e)))?
            .into();

        let channels = config.channels as usize;
        let format = CaptureFormat {
            sample_rate: config.sample_rate.0,
            channels: 1,
        };

        let err_fn = |err| {
            error!("Audio input stream error: {}", err);
        };

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Convert to mono if necessary
                    let block = if channels == 1 {
                        data.to_vec()
                    } else {
                        data.chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                            .collect()
                    };

                    if let Err(e) = samples.try_send(block) {
                        debug!("Failed to send audio data: {}", e);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| SessionError::DeviceUnavailable(format!("Failed to build input stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| SessionError::DeviceUnavailable(format!("Failed to start input stream: {}", e)))?;

        Ok((stream, format))
    }

    impl CaptureDevice for CpalMicrophone {
        fn open(&mut self, samples: Sender<Vec<f32>>) -> Result<CaptureFormat> {
            if self.is_open() {
                return Err(SessionError::DeviceUnavailable(
                    "Microphone already in use".to_string(),
                ));
            }

            let (ready_tx, ready_rx) = bounded::<Result<CaptureFormat>>(1);
            let (stop_tx, stop_rx) = bounded::<()>(1);

            let handle = thread::Builder::new()
                .name("microphone".to_string())
                .spawn(move || match build_stream(samples) {
                    Ok((stream, format)) => {
                        let _ = ready_tx.send(Ok(format));
                        // Blocks until close() signals or drops the sender
                        let _ = stop_rx.recv();
                        drop(stream);
                        info!("Released microphone");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })
                .map_err(|e| SessionError::DeviceUnavailable(format!("Failed to spawn capture thread: {}", e)))?;

            let format = ready_rx.recv().unwrap_or_else(|_| {
                Err(SessionError::DeviceUnavailable(
                    "Capture thread exited".to_string(),
                ))
            });

            match format {
                Ok(format) => {
                    self.stop_tx = Some(stop_tx);
                    self.thread = Some(handle);
                    info!("Opened microphone at {} Hz", format.sample_rate);
                    Ok(format)
                }
                Err(e) => {
                    let _ = handle.join();
                    Err(e)
                }
            }
        }

        fn close(&mut self) {
            if let Some(stop_tx) = self.stop_tx.take() {
                let _ = stop_tx.send(());
            }
            if let Some(handle) = self.thread.take() {
                if handle.join().is_err() {
                    error!("Capture thread panicked");
                }
            }
        }

        fn is_open(&self) -> bool {
            self.thread.is_some()
        }
    }

    impl Drop for CpalMicrophone {
        fn drop(&mut self) {
            self.close();
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crossbeam_channel::unbounded;

        #[test]
        fn test_microphone_open_close() {
            // This test might fail in CI environments without audio devices
            let mut mic = CpalMicrophone::new();
            let (tx, _rx) = unbounded();
            if let Ok(format) = mic.open(tx) {
                assert!(format.sample_rate > 0);
                assert!(mic.is_open());

                mic.close();
                assert!(!mic.is_open());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_null_device_is_unavailable() {
        let mut device = NullCaptureDevice;
        let (tx, _rx) = unbounded();
        assert!(matches!(
            device.open(tx),
            Err(SessionError::DeviceUnavailable(_))
        ));
        assert!(!device.is_open());
    }
}
