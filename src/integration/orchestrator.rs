//! Orchestrator for one interview session
//!
//! Connects all components: Transport -> TurnCoordinator -> State / Capture /
//! Playback, plus the two session timers. The UI talks to the running
//! session only through [`SessionHandle`].

use crate::audio::capture::{AudioCaptureController, CaptureEvent, CaptureWorker};
use crate::audio::decoder::{AudioDecoder, RodioDecoder};
use crate::audio::input::{CaptureDevice, NullCaptureDevice};
use crate::audio::output::{NullSink, RodioSink, SinkFactory};
use crate::audio::playback::{PlaybackEvent, SpeechPlayback, StreamingPlaybackEngine};
use crate::integration::config::SessionConfig;
use crate::integration::coordinator::{
    CoordinatorInput, Notification, TimerKind, TurnCoordinator, UserAction,
};
use crate::messages::{Message, Transcript};
use crate::session::state::{SessionSnapshot, SessionStateMachine};
use crate::session::timer::{EndedLatch, SessionTimer};
use crate::transport::channel::{ConnectionState, Connector, TransportChannel};
use crate::transport::protocol::EventKind;
use crate::transport::websocket::WebSocketConnector;
use crate::{Result, SessionError};
use crossbeam_channel::Receiver;
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle for controlling the session from the UI
#[derive(Clone)]
pub struct SessionHandle {
    /// Coordinator input sender
    input_tx: mpsc::UnboundedSender<CoordinatorInput>,

    /// Notification receiver
    notifications: Receiver<Notification>,

    state: Arc<RwLock<SessionStateMachine>>,

    transcript: Transcript,

    transport: TransportChannel,

    latch: EndedLatch,
}

impl SessionHandle {
    /// Send a user action to the coordinator
    pub fn send_action(&self, action: UserAction) -> Result<()> {
        self.input_tx
            .send(CoordinatorInput::User(action))
            .map_err(|e| SessionError::ChannelError(format!("Failed to send action: {}", e)))
    }

    /// Try to receive a notification without blocking
    pub fn try_recv_notification(&self) -> Option<Notification> {
        self.notifications.try_recv().ok()
    }

    /// Get the notification receiver
    pub fn notification_receiver(&self) -> Receiver<Notification> {
        self.notifications.clone()
    }

    /// Current session state for rendering
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.read().snapshot()
    }

    pub fn transcript(&self) -> Vec<Message> {
        self.transcript.get_all()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn is_ended(&self) -> bool {
        self.latch.is_tripped()
    }

    /// Stop the session: devices are released and the connection closed
    pub fn shutdown(&self) {
        if self.input_tx.send(CoordinatorInput::Shutdown).is_err() {
            debug!("Session already stopped");
        }
    }
}

/// Owns every component of one session until it is started
pub struct InterviewOrchestrator {
    config: SessionConfig,
    transport: TransportChannel,
    coordinator: TurnCoordinator,
    playback_events: Receiver<PlaybackEvent>,
    capture_events: Receiver<CaptureEvent>,
    input_tx: mpsc::UnboundedSender<CoordinatorInput>,
    input_rx: mpsc::UnboundedReceiver<CoordinatorInput>,
}

/// Forward a worker thread's events into the coordinator queue
fn bridge<T, F>(
    name: &str,
    events: Receiver<T>,
    tx: mpsc::UnboundedSender<CoordinatorInput>,
    wrap: F,
) -> Result<()>
where
    T: Send + 'static,
    F: Fn(T) -> CoordinatorInput + Send + 'static,
{
    let thread_name = name.to_string();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            for event in events.iter() {
                if tx.send(wrap(event)).is_err() {
                    break;
                }
            }
            debug!("{} bridge finished", thread_name);
        })
        .map_err(|e| SessionError::ChannelError(format!("Failed to spawn {} bridge: {}", name, e)))?;
    Ok(())
}

impl InterviewOrchestrator {
    /// Create a new orchestrator from its parts
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        playback: StreamingPlaybackEngine,
        capture: AudioCaptureController,
    ) -> Result<(Self, SessionHandle)> {
        config.validate()?;

        let transport = TransportChannel::new(connector, config.transport.clone());
        let playback_events = playback.event_receiver();
        let playback: Arc<dyn SpeechPlayback> = Arc::new(playback);
        let capture = CaptureWorker::spawn(capture);
        let capture_events = capture.event_receiver();

        let coordinator = TurnCoordinator::new(
            &config,
            Arc::new(transport.clone()),
            playback,
            capture,
        );
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let handle = SessionHandle {
            input_tx: input_tx.clone(),
            notifications: coordinator.notifications(),
            state: coordinator.state(),
            transcript: coordinator.transcript(),
            transport: transport.clone(),
            latch: coordinator.latch(),
        };

        let orchestrator = Self {
            config,
            transport,
            coordinator,
            playback_events,
            capture_events,
            input_tx,
            input_rx,
        };

        Ok((orchestrator, handle))
    }

    /// Wire everything together, connect and run the session.
    ///
    /// Must be called inside a tokio runtime. The returned task finishes
    /// once the session has been shut down.
    pub async fn start(self) -> Result<JoinHandle<()>> {
        let Self {
            config,
            transport,
            coordinator,
            playback_events,
            capture_events,
            input_tx,
            input_rx,
        } = self;

        for kind in EventKind::ALL {
            let tx = input_tx.clone();
            transport.subscribe(kind, move |event| {
                let _ = tx.send(CoordinatorInput::Server(event.clone()));
            });
        }

        let tx = input_tx.clone();
        transport.subscribe_status(move |status| {
            let _ = tx.send(CoordinatorInput::Channel(status.clone()));
        });

        bridge("playback-events", playback_events, input_tx.clone(), CoordinatorInput::Playback)?;
        bridge("capture-events", capture_events, input_tx.clone(), CoordinatorInput::Capture)?;

        let latch = coordinator.latch();
        let period = config.timers.tick_interval();
        let session_transport = transport.clone();

        let task = tokio::spawn(async move {
            let mut elapsed = SessionTimer::new("elapsed", latch.clone());
            let tx = input_tx.clone();
            elapsed.start(period, move || {
                let _ = tx.send(CoordinatorInput::Tick(TimerKind::Elapsed));
            });

            let mut countdown = SessionTimer::new("countdown", latch);
            let tx = input_tx;
            countdown.start(period, move || {
                let _ = tx.send(CoordinatorInput::Tick(TimerKind::Countdown));
            });

            coordinator.run(input_rx).await;

            elapsed.stop();
            countdown.stop();
            session_transport.disconnect();
            info!("Session finished");
        });

        info!("Joining interview session {}", config.session_id);
        if let Err(e) = transport.connect(&config.server_address).await {
            // The channel keeps retrying on its own
            warn!("Initial connection failed: {}", e);
        }

        Ok(task)
    }
}

/// Builder for creating an orchestrator
pub struct OrchestratorBuilder {
    config: SessionConfig,
    connector: Option<Arc<dyn Connector>>,
    capture_device: Option<Box<dyn CaptureDevice>>,
    decoder: Option<Box<dyn AudioDecoder>>,
    sinks: Option<SinkFactory>,
}

impl OrchestratorBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            connector: None,
            capture_device: None,
            decoder: None,
            sinks: None,
        }
    }

    /// Set the complete configuration
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom connector instead of WebSocket
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_capture_device(mut self, device: Box<dyn CaptureDevice>) -> Self {
        self.capture_device = Some(device);
        self
    }

    pub fn with_decoder(mut self, decoder: Box<dyn AudioDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn with_sink_factory(mut self, sinks: SinkFactory) -> Self {
        self.sinks = Some(sinks);
        self
    }

    /// Disable audio input
    pub fn without_audio_input(mut self) -> Self {
        self.config.enable_audio_input = false;
        self
    }

    /// Disable audio output
    pub fn without_audio_output(mut self) -> Self {
        self.config.enable_audio_output = false;
        self
    }

    /// Build the orchestrator
    pub fn build(self) -> Result<(InterviewOrchestrator, SessionHandle)> {
        let config = self.config;

        let connector = self.connector.unwrap_or_else(|| {
            let connector = match &config.auth_token {
                Some(token) => WebSocketConnector::new().with_token(token.clone()),
                None => WebSocketConnector::new(),
            };
            Arc::new(connector)
        });

        let device = self
            .capture_device
            .unwrap_or_else(|| default_capture_device(config.enable_audio_input));

        let sinks = self.sinks.unwrap_or_else(|| {
            if config.enable_audio_output {
                RodioSink::factory()
            } else {
                NullSink::factory()
            }
        });

        let decoder = self.decoder.unwrap_or_else(|| Box::new(RodioDecoder));
        let playback = StreamingPlaybackEngine::new(config.playback.clone(), decoder, sinks);

        InterviewOrchestrator::new(
            config,
            connector,
            playback,
            AudioCaptureController::new(device),
        )
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "audio-io")]
fn default_capture_device(enabled: bool) -> Box<dyn CaptureDevice> {
    if enabled {
        Box::new(crate::audio::input::CpalMicrophone::new())
    } else {
        Box::new(NullCaptureDevice)
    }
}

#[cfg(not(feature = "audio-io"))]
fn default_capture_device(_enabled: bool) -> Box<dyn CaptureDevice> {
    Box::new(NullCaptureDevice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SessionConfig {
        SessionConfig::new("ws://localhost:9/ws", "s-1")
            .without_audio_input()
            .without_audio_output()
    }

    #[test]
    fn test_orchestrator_creation() {
        let result = OrchestratorBuilder::new().with_config(test_config()).build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = OrchestratorBuilder::new()
            .with_config(SessionConfig::default())
            .build();
        assert!(matches!(result, Err(SessionError::ConfigError(_))));
    }

    #[test]
    fn test_handle_methods() {
        let (_orchestrator, handle) = OrchestratorBuilder::new()
            .with_config(test_config())
            .build()
            .unwrap();

        let snapshot = handle.snapshot();
        assert!(snapshot.participants.is_empty());
        assert!(handle.transcript().is_empty());
        assert!(handle.try_recv_notification().is_none());
        assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
        assert!(!handle.is_ended());
        assert!(handle.send_action(UserAction::AcknowledgeInstructions).is_ok());
    }
}
