//! Protocol-to-state glue
//!
//! [`TurnCoordinator`] is the only writer of the [`SessionStateMachine`].
//! Server events, transport status changes, playback events, user actions and
//! timer ticks all arrive as [`CoordinatorInput`] on one queue and are handled
//! one at a time, so each transition is applied without interleaving.

use crate::audio::capture::{CaptureEvent, CaptureWorker};
use crate::audio::playback::{PlaybackEvent, SpeechPlayback};
use crate::integration::config::SessionConfig;
use crate::messages::{Message, Transcript};
use crate::session::state::{ConnectionStatus, ModeTransition, SessionPhase, SessionStateMachine};
use crate::session::timer::EndedLatch;
use crate::transport::channel::{ChannelStatus, Outbound};
use crate::transport::protocol::{
    ActivityInfo, ClientMessage, InterviewData, InterviewStart, NextSpeakerInfo, ServerEvent,
};
use crate::SessionError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Elapsed,
    Countdown,
}

/// Actions taken by the local participant
#[derive(Debug, Clone, PartialEq)]
pub enum UserAction {
    /// Start recording if it is our turn, or stop and send the recording
    ToggleMicrophone,
    UpdateCode(String),
    SubmitCode,
    AcknowledgeInstructions,
    /// End the interview and tell the server
    EndInterview,
    /// Leave without notifying the server
    Exit,
}

/// Everything the coordinator reacts to
#[derive(Debug, Clone)]
pub enum CoordinatorInput {
    Server(ServerEvent),
    Channel(ChannelStatus),
    Playback(PlaybackEvent),
    Capture(CaptureEvent),
    User(UserAction),
    Tick(TimerKind),
    Shutdown,
}

/// Changes the UI layer should react to
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    StateChanged,
    TranscriptUpdated,
    ModeChanged(ModeTransition),
    RecordingStarted,
    RecordingStopped,
    Connection(ChannelStatus),
    /// A non-fatal fault; show `error.user_message()`
    Error(SessionError),
    SessionEnded { closing_remarks: Option<String> },
}

/// Where the local microphone is, as seen by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Microphone {
    Idle,
    /// Start requested, waiting for the device
    Opening,
    Recording,
    /// Stop requested, waiting for the encoded recording
    Finishing,
}

/// The speech stream currently fed from the server
#[derive(Debug, Clone)]
struct SpeechStream {
    id: Uuid,
    speaker: Option<String>,
    /// The server has sent `audio_streaming_completed`
    inbound_done: bool,
}

pub struct TurnCoordinator {
    session_id: String,
    config_id: Option<String>,
    state: Arc<RwLock<SessionStateMachine>>,
    transcript: Transcript,
    outbound: Arc<dyn Outbound>,
    playback: Arc<dyn SpeechPlayback>,
    capture: CaptureWorker,
    microphone: Microphone,
    latch: EndedLatch,
    notify_tx: Sender<Notification>,
    notify_rx: Receiver<Notification>,
    stream: Option<SpeechStream>,
    start_requested: bool,
    auto_submitted: bool,
}

impl TurnCoordinator {
    pub fn new(
        config: &SessionConfig,
        outbound: Arc<dyn Outbound>,
        playback: Arc<dyn SpeechPlayback>,
        capture: CaptureWorker,
    ) -> Self {
        let state = SessionStateMachine::new(
            config.local_participant_id.clone(),
            config.local_participant_name.clone(),
            config.topics.clone(),
            &config.timers,
        );
        let (notify_tx, notify_rx) = unbounded();

        Self {
            session_id: config.session_id.clone(),
            config_id: config.config_id.clone(),
            state: Arc::new(RwLock::new(state)),
            transcript: Transcript::new(),
            outbound,
            playback,
            capture,
            microphone: Microphone::Idle,
            latch: EndedLatch::new(),
            notify_tx,
            notify_rx,
            stream: None,
            start_requested: false,
            auto_submitted: false,
        }
    }

    /// Shared state, for snapshots
    pub fn state(&self) -> Arc<RwLock<SessionStateMachine>> {
        Arc::clone(&self.state)
    }

    pub fn transcript(&self) -> Transcript {
        self.transcript.clone()
    }

    pub fn latch(&self) -> EndedLatch {
        self.latch.clone()
    }

    /// Get a receiver for UI notifications
    pub fn notifications(&self) -> Receiver<Notification> {
        self.notify_rx.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.microphone == Microphone::Recording
    }

    /// Consume inputs in arrival order until shutdown or the queue closes
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<CoordinatorInput>) {
        info!("Turn coordinator started");
        while let Some(input) = inputs.recv().await {
            if !self.handle(input) {
                break;
            }
        }
        self.release_devices();
        info!("Turn coordinator stopped");
    }

    /// Apply one input. Returns false once the coordinator should stop.
    pub fn handle(&mut self, input: CoordinatorInput) -> bool {
        if self.latch.is_tripped() {
            match input {
                CoordinatorInput::Shutdown => return false,
                CoordinatorInput::Playback(event) => self.on_playback(event),
                other => debug!("Session ended, ignoring {:?}", other),
            }
            return true;
        }

        match input {
            CoordinatorInput::Server(event) => self.on_server(event),
            CoordinatorInput::Channel(status) => self.on_channel(status),
            CoordinatorInput::Playback(event) => self.on_playback(event),
            CoordinatorInput::Capture(event) => self.on_capture(event),
            CoordinatorInput::User(action) => self.on_user(action),
            CoordinatorInput::Tick(kind) => self.on_tick(kind),
            CoordinatorInput::Shutdown => {
                self.teardown(None);
                return false;
            }
        }
        true
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notify_tx.send(notification);
    }

    fn report(&self, error: SessionError) {
        warn!("{}", error);
        self.notify(Notification::Error(error));
    }

    /// Hand a message to the transport. Send failures are surfaced by the
    /// transport's own status notifications.
    fn send(&self, message: ClientMessage) {
        if let Err(e) = self.outbound.send(&self.session_id, &message) {
            debug!("{} not delivered: {}", message.kind(), e);
        }
    }

    fn on_server(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ConnectionEstablished => self.on_connection_established(),
            ServerEvent::InterviewStart(start) => self.on_interview_start(start),
            ServerEvent::NextSpeakerInfo(next) => self.on_next_speaker(next),
            ServerEvent::InterviewData(data) => self.on_interview_data(data),
            ServerEvent::ActivityInfo(activity) => self.on_activity(activity),
            ServerEvent::AudioChunks(bytes) => self.on_audio_chunk(bytes),
            ServerEvent::AudioStreamingCompleted => self.on_audio_completed(),
            ServerEvent::SpeechToTextResult(result) => self.on_speech_recognized(result.text),
            ServerEvent::InterviewEnd(end) => self.teardown(end.closing_remarks),
            ServerEvent::Error(error) => {
                let message = match error.code {
                    Some(code) => format!("{} ({})", error.message, code),
                    None => error.message,
                };
                self.report(SessionError::ProtocolError(format!("Server error: {}", message)));
            }
        }
    }

    fn on_connection_established(&mut self) {
        // Reconnects also announce themselves; the interview is only started once
        if self.start_requested || self.state.read().phase() != SessionPhase::Waiting {
            debug!("Connection re-established, interview already requested");
            return;
        }
        if let Some(config_id) = self.config_id.clone() {
            self.send(ClientMessage::LoadConfig { config_id });
        }
        self.send(ClientMessage::StartInterview);
        self.start_requested = true;
    }

    fn on_interview_start(&mut self, start: InterviewStart) {
        let opener = {
            let mut state = self.state.write();
            state.begin(&start.participants);
            state.set_voice(start.voice.clone());

            start.speaker.clone().or_else(|| {
                state
                    .participants()
                    .iter()
                    .find(|p| p.is_automated)
                    .map(|p| p.name.clone())
            })
        };

        if let (Some(remarks), Some(speaker)) = (start.opening_remarks, opener) {
            let sender = {
                let mut state = self.state.write();
                match state.set_speaking(&speaker) {
                    Ok(()) => state.participant(&speaker).map(|p| p.sender()),
                    Err(e) => {
                        self.report(e);
                        None
                    }
                }
            };

            if let Some(sender) = sender {
                if !remarks.trim().is_empty() {
                    self.transcript.add(Message::new(sender, remarks));
                    self.notify(Notification::TranscriptUpdated);
                }
                self.open_stream(Some(speaker));
            }
        }

        self.notify(Notification::StateChanged);
    }

    fn on_next_speaker(&mut self, next: NextSpeakerInfo) {
        let sender = {
            let mut state = self.state.write();
            if let Err(e) = state.set_thinking(&next.speaker) {
                self.report(e);
                return;
            }
            state.participant(&next.speaker).map(|p| p.sender())
        };

        if let Some(sender) = sender {
            self.transcript.add_placeholder(sender);
            self.notify(Notification::TranscriptUpdated);
        }
        self.notify(Notification::StateChanged);
    }

    fn on_interview_data(&mut self, data: InterviewData) {
        let (sender, is_local, transition) = {
            let mut state = self.state.write();
            let (sender, is_local) = match state.require(&data.speaker) {
                Ok(participant) => (participant.sender(), state.is_local(&data.speaker)),
                Err(e) => {
                    self.report(e);
                    return;
                }
            };

            state.set_voice(data.voice.clone());
            let transition = state.apply_topic(data.topic.as_deref(), data.subtopic.as_deref());

            if let Err(e) = state.set_speaking(&data.speaker) {
                self.report(e);
                return;
            }
            if data.requires_human_input && is_local {
                state.set_my_turn(true);
            }
            (sender, is_local, transition)
        };

        if let Some(transition) = transition {
            self.notify(Notification::ModeChanged(transition));
        }

        if data.requires_human_input {
            self.transcript.remove_placeholder(&sender.id);
            if is_local {
                info!("Our turn to answer");
            }
        } else {
            if !data.content.trim().is_empty() {
                self.transcript.add(Message::new(sender, data.content));
            } else {
                self.transcript.remove_placeholder(&sender.id);
            }
            self.open_stream(Some(data.speaker));
        }

        self.notify(Notification::TranscriptUpdated);
        self.notify(Notification::StateChanged);
    }

    fn on_activity(&mut self, activity: ActivityInfo) {
        self.state.write().set_activity(activity);
        self.notify(Notification::StateChanged);
    }

    fn on_speech_recognized(&mut self, text: String) {
        let local = self.state.read().local_sender();
        if !text.trim().is_empty() {
            self.transcript.add(Message::new(local.clone(), text));
        }
        self.transcript.remove_placeholder(&local.id);
        self.notify(Notification::TranscriptUpdated);
    }

    /// Attach a speaker to the inbound speech stream, opening one if needed.
    ///
    /// A stream opened implicitly by early chunks is adopted; anything else
    /// still playing is pre-empted.
    fn open_stream(&mut self, speaker: Option<String>) {
        if let Some(stream) = self.stream.as_mut() {
            if stream.speaker.is_none() && !stream.inbound_done && speaker.is_some() {
                stream.speaker = speaker;
                return;
            }
        }

        if self.playback.is_playing() {
            debug!("Pre-empting previous speech stream");
            self.playback.stop();
        }
        self.stream = None;

        match self.playback.begin_stream() {
            Ok(id) => {
                self.stream = Some(SpeechStream {
                    id,
                    speaker,
                    inbound_done: false,
                })
            }
            Err(e) => self.report(e),
        }
    }

    fn on_audio_chunk(&mut self, bytes: Vec<u8>) {
        let needs_stream = self.stream.as_ref().map(|s| s.inbound_done).unwrap_or(true);
        if needs_stream {
            self.open_stream(None);
        }

        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        if let Err(e) = self.playback.push_chunk(stream.id, bytes) {
            debug!("Chunk not queued: {}", e);
        }
    }

    fn on_audio_completed(&mut self) {
        let Some(stream) = self.stream.as_mut().filter(|s| !s.inbound_done) else {
            debug!("Streaming completed without an open stream");
            return;
        };
        stream.inbound_done = true;
        let id = stream.id;
        if let Err(e) = self.playback.finish_stream(id) {
            debug!("Stream end not queued: {}", e);
        }
    }

    fn take_stream(&mut self, stream_id: Uuid) -> Option<SpeechStream> {
        if self.stream.as_ref().map(|s| s.id) == Some(stream_id) {
            self.stream.take()
        } else {
            None
        }
    }

    fn on_playback(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::StreamCompleted { stream_id } => {
                let Some(stream) = self.take_stream(stream_id) else {
                    debug!("Completion of stale stream {}", stream_id);
                    return;
                };

                if self.latch.is_tripped() {
                    return;
                }
                if let Some(speaker) = stream.speaker {
                    if let Err(e) = self.state.write().finish_speaking(&speaker) {
                        self.report(e);
                    }
                }
                self.send(ClientMessage::AudioPlaybackCompleted);
                self.notify(Notification::StateChanged);
            }
            PlaybackEvent::Stopped { stream_id } => {
                self.take_stream(stream_id);
            }
            PlaybackEvent::DecodeFailed { error, .. } => {
                self.report(SessionError::DecodeError(error));
            }
            PlaybackEvent::Error { error, .. } => {
                self.report(SessionError::PlaybackError(error));
            }
            PlaybackEvent::StreamStarted { stream_id } => {
                debug!("Playback of {} started", stream_id);
            }
            PlaybackEvent::UnitStarted {
                stream_id, bytes, ..
            } => {
                debug!("Playing {} bytes of {}", bytes, stream_id);
            }
        }
    }

    fn on_channel(&mut self, status: ChannelStatus) {
        match &status {
            ChannelStatus::Connected => {
                self.state.write().set_panel_connection(ConnectionStatus::Connected);
            }
            ChannelStatus::Disconnected => {
                self.state.write().set_panel_connection(ConnectionStatus::Disconnected);
            }
            ChannelStatus::Reconnecting { .. } => {
                self.state.write().set_panel_connection(ConnectionStatus::Connecting);
            }
            ChannelStatus::ConnectionFailed => {
                self.state.write().set_panel_connection(ConnectionStatus::Disconnected);
                self.notify(Notification::Connection(status.clone()));
                self.report(SessionError::ConnectionFailed(
                    "reconnect attempts exhausted".to_string(),
                ));
                self.teardown(None);
                return;
            }
            ChannelStatus::SendFailed { kind } => {
                self.report(SessionError::ChannelClosed(kind.to_string()));
                return;
            }
            ChannelStatus::MalformedFrame(error) => {
                self.report(SessionError::ProtocolError(error.clone()));
                return;
            }
        }
        self.notify(Notification::Connection(status));
        self.notify(Notification::StateChanged);
    }

    fn on_user(&mut self, action: UserAction) {
        match action {
            UserAction::ToggleMicrophone => self.toggle_microphone(),
            UserAction::UpdateCode(code) => {
                if self.state.write().update_code(code) {
                    self.notify(Notification::StateChanged);
                } else {
                    debug!("Code input is frozen");
                }
            }
            UserAction::SubmitCode => self.submit_code(),
            UserAction::AcknowledgeInstructions => self.send(ClientMessage::InstructionAck),
            UserAction::EndInterview => {
                self.send(ClientMessage::InterviewEnd);
                self.teardown(None);
            }
            UserAction::Exit => self.teardown(None),
        }
    }

    fn toggle_microphone(&mut self) {
        match self.microphone {
            Microphone::Idle => {
                let turn_held = self.state.read().turn_held();
                if !turn_held {
                    self.report(SessionError::TurnNotHeld);
                    return;
                }
                match self.capture.start(turn_held) {
                    Ok(()) => self.microphone = Microphone::Opening,
                    Err(e) => self.report(e),
                }
            }
            Microphone::Recording => {
                if let Err(e) = self.capture.stop() {
                    self.report(e);
                    self.microphone = Microphone::Idle;
                    return;
                }
                self.microphone = Microphone::Finishing;
                self.state.write().set_my_turn(false);
                self.notify(Notification::RecordingStopped);
                self.notify(Notification::StateChanged);
            }
            Microphone::Opening | Microphone::Finishing => {
                debug!("Microphone busy ({:?}), toggle ignored", self.microphone);
            }
        }
    }

    fn on_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Started { id } => {
                // The turn may have moved on while the device was opening
                if self.microphone != Microphone::Opening || !self.state.read().turn_held() {
                    debug!("Recording {} no longer wanted", id);
                    self.capture.cancel();
                    self.microphone = Microphone::Idle;
                    return;
                }
                self.microphone = Microphone::Recording;
                self.notify(Notification::RecordingStarted);
            }
            CaptureEvent::Failed(error) | CaptureEvent::EncodeFailed(error) => {
                self.microphone = Microphone::Idle;
                self.report(error);
            }
            CaptureEvent::Finished(recording) => {
                self.microphone = Microphone::Idle;
                self.send(ClientMessage::RawAudioData {
                    audio: recording.audio_base64,
                });
                let local = self.state.read().local_sender();
                self.transcript.add_placeholder(local);
                self.notify(Notification::TranscriptUpdated);
                self.notify(Notification::StateChanged);
            }
        }
    }

    fn submit_code(&mut self) {
        let code = {
            let mut state = self.state.write();
            let code = state.code_draft().to_string();
            state.freeze_input();
            code
        };
        info!("Submitting {} bytes of code", code.len());
        self.send(ClientMessage::DoneProblemSolving { code });
        self.notify(Notification::StateChanged);
    }

    fn on_tick(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Elapsed => {
                self.state.write().tick_elapsed();
            }
            TimerKind::Countdown => {
                let transition = self.state.write().tick_countdown();
                if let Some(transition) = transition {
                    self.notify(Notification::ModeChanged(transition));
                    if transition == ModeTransition::LiveCodingExpired && !self.auto_submitted {
                        self.auto_submitted = true;
                        self.submit_code();
                    }
                }
            }
        }
        self.notify(Notification::StateChanged);
    }

    fn release_devices(&mut self) {
        self.capture.cancel();
        self.microphone = Microphone::Idle;
        self.playback.stop();
        self.stream = None;
    }

    /// End the session locally. Runs once; later calls are no-ops.
    fn teardown(&mut self, closing_remarks: Option<String>) {
        if !self.latch.trip() {
            return;
        }
        self.state.write().end(closing_remarks.clone());
        self.release_devices();
        self.outbound.close();

        info!("Interview session ended");
        self.notify(Notification::StateChanged);
        self.notify(Notification::SessionEnded { closing_remarks });
    }
}
