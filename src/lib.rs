pub mod audio;
pub mod integration;
pub mod messages;
pub mod session;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Participant not in roster: {0}")]
    UnknownParticipant(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Recording refused, turn not held")]
    TurnNotHeld,

    #[error("Audio decode error: {0}")]
    DecodeError(String),

    #[error("Playback error: {0}")]
    PlaybackError(String),

    #[error("Audio processing error: {0}")]
    AudioProcessingError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::ProtocolError(e.to_string())
    }
}

impl SessionError {
    /// Check if the session can keep running after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Dropped sends are reported, the channel may come back
            SessionError::ChannelClosed(_) => true,
            // Retries are exhausted at this point
            SessionError::ConnectionFailed(_) => false,
            SessionError::ProtocolError(_) => true,
            SessionError::UnknownParticipant(_) => true,
            // The turn proceeds without capture
            SessionError::DeviceUnavailable(_) => true,
            SessionError::TurnNotHeld => true,
            SessionError::DecodeError(_) => true,
            SessionError::PlaybackError(_) => true,
            SessionError::AudioProcessingError(_) => true,
            SessionError::ConfigError(_) => false,
            SessionError::ChannelError(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            SessionError::ChannelClosed(_) => {
                "Not connected to the interview server. Your last action was not delivered.".to_string()
            }
            SessionError::ConnectionFailed(_) => {
                "Lost connection to the interview server. Please rejoin the interview.".to_string()
            }
            SessionError::ProtocolError(_) => {
                "Received an unexpected message from the server.".to_string()
            }
            SessionError::UnknownParticipant(_) => {
                "The interview panel is out of sync. Some updates may be missing.".to_string()
            }
            SessionError::DeviceUnavailable(_) => {
                "Microphone unavailable. Please check permissions and your input device.".to_string()
            }
            SessionError::TurnNotHeld => {
                "Please wait for your turn to speak.".to_string()
            }
            SessionError::DecodeError(_) => {
                "Part of the interviewer's audio could not be played.".to_string()
            }
            SessionError::PlaybackError(_) => {
                "Audio playback failed. Please check your speakers.".to_string()
            }
            SessionError::AudioProcessingError(_) => {
                "Audio processing failed. Please try again.".to_string()
            }
            SessionError::ConfigError(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            SessionError::ChannelError(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
