//! End-to-end integration module
//!
//! This module provides the orchestration layer that connects all components
//! of an interview session: Transport -> Coordinator -> State / Capture / Playback

pub mod config;
pub mod coordinator;
pub mod orchestrator;

pub use config::SessionConfig;
pub use coordinator::{CoordinatorInput, Notification, TimerKind, TurnCoordinator, UserAction};
pub use orchestrator::{InterviewOrchestrator, OrchestratorBuilder, SessionHandle};
