//! Interview state: roster, turns, mode and clocks

pub mod state;
pub mod timer;
pub mod topic;

pub use state::{
    ConnectionStatus, ModeTransition, Participant, SessionPhase, SessionSnapshot,
    SessionStateMachine, TurnState,
};
pub use timer::{CountdownClock, ElapsedClock, EndedLatch, SessionTimer, TimerConfig};
pub use topic::TopicRules;
