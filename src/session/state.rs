//! Authoritative interview state
//!
//! [`SessionStateMachine`] owns the roster, the turn arbitration, the
//! conversation/live-coding mode and both clocks. Each public method is one
//! transition; callers hold the write lock for the whole call so no other
//! transition interleaves with it.

use crate::messages::Sender;
use crate::session::timer::{CountdownClock, ElapsedClock, TimerConfig};
use crate::session::topic::TopicRules;
use crate::transport::protocol::{ActivityInfo, RosterEntry};
use crate::{Result, SessionError};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Thinking,
    Speaking,
    Listening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub is_automated: bool,
    pub turn: TurnState,
    pub connection: ConnectionStatus,
}

impl Participant {
    pub fn sender(&self) -> Sender {
        Sender::new(self.id.clone(), self.name.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Connected, roster not yet received
    Waiting,
    InProgress,
    Completed,
}

/// Mode changes reported back to the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeTransition {
    EnteredLiveCoding,
    ExitedLiveCoding,
    /// The countdown ran out and input is frozen
    LiveCodingExpired,
}

/// Read-only copy of the state for rendering
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub local_participant_id: String,
    pub phase: SessionPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub participants: Vec<Participant>,
    pub active_speaker: Option<String>,
    pub is_my_turn: bool,
    pub topic: Option<String>,
    pub subtopic: Option<String>,
    pub live_coding: bool,
    pub problem_visible: bool,
    pub timer_visible: bool,
    pub input_frozen: bool,
    pub elapsed_secs: u64,
    pub countdown_secs: u64,
    pub activity: Option<ActivityInfo>,
    pub code_draft: String,
    pub voice: Option<String>,
    pub closing_remarks: Option<String>,
}

pub struct SessionStateMachine {
    local_id: String,
    local_name: String,
    rules: TopicRules,
    phase: SessionPhase,
    started_at: Option<DateTime<Utc>>,
    participants: Vec<Participant>,
    active_speaker: Option<String>,
    is_my_turn: bool,
    topic: Option<String>,
    subtopic: Option<String>,
    live_coding: bool,
    problem_visible: bool,
    timer_visible: bool,
    input_frozen: bool,
    elapsed: ElapsedClock,
    countdown: CountdownClock,
    activity: Option<ActivityInfo>,
    code_draft: String,
    voice: Option<String>,
    closing_remarks: Option<String>,
    ended: bool,
}

impl SessionStateMachine {
    pub fn new(
        local_id: impl Into<String>,
        local_name: impl Into<String>,
        rules: TopicRules,
        timers: &TimerConfig,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            local_name: local_name.into(),
            rules,
            phase: SessionPhase::Waiting,
            started_at: None,
            participants: Vec::new(),
            active_speaker: None,
            is_my_turn: false,
            topic: None,
            subtopic: None,
            live_coding: false,
            problem_visible: false,
            timer_visible: false,
            input_frozen: false,
            elapsed: ElapsedClock::default(),
            countdown: CountdownClock::new(timers.live_coding_secs),
            activity: None,
            code_draft: String::new(),
            voice: None,
            closing_remarks: None,
            ended: false,
        }
    }

    /// Install the roster and start the session clock.
    ///
    /// The local participant is added when the server roster leaves them out.
    pub fn begin(&mut self, roster: &[RosterEntry]) {
        if self.ended {
            return;
        }

        self.participants = roster
            .iter()
            .map(|entry| Participant {
                id: entry.id.clone(),
                name: entry.name.clone(),
                is_automated: entry.is_automated && entry.id != self.local_id,
                turn: TurnState::Listening,
                connection: ConnectionStatus::Connected,
            })
            .collect();

        if !self.participants.iter().any(|p| p.id == self.local_id) {
            self.participants.push(Participant {
                id: self.local_id.clone(),
                name: self.local_name.clone(),
                is_automated: false,
                turn: TurnState::Listening,
                connection: ConnectionStatus::Connected,
            });
        }

        self.phase = SessionPhase::InProgress;
        self.started_at = Some(Utc::now());
        self.elapsed.reset();
        self.elapsed.start();

        info!("Interview started with {} participants", self.participants.len());
    }

    /// Look up a participant by display name or id
    pub fn participant(&self, name: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.name == name || p.id == name)
    }

    /// Like [`Self::participant`] but a missing name is a protocol error
    pub fn require(&self, name: &str) -> Result<&Participant> {
        self.participant(name)
            .ok_or_else(|| SessionError::UnknownParticipant(name.to_string()))
    }

    pub fn local_participant(&self) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == self.local_id)
    }

    pub fn local_sender(&self) -> Sender {
        Sender::new(self.local_id.clone(), self.local_name.clone())
    }

    pub fn is_local(&self, name: &str) -> bool {
        self.participant(name)
            .map(|p| p.id == self.local_id)
            .unwrap_or(false)
    }

    /// Give `name` the floor in `turn`, everyone else listens
    fn assign_floor(&mut self, name: &str, turn: TurnState) -> Result<()> {
        let index = self
            .participants
            .iter()
            .position(|p| p.name == name || p.id == name)
            .ok_or_else(|| SessionError::UnknownParticipant(name.to_string()))?;

        if self.ended {
            return Ok(());
        }

        for (i, participant) in self.participants.iter_mut().enumerate() {
            participant.turn = if i == index { turn } else { TurnState::Listening };
        }
        let holder = &self.participants[index];
        self.active_speaker = Some(holder.name.clone());
        if holder.id != self.local_id {
            self.is_my_turn = false;
        }

        debug!("{} is now {:?}", name, turn);
        Ok(())
    }

    pub fn set_thinking(&mut self, name: &str) -> Result<()> {
        self.assign_floor(name, TurnState::Thinking)
    }

    pub fn set_speaking(&mut self, name: &str) -> Result<()> {
        self.assign_floor(name, TurnState::Speaking)
    }

    /// Return `name` to listening if they still hold the floor as speaker
    pub fn finish_speaking(&mut self, name: &str) -> Result<()> {
        let participant = self
            .participants
            .iter_mut()
            .find(|p| p.name == name || p.id == name)
            .ok_or_else(|| SessionError::UnknownParticipant(name.to_string()))?;

        if participant.turn == TurnState::Speaking {
            participant.turn = TurnState::Listening;
            if self.active_speaker.as_deref() == Some(participant.name.as_str()) {
                self.active_speaker = None;
            }
        }
        Ok(())
    }

    pub fn set_my_turn(&mut self, held: bool) {
        if self.ended {
            return;
        }
        self.is_my_turn = held;
    }

    /// Whether the local participant may open the microphone
    pub fn turn_held(&self) -> bool {
        !self.ended
            && self.is_my_turn
            && self
                .local_participant()
                .map(|p| p.turn == TurnState::Speaking)
                .unwrap_or(false)
    }

    /// Mark every automated participant with the transport's status
    pub fn set_panel_connection(&mut self, status: ConnectionStatus) {
        for participant in self.participants.iter_mut().filter(|p| p.is_automated) {
            participant.connection = status;
        }
    }

    /// Record topic/subtopic and apply the mode rules they imply
    pub fn apply_topic(
        &mut self,
        topic: Option<&str>,
        subtopic: Option<&str>,
    ) -> Option<ModeTransition> {
        if self.ended {
            return None;
        }

        if let Some(topic) = topic {
            self.topic = Some(topic.to_string());
        }
        if let Some(subtopic) = subtopic {
            self.subtopic = Some(subtopic.to_string());
        }

        if subtopic.is_some_and(|s| self.rules.is_discussion_subtopic(s)) {
            if self.exit_live_coding() {
                return Some(ModeTransition::ExitedLiveCoding);
            }
            return None;
        }

        if topic.is_some_and(|t| self.rules.is_live_coding_topic(t)) && self.enter_live_coding() {
            return Some(ModeTransition::EnteredLiveCoding);
        }

        None
    }

    /// Returns false when already in live-coding mode
    pub fn enter_live_coding(&mut self) -> bool {
        if self.ended || self.live_coding {
            return false;
        }
        self.live_coding = true;
        self.problem_visible = true;
        self.timer_visible = true;
        self.input_frozen = false;
        self.countdown.reset();
        self.countdown.start();
        info!("Entered live-coding mode ({}s)", self.countdown.remaining_secs());
        true
    }

    /// Returns false when not in live-coding mode
    pub fn exit_live_coding(&mut self) -> bool {
        if self.ended || !self.live_coding {
            return false;
        }
        self.live_coding = false;
        self.problem_visible = false;
        self.timer_visible = false;
        self.countdown.stop();
        info!("Left live-coding mode");
        true
    }

    pub fn tick_elapsed(&mut self) {
        if self.ended {
            return;
        }
        self.elapsed.tick();
    }

    /// Advance the live-coding countdown; reports expiry exactly once
    pub fn tick_countdown(&mut self) -> Option<ModeTransition> {
        if self.ended || !self.live_coding {
            return None;
        }
        if !self.countdown.tick() {
            return None;
        }

        self.exit_live_coding();
        self.input_frozen = true;
        info!("Live-coding time is up, input frozen");
        Some(ModeTransition::LiveCodingExpired)
    }

    pub fn set_activity(&mut self, activity: ActivityInfo) {
        if self.ended {
            return;
        }
        if self.code_draft.is_empty() {
            self.code_draft = activity.starter_code.clone();
        }
        self.activity = Some(activity);
    }

    /// Replace the code draft unless input is frozen
    pub fn update_code(&mut self, code: String) -> bool {
        if self.ended || self.input_frozen {
            return false;
        }
        self.code_draft = code;
        true
    }

    pub fn code_draft(&self) -> &str {
        &self.code_draft
    }

    pub fn freeze_input(&mut self) {
        self.input_frozen = true;
    }

    pub fn is_input_frozen(&self) -> bool {
        self.input_frozen
    }

    pub fn set_voice(&mut self, voice: Option<String>) {
        if voice.is_some() {
            self.voice = voice;
        }
    }

    /// Terminal transition: clocks stop, flags clear, later ticks are ignored.
    /// Returns false if the session had already ended.
    pub fn end(&mut self, closing_remarks: Option<String>) -> bool {
        if self.ended {
            return false;
        }
        self.ended = true;
        self.phase = SessionPhase::Completed;
        self.elapsed.stop();
        self.countdown.stop();
        self.live_coding = false;
        self.problem_visible = false;
        self.timer_visible = false;
        self.input_frozen = true;
        self.is_my_turn = false;
        self.active_speaker = None;
        for participant in self.participants.iter_mut() {
            participant.turn = TurnState::Listening;
        }
        if closing_remarks.is_some() {
            self.closing_remarks = closing_remarks;
        }
        info!("Session ended after {}s", self.elapsed.seconds());
        true
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn is_live_coding(&self) -> bool {
        self.live_coding
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn active_speaker(&self) -> Option<&str> {
        self.active_speaker.as_deref()
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed.seconds()
    }

    pub fn countdown_secs(&self) -> u64 {
        self.countdown.remaining_secs()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            local_participant_id: self.local_id.clone(),
            phase: self.phase,
            started_at: self.started_at,
            participants: self.participants.clone(),
            active_speaker: self.active_speaker.clone(),
            is_my_turn: self.is_my_turn,
            topic: self.topic.clone(),
            subtopic: self.subtopic.clone(),
            live_coding: self.live_coding,
            problem_visible: self.problem_visible,
            timer_visible: self.timer_visible,
            input_frozen: self.input_frozen,
            elapsed_secs: self.elapsed.seconds(),
            countdown_secs: self.countdown.remaining_secs(),
            activity: self.activity.clone(),
            code_draft: self.code_draft.clone(),
            voice: self.voice.clone(),
            closing_remarks: self.closing_remarks.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Vec<RosterEntry> {
        vec![
            RosterEntry {
                id: "a1".to_string(),
                name: "Ada".to_string(),
                is_automated: true,
            },
            RosterEntry {
                id: "b1".to_string(),
                name: "Bo".to_string(),
                is_automated: true,
            },
        ]
    }

    fn machine(live_coding_secs: u64) -> SessionStateMachine {
        let timers = TimerConfig {
            live_coding_secs,
            ..Default::default()
        };
        let mut sm = SessionStateMachine::new("me", "Casey", TopicRules::default(), &timers);
        sm.begin(&roster());
        sm
    }

    fn floor_holders(sm: &SessionStateMachine) -> usize {
        sm.participants()
            .iter()
            .filter(|p| p.turn != TurnState::Listening)
            .count()
    }

    #[test]
    fn test_begin_adds_local_participant() {
        let sm = machine(900);
        assert_eq!(sm.participants().len(), 3);
        let me = sm.local_participant().unwrap();
        assert_eq!(me.name, "Casey");
        assert!(!me.is_automated);
        assert_eq!(sm.phase(), SessionPhase::InProgress);
    }

    #[test]
    fn test_single_floor_holder() {
        let mut sm = machine(900);
        for name in ["Ada", "Bo", "Casey", "Bo", "Ada"] {
            sm.set_thinking(name).unwrap();
            assert_eq!(floor_holders(&sm), 1);
            sm.set_speaking(name).unwrap();
            assert_eq!(floor_holders(&sm), 1);
            assert_eq!(sm.active_speaker(), Some(name));
        }
    }

    #[test]
    fn test_unknown_participant_leaves_turns_alone() {
        let mut sm = machine(900);
        sm.set_speaking("Ada").unwrap();
        let before = sm.participants().to_vec();

        let result = sm.set_thinking("Mallory");

        assert_eq!(
            result,
            Err(SessionError::UnknownParticipant("Mallory".to_string()))
        );
        assert_eq!(sm.participants(), before.as_slice());
        assert_eq!(sm.active_speaker(), Some("Ada"));
    }

    #[test]
    fn test_turn_held_requires_speaking() {
        let mut sm = machine(900);
        sm.set_my_turn(true);
        assert!(!sm.turn_held());

        sm.set_speaking("Casey").unwrap();
        assert!(sm.turn_held());

        sm.set_thinking("Ada").unwrap();
        assert!(!sm.turn_held());
    }

    #[test]
    fn test_topic_entry_is_idempotent() {
        let mut sm = machine(900);

        let first = sm.apply_topic(Some("Problem Solving"), None);
        let second = sm.apply_topic(Some("Problem Solving"), None);

        assert_eq!(first, Some(ModeTransition::EnteredLiveCoding));
        assert_eq!(second, None);
        let snap = sm.snapshot();
        assert!(snap.live_coding && snap.problem_visible && snap.timer_visible);
    }

    #[test]
    fn test_discussion_subtopic_exits_once() {
        let mut sm = machine(900);
        sm.apply_topic(Some("problem_introduction"), None);

        let first = sm.apply_topic(Some("Problem Solving"), Some("Task-specific discussion"));
        let second = sm.apply_topic(None, Some("Task-specific discussion"));

        assert_eq!(first, Some(ModeTransition::ExitedLiveCoding));
        assert_eq!(second, None);
        let snap = sm.snapshot();
        assert!(!snap.live_coding && !snap.problem_visible && !snap.timer_visible);
    }

    #[test]
    fn test_discussion_subtopic_outside_live_coding_is_noop() {
        let mut sm = machine(900);
        assert_eq!(sm.apply_topic(None, Some("task specific discussion")), None);
        assert!(!sm.is_live_coding());
    }

    #[test]
    fn test_countdown_expiry_after_full_duration() {
        let mut sm = machine(900);
        sm.apply_topic(Some("Problem Solving"), None);

        let mut expirations = 0;
        for _ in 0..905 {
            if sm.tick_countdown() == Some(ModeTransition::LiveCodingExpired) {
                expirations += 1;
            }
        }

        assert_eq!(expirations, 1);
        assert!(!sm.is_live_coding());
        assert!(sm.is_input_frozen());
        assert_eq!(sm.countdown_secs(), 0);
    }

    #[test]
    fn test_countdown_not_expired_early() {
        let mut sm = machine(900);
        sm.apply_topic(Some("Problem Solving"), None);
        for _ in 0..899 {
            assert_eq!(sm.tick_countdown(), None);
        }
        assert!(sm.is_live_coding());
        assert_eq!(sm.countdown_secs(), 1);
    }

    #[test]
    fn test_frozen_input_rejects_code() {
        let mut sm = machine(900);
        assert!(sm.update_code("let x = 1;".to_string()));
        sm.freeze_input();
        assert!(!sm.update_code("let x = 2;".to_string()));
        assert_eq!(sm.code_draft(), "let x = 1;");
    }

    #[test]
    fn test_activity_seeds_code_draft() {
        let mut sm = machine(900);
        sm.set_activity(ActivityInfo {
            scenario: "Rate limiter".to_string(),
            task: "Implement it".to_string(),
            starter_code: "fn limit() {}".to_string(),
        });
        assert_eq!(sm.code_draft(), "fn limit() {}");
    }

    #[test]
    fn test_end_is_terminal() {
        let mut sm = machine(900);
        sm.apply_topic(Some("Problem Solving"), None);
        sm.tick_elapsed();

        assert!(sm.end(Some("Thanks!".to_string())));
        assert!(!sm.end(None));

        sm.tick_elapsed();
        assert_eq!(sm.tick_countdown(), None);
        assert_eq!(sm.apply_topic(Some("Problem Solving"), None), None);

        let snap = sm.snapshot();
        assert_eq!(snap.elapsed_secs, 1);
        assert_eq!(snap.phase, SessionPhase::Completed);
        assert!(!snap.live_coding && !snap.problem_visible && !snap.timer_visible);
        assert_eq!(snap.closing_remarks.as_deref(), Some("Thanks!"));
    }
}
