//! Session clocks and the periodic task that drives them
//!
//! Clocks are plain counters with start/stop/reset; they only move when a
//! tick is applied. [`SessionTimer`] is the scheduled task that produces the
//! ticks. Both sides consult the [`EndedLatch`], so a tick that was already
//! in flight when the session ended is dropped rather than applied.

use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Clock configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Length of the live-coding phase in seconds
    pub live_coding_secs: u64,

    /// Tick period in milliseconds
    pub tick_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            live_coding_secs: 900,
            tick_interval_ms: 1000,
        }
    }
}

impl TimerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// One-way "session is over" flag
#[derive(Debug, Clone, Default)]
pub struct EndedLatch(Arc<AtomicBool>);

impl EndedLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the latch; returns true only for the first call
    pub fn trip(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Count-up clock for total session time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElapsedClock {
    seconds: u64,
    running: bool,
}

impl ElapsedClock {
    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn reset(&mut self) {
        self.seconds = 0;
    }

    pub fn tick(&mut self) {
        if self.running {
            self.seconds += 1;
        }
    }

    pub fn seconds(&self) -> u64 {
        self.seconds
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

/// Countdown clock for the live-coding phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountdownClock {
    duration_secs: u64,
    remaining_secs: u64,
    running: bool,
}

impl CountdownClock {
    pub fn new(duration_secs: u64) -> Self {
        Self {
            duration_secs,
            remaining_secs: duration_secs,
            running: false,
        }
    }

    pub fn start(&mut self) {
        self.running = self.remaining_secs > 0;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn reset(&mut self) {
        self.remaining_secs = self.duration_secs;
    }

    /// Advance one second. Returns true on the tick that reaches zero.
    pub fn tick(&mut self) -> bool {
        if !self.running {
            return false;
        }
        self.remaining_secs = self.remaining_secs.saturating_sub(1);
        if self.remaining_secs == 0 {
            self.running = false;
            return true;
        }
        false
    }

    pub fn remaining_secs(&self) -> u64 {
        self.remaining_secs
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

/// Periodic task with explicit start/stop
pub struct SessionTimer {
    name: &'static str,
    latch: EndedLatch,
    task: Option<JoinHandle<()>>,
}

impl SessionTimer {
    pub fn new(name: &'static str, latch: EndedLatch) -> Self {
        Self {
            name,
            latch,
            task: None,
        }
    }

    /// Call `on_tick` every `period` until stopped or the latch trips.
    /// Restarting replaces the previous task.
    pub fn start<F>(&mut self, period: Duration, on_tick: F)
    where
        F: Fn() + Send + 'static,
    {
        self.stop();

        let latch = self.latch.clone();
        let name = self.name;
        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                if latch.is_tripped() {
                    debug!("{} timer stopping, session ended", name);
                    break;
                }
                on_tick();
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
