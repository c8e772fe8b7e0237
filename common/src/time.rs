//! Provides utilities for managing timers.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

/// A single-shot alarm.
///
/// `expired()` completes when the deadline armed by the most recent `reset()`
/// passes. An alarm that was never armed, or whose deadline was cleared with
/// `cancel()`, never completes.
pub struct Alarm {
    deadline: Mutex<Option<Instant>>,
    rearmed: Notify,
}

impl Alarm {
    /// Creates a disarmed alarm.
    pub fn new() -> Self {
        Alarm { deadline: Mutex::new(None), rearmed: Notify::new() }
    }

    /// Arms the alarm to fire after `duration`, replacing any pending deadline.
    pub fn reset(&self, duration: Duration) {
        *self.deadline.lock().unwrap() = Some(Instant::now() + duration);
        self.rearmed.notify_one();
    }

    /// Disarms the alarm without firing it.
    pub fn cancel(&self) {
        *self.deadline.lock().unwrap() = None;
        self.rearmed.notify_one();
    }

    /// Completes once the armed deadline passes.
    pub async fn expired(&self) {
        loop {
            let deadline = *self.deadline.lock().unwrap();
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = sleep_until(at) => {
                            // One-shot: clear the deadline unless it was
                            // rearmed while we slept.
                            let mut pending = self.deadline.lock().unwrap();
                            if *pending == Some(at) {
                                *pending = None;
                                return;
                            }
                        }
                        _ = self.rearmed.notified() => {}
                    }
                }
                None => self.rearmed.notified().await,
            }
        }
    }
}

impl Default for Alarm {
    fn default() -> Self {
        Alarm::new()
    }
}
