//! Per-key alert suppression.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Suppresses repeat alerts for the same key within a cooldown.
#[derive(Debug)]
pub struct AlertDeduper {
    cooldown: Duration,
    last_sent: HashMap<String, Instant>,
}

impl AlertDeduper {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sent: HashMap::new(),
        }
    }

    /// Returns true if an alert for `key` may be sent at `now`, and records it.
    pub fn should_send(&mut self, key: &str, now: Instant) -> bool {
        match self.last_sent.get(key) {
            Some(last) if now.saturating_duration_since(*last) < self.cooldown => false,
            _ => {
                self.last_sent.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Drop entries whose cooldown has expired.
    pub fn prune(&mut self, now: Instant) {
        let cooldown = self.cooldown;
        self.last_sent
            .retain(|_, last| now.saturating_duration_since(*last) < cooldown);
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Change the cooldown. Keys already sent are judged against the new value.
    pub fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }

    pub fn clear(&mut self) {
        self.last_sent.clear();
    }

    pub fn len(&self) -> usize {
        self.last_sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_sent.is_empty()
    }
}
