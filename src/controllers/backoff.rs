use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use kube::runtime::controller::Action;

use crate::{Error, Requeue};

/// Exponential backoff per object key.
///
/// The n-th consecutive failure of a key waits `base * 2^n`, capped at `max`. A success resets
/// the key so that the next failure starts from `base` again.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return how long to wait before the next attempt
    pub fn next(&self, key: &str) -> Duration {
        let attempt = {
            let mut attempts = self
                .attempts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let attempt = attempts.entry(key.to_owned()).or_insert(0);
            let current = *attempt;
            *attempt = attempt.saturating_add(1);
            current
        };

        // 2^31 seconds is far beyond any sensible cap already
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn reset(&self, key: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }

    /// Number of keys with a failure series in progress
    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// The follow up for a failed reconcile of `key`
    pub fn action_for(&self, key: &str, error: &Error) -> Action {
        match error.requeue() {
            Requeue::Immediately => Action::requeue(Duration::ZERO),
            Requeue::WithBackoff => Action::requeue(self.next(key)),
            Requeue::AwaitChange => {
                // an external change starts a fresh series
                self.reset(key);
                Action::await_change()
            }
        }
    }
}
