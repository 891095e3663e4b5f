//! One-shot timers polled from the run loop.
//!
//! Entries are keyed by `(deadline, sequence)`: the sequence number is handed
//! out at insertion, so two timers with the same deadline fire in the order
//! they were scheduled. Nothing runs in the background; [`TimerScheduler::tick`]
//! (or [`TimerScheduler::pop_due`]) must be called by the owner.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::Error;

/// Upper bound on a timer delay, roughly thirty years.
pub const MAX_DELAY: Duration = Duration::from_secs(86400 * 365 * 30);

/// A scheduled callback. Arguments are captured by the closure.
pub type TimerCallback<S> = Box<dyn FnOnce(&mut S) -> Result<(), Error>>;

pub struct TimerScheduler<S> {
    queue: BTreeMap<(Instant, u64), TimerCallback<S>>,
    next_seq: u64,
}

impl<S> Default for TimerScheduler<S> {
    fn default() -> Self {
        Self {
            queue: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

impl<S> TimerScheduler<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` once, no earlier than `delay` from now.
    ///
    /// Delays too large to represent are clamped to [`MAX_DELAY`].
    pub fn call_in<F>(&mut self, delay: Duration, callback: F)
    where
        F: FnOnce(&mut S) -> Result<(), Error> + 'static,
    {
        let now = Instant::now();
        let deadline = now
            .checked_add(delay.min(MAX_DELAY))
            .unwrap_or(now + MAX_DELAY);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert((deadline, seq), Box::new(callback));
    }

    /// Sequence number the next scheduled timer will get. Pass it to
    /// [`TimerScheduler::pop_due`] to leave timers added from here on for a
    /// later pass.
    pub fn watermark(&self) -> u64 {
        self.next_seq
    }

    /// Remove and return the earliest callback due at `now` that was
    /// scheduled before `watermark`.
    ///
    /// Callbacks are popped one at a time so that anything not yet popped
    /// stays queued if the caller bails out on an error.
    pub fn pop_due(&mut self, now: Instant, watermark: u64) -> Option<TimerCallback<S>> {
        let entry = self.queue.first_entry()?;
        let (deadline, seq) = *entry.key();
        if deadline > now || seq >= watermark {
            return None;
        }
        Some(entry.remove())
    }

    /// Fire due timers against `ctx`. Timers registered by a callback are
    /// queued for a later tick. On error the remaining due timers stay
    /// queued.
    pub fn tick(&mut self, ctx: &mut S) -> Result<usize, Error> {
        let now = Instant::now();
        let watermark = self.watermark();
        let mut fired = 0;
        while let Some(callback) = self.pop_due(now, watermark) {
            fired += 1;
            callback(ctx)?;
        }
        Ok(fired)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
