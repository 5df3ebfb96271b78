use std::hint;
use std::thread;
use std::time::Duration;

use quanta::Instant;

/// Time-ramped backoff for idle engine loops: busy-spin while the idle
/// period is short, degrade to yielding, then to minimal sleeps. Keeps the
/// reaction latency low when traffic resumes quickly without pinning a core
/// forever.
pub(crate) struct IdleBackoff {
    spin_for: Duration,
    yield_until: Duration,
    idle_since: Option<Instant>,
}

impl IdleBackoff {
    pub fn new() -> Self {
        IdleBackoff {
            spin_for: Duration::from_millis(100),
            yield_until: Duration::from_secs(1),
            idle_since: None,
        }
    }

    /// One idle iteration: spin, yield or sleep depending on how long the
    /// loop has been without work.
    pub fn idle(&mut self) {
        let since = *self.idle_since.get_or_insert_with(Instant::now);
        let idle_time = since.elapsed();

        if idle_time < self.spin_for {
            hint::spin_loop();
        } else if idle_time < self.yield_until {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_nanos(1));
        }
    }

    /// Work arrived; the next idle period starts from scratch.
    pub fn reset(&mut self) {
        self.idle_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramps_and_resets() {
        let mut backoff = IdleBackoff::new();
        assert!(backoff.idle_since.is_none());
        backoff.idle();
        assert!(backoff.idle_since.is_some());
        backoff.reset();
        assert!(backoff.idle_since.is_none());
    }
}
