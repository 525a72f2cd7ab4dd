use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A monotonic hybrid logical clock.
///
/// Timestamps fuse coarse wall time with a per-process counter: wall-clock
/// milliseconds in the high 48 bits, a sequence counter in the low 16. Every
/// call to `now` returns a value strictly greater than any value previously
/// returned *or observed* by this instance, which keeps version-vector times
/// monotonic even when the system clock steps backwards.
#[derive(Debug, Default)]
pub struct HybridClock {
    last: AtomicU64,
}

/// Low bits reserved for the counter component.
const COUNTER_BITS: u32 = 16;

impl HybridClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn wall_component() -> u64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        millis << COUNTER_BITS
    }

    /// Returns a timestamp strictly greater than every previous result and
    /// every time passed to [`see`](Self::see).
    pub fn now(&self) -> u64 {
        let wall = Self::wall_component();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Ratchets the clock past a timestamp observed from a peer, so that the
    /// next `now` exceeds it. Returns false if the timestamp is invalid.
    pub fn see(&self, time: u64) -> bool {
        if time == 0 || time == u64::MAX {
            return false;
        }
        self.last.fetch_max(time, Ordering::AcqRel);
        true
    }
}
