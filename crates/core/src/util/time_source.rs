use std::time::Instant;

pub trait TimeSource {
    fn now(&self) -> Instant;
}

/// A simple time source that returns the current time using `Instant::now()`.
#[derive(Clone, Copy, Debug, Default)]
pub struct InstantTimeSrc(());

impl InstantTimeSrc {
    pub fn new() -> Self {
        InstantTimeSrc(())
    }
}

impl TimeSource for InstantTimeSrc {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually driven clock. Clones share the same instant, so a test can keep a
/// handle and advance the time observed by whatever owns the other clone.
#[derive(Clone, Debug)]
pub struct MockTimeSource {
    current_instant: std::sync::Arc<parking_lot::Mutex<Instant>>,
}

impl MockTimeSource {
    pub fn new(start_instant: Instant) -> Self {
        MockTimeSource {
            current_instant: std::sync::Arc::new(parking_lot::Mutex::new(start_instant)),
        }
    }

    pub fn advance_time(&self, duration: std::time::Duration) {
        *self.current_instant.lock() += duration;
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> Instant {
        *self.current_instant.lock()
    }
}
