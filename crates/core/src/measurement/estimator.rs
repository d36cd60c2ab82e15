use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{bits_to_mbps, ProgressObserver, RateUpdate, Role, TransferEvent};
use crate::util::time_source::{InstantTimeSrc, TimeSource};

/// Rates derived from the trailing window at the last recorded event.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateSnapshot {
    pub current_bps: f64,
    pub best_bps: f64,
    pub total_bytes: u64,
    pub window_events: usize,
}

impl RateSnapshot {
    pub fn current_mbps(&self) -> f64 {
        bits_to_mbps(self.current_bps)
    }

    pub fn best_mbps(&self) -> f64 {
        bits_to_mbps(self.best_bps)
    }
}

/// Keeps the transfer events of the last `window_span` and derives the
/// instantaneous bitrate from them.
///
/// Events are kept in append order. Connections append concurrently, so a
/// timestamp can be older than the one before it; the reference "now" is the
/// latest timestamp seen so far and never moves backwards.
#[derive(Debug)]
pub struct SlidingWindowEstimator {
    events: VecDeque<TransferEvent>,
    window_span: Duration,
    window_bytes: u64,
    total_bytes: u64,
    latest: Option<Instant>,
    unordered: bool,
    current_bps: f64,
    best_bps: f64,
}

impl SlidingWindowEstimator {
    pub fn new(window_span: Duration) -> Self {
        SlidingWindowEstimator {
            events: VecDeque::new(),
            window_span,
            window_bytes: 0,
            total_bytes: 0,
            latest: None,
            unordered: false,
            current_bps: 0.0,
            best_bps: 0.0,
        }
    }

    /// Adds an event, drops what aged out of the window and refreshes the rates.
    pub fn record(&mut self, event: TransferEvent) -> RateSnapshot {
        if event.bytes == 0 {
            return self.snapshot();
        }
        let now = match self.latest {
            Some(latest) if latest > event.timestamp => latest,
            _ => event.timestamp,
        };
        self.latest = Some(now);
        self.total_bytes += event.bytes;

        // an event older than the window still counts towards the total
        if now.duration_since(event.timestamp) <= self.window_span {
            if self
                .events
                .back()
                .is_some_and(|last| last.timestamp > event.timestamp)
            {
                self.unordered = true;
            }
            self.events.push_back(event);
            self.window_bytes += event.bytes;
        }
        self.cleanup(now);

        self.current_bps = (self.window_bytes as f64 * 8.0) / self.window_span.as_secs_f64();
        if self.current_bps > self.best_bps {
            self.best_bps = self.current_bps;
        }
        self.snapshot()
    }

    /// Removes events older than the window span.
    fn cleanup(&mut self, now: Instant) {
        while self
            .events
            .front()
            .is_some_and(|event| now.duration_since(event.timestamp) > self.window_span)
        {
            if let Some(expired) = self.events.pop_front() {
                self.window_bytes -= expired.bytes;
            }
        }

        if self.unordered {
            let span = self.window_span;
            self.events
                .retain(|event| now.duration_since(event.timestamp) <= span);
            self.window_bytes = self.events.iter().map(|event| event.bytes).sum();
            self.unordered = self
                .events
                .iter()
                .zip(self.events.iter().skip(1))
                .any(|(a, b)| a.timestamp > b.timestamp);
        }
    }

    pub fn snapshot(&self) -> RateSnapshot {
        RateSnapshot {
            current_bps: self.current_bps,
            best_bps: self.best_bps,
            total_bytes: self.total_bytes,
            window_events: self.events.len(),
        }
    }

    pub fn window_span(&self) -> Duration {
        self.window_span
    }

    /// Events currently inside the window, in append order.
    pub fn events(&self) -> impl Iterator<Item = &TransferEvent> {
        self.events.iter()
    }
}

/// Estimator state of one phase, shared by all of its connections.
///
/// Writers are serialized by a mutex; the observer is notified after the lock
/// is released so a slow observer never stalls other connections.
pub struct EstimatorSession<T: TimeSource = InstantTimeSrc> {
    role: Role,
    estimator: Mutex<SlidingWindowEstimator>,
    observer: Arc<dyn ProgressObserver>,
    time_source: T,
    start_time: Instant,
    phase_duration: Duration,
}

impl EstimatorSession<InstantTimeSrc> {
    pub fn new(
        role: Role,
        window_span: Duration,
        phase_duration: Duration,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self::with_time_source(
            role,
            window_span,
            phase_duration,
            observer,
            InstantTimeSrc::new(),
        )
    }
}

impl<T: TimeSource> EstimatorSession<T> {
    pub fn with_time_source(
        role: Role,
        window_span: Duration,
        phase_duration: Duration,
        observer: Arc<dyn ProgressObserver>,
        time_source: T,
    ) -> Self {
        let start_time = time_source.now();
        EstimatorSession {
            role,
            estimator: Mutex::new(SlidingWindowEstimator::new(window_span)),
            observer,
            time_source,
            start_time,
            phase_duration,
        }
    }

    /// Records `bytes` delivered right now.
    pub fn record_bytes(&self, bytes: u64) {
        let now = self.time_source.now();
        self.record(TransferEvent::new(now, bytes));
    }

    pub fn record(&self, event: TransferEvent) {
        if event.bytes == 0 {
            return;
        }
        let snapshot = self.estimator.lock().record(event);
        self.observer.on_rate(&RateUpdate {
            role: self.role,
            current_mbps: snapshot.current_mbps(),
            best_mbps: snapshot.best_mbps(),
            elapsed: event.timestamp.saturating_duration_since(self.start_time),
            phase_duration: self.phase_duration,
        });
    }

    pub fn snapshot(&self) -> RateSnapshot {
        self.estimator.lock().snapshot()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn observer(&self) -> &dyn ProgressObserver {
        self.observer.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::NoopObserver;
    use crate::util::time_source::MockTimeSource;

    const SPAN: Duration = Duration::from_secs(1);

    fn verify_window(estimator: &SlidingWindowEstimator) {
        let latest = estimator.latest.expect("at least one event recorded");
        let mut sum = 0;
        for event in estimator.events() {
            assert!(latest.duration_since(event.timestamp) <= estimator.window_span());
            sum += event.bytes;
        }
        assert_eq!(sum, estimator.window_bytes);
        let expected = sum as f64 * 8.0 / estimator.window_span().as_secs_f64();
        assert_eq!(estimator.snapshot().current_bps, expected);
    }

    #[test]
    fn rate_is_eight_times_window_bytes_over_span() {
        let start = Instant::now();
        let mut estimator = SlidingWindowEstimator::new(SPAN);
        estimator.record(TransferEvent::new(start, 1000));
        let snapshot = estimator.record(TransferEvent::new(start + Duration::from_millis(10), 500));
        assert_eq!(snapshot.current_bps, 12_000.0);
        assert_eq!(snapshot.total_bytes, 1500);
        verify_window(&estimator);
    }

    #[test]
    fn events_age_out_of_window() {
        let start = Instant::now();
        let mut estimator = SlidingWindowEstimator::new(SPAN);
        estimator.record(TransferEvent::new(start, 4000));
        estimator.record(TransferEvent::new(start + Duration::from_millis(600), 1000));
        let snapshot =
            estimator.record(TransferEvent::new(start + Duration::from_millis(1200), 1000));
        assert_eq!(snapshot.window_events, 2);
        assert_eq!(snapshot.current_bps, 16_000.0);
        assert_eq!(snapshot.total_bytes, 6000);
        verify_window(&estimator);
    }

    #[test]
    fn event_exactly_one_span_old_is_kept() {
        let start = Instant::now();
        let mut estimator = SlidingWindowEstimator::new(SPAN);
        estimator.record(TransferEvent::new(start, 100));
        let snapshot = estimator.record(TransferEvent::new(start + SPAN, 100));
        assert_eq!(snapshot.window_events, 2);
    }

    #[test]
    fn best_rate_tracks_maximum() {
        let start = Instant::now();
        let mut estimator = SlidingWindowEstimator::new(SPAN);
        let sizes = [1000u64, 8000, 200, 50, 9000, 10, 10];
        let mut best_seen = 0.0f64;
        let mut previous_best = 0.0f64;
        for (i, size) in sizes.into_iter().enumerate() {
            let at = start + Duration::from_millis(400 * i as u64);
            let snapshot = estimator.record(TransferEvent::new(at, size));
            best_seen = best_seen.max(snapshot.current_bps);
            assert!(snapshot.best_bps >= previous_best);
            assert_eq!(snapshot.best_bps, best_seen);
            previous_best = snapshot.best_bps;
            verify_window(&estimator);
        }
        // the last two tiny events leave a low current rate behind a high best
        let snapshot = estimator.snapshot();
        assert!(snapshot.current_bps < snapshot.best_bps);
    }

    #[test]
    fn out_of_order_events_keep_the_invariant() {
        let start = Instant::now();
        let mut estimator = SlidingWindowEstimator::new(SPAN);
        estimator.record(TransferEvent::new(start + Duration::from_millis(1100), 10));
        // appended after a newer event, still inside the window
        estimator.record(TransferEvent::new(start + Duration::from_millis(900), 20));
        assert_eq!(estimator.snapshot().window_events, 2);
        verify_window(&estimator);

        // the straggler sits behind a fresher front and must still be purged
        let snapshot =
            estimator.record(TransferEvent::new(start + Duration::from_millis(2050), 30));
        assert_eq!(snapshot.window_events, 2);
        assert_eq!(snapshot.total_bytes, 60);
        verify_window(&estimator);
    }

    #[test]
    fn stale_event_counts_but_is_not_windowed() {
        let start = Instant::now();
        let mut estimator = SlidingWindowEstimator::new(SPAN);
        estimator.record(TransferEvent::new(start + Duration::from_secs(5), 10));
        let snapshot = estimator.record(TransferEvent::new(start, 1000));
        assert_eq!(snapshot.window_events, 1);
        assert_eq!(snapshot.total_bytes, 1010);
        assert_eq!(snapshot.current_bps, 80.0);
        verify_window(&estimator);
    }

    #[test]
    fn snapshot_does_not_mutate() {
        let mut estimator = SlidingWindowEstimator::new(SPAN);
        estimator.record(TransferEvent::new(Instant::now(), 64));
        let first = estimator.snapshot();
        let second = estimator.snapshot();
        assert_eq!(first, second);
    }

    #[test]
    fn zero_byte_events_are_ignored() {
        let mut estimator = SlidingWindowEstimator::new(SPAN);
        let snapshot = estimator.record(TransferEvent::new(Instant::now(), 0));
        assert_eq!(snapshot, RateSnapshot::default());
    }

    #[derive(Default)]
    struct Recording(parking_lot::Mutex<Vec<RateUpdate>>);

    impl ProgressObserver for Recording {
        fn on_rate(&self, update: &RateUpdate) {
            self.0.lock().push(*update);
        }
    }

    #[test]
    fn session_stamps_events_and_notifies_observer() {
        let clock = MockTimeSource::new(Instant::now());
        let observer = Arc::new(Recording::default());
        let session = EstimatorSession::with_time_source(
            Role::Download,
            SPAN,
            Duration::from_secs(10),
            observer.clone(),
            clock.clone(),
        );

        session.record_bytes(1024 * 1024);
        clock.advance_time(Duration::from_millis(500));
        session.record_bytes(1024 * 1024);
        clock.advance_time(Duration::from_millis(1200));
        session.record_bytes(1024 * 1024);

        let updates = observer.0.lock().clone();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].current_mbps, 8.0);
        assert_eq!(updates[1].current_mbps, 16.0);
        assert_eq!(updates[2].current_mbps, 8.0);
        assert_eq!(updates[2].best_mbps, 16.0);
        assert_eq!(updates[2].elapsed, Duration::from_millis(1700));
        assert!(updates.iter().all(|u| u.role == Role::Download));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.total_bytes, 3 * 1024 * 1024);
        assert_eq!(snapshot.best_mbps(), 16.0);
    }

    #[test]
    fn concurrent_writers_are_serialized() {
        let session = Arc::new(EstimatorSession::new(
            Role::Upload,
            Duration::from_secs(60),
            Duration::from_secs(10),
            Arc::new(NoopObserver),
        ));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        session.record_bytes(3);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = session.snapshot();
        assert_eq!(snapshot.total_bytes, 12_000);
        assert_eq!(snapshot.window_events, 4000);
    }
}
