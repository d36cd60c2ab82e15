//! Measurement engine driven by scripted transports.

use std::sync::Arc;
use std::time::Duration;

use lanspeed::measurement::{measure_download, NoopObserver, PhaseSettings, UploadMode};
use lanspeed::test_utils::{Receipt, RecordingObserver, SimulatedTransport};
use lanspeed::{SpeedTest, SpeedTestSettings};
use testresult::TestResult;

#[tokio::test]
async fn four_connections_at_one_mebibyte_per_tick() {
    let transport = Arc::new(
        SimulatedTransport::new().with_download(1024 * 1024, Duration::from_millis(100)),
    );
    let settings = PhaseSettings {
        connections: 4,
        duration: Duration::from_millis(2000),
        window_span: Duration::from_secs(1),
    };
    let result = measure_download(transport, settings, Arc::new(NoopObserver)).await;

    // 4 x 10 MiB/s = 320 binary megabits per second
    assert!(
        (result.average_mbps - 320.0).abs() < 32.0,
        "average {} Mbps",
        result.average_mbps
    );
    assert!(result.best_mbps >= result.average_mbps);
    assert!(result.duration_seconds >= 2.0);
}

#[test_log::test(tokio::test)]
async fn degenerate_streaming_upload_reports_loop_figures() -> TestResult {
    let chunk_size = 32 * 1024;
    let transport = Arc::new(
        SimulatedTransport::new()
            .with_streaming_receipt(Receipt::Fixed(2 * chunk_size as u64))
            .with_upload_pace(Duration::from_millis(5)),
    );
    let observer = Arc::new(RecordingObserver::default());
    let settings = SpeedTestSettings {
        phase: PhaseSettings {
            connections: 4,
            duration: Duration::from_millis(300),
            window_span: Duration::from_millis(300),
        },
        chunk_size,
        ping_samples: 2,
        ping_interval: Duration::from_millis(5),
        ping_timeout: Duration::from_secs(2),
        phase_pause: Duration::from_millis(10),
        force_loop_upload: false,
    };
    let report = SpeedTest::new(transport.clone(), settings)
        .with_observer(observer.clone())
        .run()
        .await?;

    assert_eq!(report.upload_mode, UploadMode::Loop);
    assert_eq!(transport.streaming_uploads(), 4);
    assert_eq!(
        report.upload.total_bytes,
        transport.chunk_uploads() as u64 * chunk_size as u64
    );
    assert!(observer
        .lines()
        .iter()
        .any(|line| line.contains("loop mode")));
    Ok(())
}
