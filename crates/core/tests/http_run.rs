//! Full run of the HTTP client against an in-process server.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use lanspeed::client::{ensure_remote_target, HttpTransport};
use lanspeed::config::{parse_server, ServerConfig};
use lanspeed::measurement::{measure_latency, NoopObserver, PhaseSettings, TransferError};
use lanspeed::server::start;
use lanspeed::{RunError, SpeedTest, SpeedTestSettings};
use testresult::TestResult;

fn quick_settings() -> SpeedTestSettings {
    SpeedTestSettings {
        phase: PhaseSettings {
            connections: 2,
            duration: Duration::from_millis(500),
            window_span: Duration::from_millis(250),
        },
        chunk_size: 64 * 1024,
        ping_samples: 3,
        ping_interval: Duration::from_millis(10),
        ping_timeout: Duration::from_secs(2),
        phase_pause: Duration::from_millis(20),
        force_loop_upload: false,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn measures_loopback_server() -> TestResult {
    let handle = start(&ServerConfig {
        address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        download_chunk_size: 64 * 1024,
        ..ServerConfig::default()
    })
    .await?;
    let server = parse_server(&handle.local_addr().to_string())?;
    assert!(matches!(
        ensure_remote_target(&server).await,
        Err(RunError::LoopbackTarget { .. })
    ));

    let transport = Arc::new(HttpTransport::new(server)?);
    let report = SpeedTest::new(transport, quick_settings()).run().await?;

    assert!(report.latency_ms.is_some());
    assert!(report.download.total_bytes > 0);
    assert!(report.upload.total_bytes > 0);
    assert!(report.download.best_mbps > 0.0);
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn forced_loop_upload() -> TestResult {
    let handle = start(&ServerConfig {
        address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        ..ServerConfig::default()
    })
    .await?;
    let server = parse_server(&handle.local_addr().to_string())?;
    let transport = Arc::new(HttpTransport::new(server)?.with_streaming_upload(false));
    let report = SpeedTest::new(transport, quick_settings()).run().await?;
    assert_eq!(report.upload_mode, lanspeed::measurement::UploadMode::Loop);
    assert_eq!(report.upload.total_bytes % (64 * 1024), 0);
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn unreachable_server_fails_fast() -> TestResult {
    // nothing listens on the discard port of the loopback interface
    let transport = Arc::new(HttpTransport::new(parse_server("127.0.0.1:9")?)?);
    let result = SpeedTest::new(transport, quick_settings()).run().await;
    assert!(matches!(result, Err(RunError::Unreachable(_))));
    Ok(())
}

/// Accepts connections and holds them open without ever answering.
async fn silent_listener() -> TestResult<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    Ok((addr, task))
}

#[test_log::test(tokio::test)]
async fn silent_server_is_reported_unreachable() -> TestResult {
    let (addr, listener) = silent_listener().await?;
    let transport = Arc::new(HttpTransport::new(parse_server(&addr.to_string())?)?);
    let settings = SpeedTestSettings {
        ping_timeout: Duration::from_millis(300),
        ..quick_settings()
    };

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        SpeedTest::new(transport, settings).run(),
    )
    .await?;
    assert!(matches!(result, Err(RunError::Unreachable(TransferError::Timeout(_)))));
    listener.abort();
    Ok(())
}

#[tokio::test]
async fn silent_server_latency_is_unavailable() -> TestResult {
    let (addr, listener) = silent_listener().await?;
    let transport = HttpTransport::new(parse_server(&addr.to_string())?)?;

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        measure_latency(
            &transport,
            3,
            Duration::from_millis(10),
            Duration::from_millis(200),
            &NoopObserver,
        ),
    )
    .await?;
    assert_eq!(report.mean, None);
    assert_eq!(report.attempted, 3);
    assert_eq!(report.to_string(), "N/A");
    listener.abort();
    Ok(())
}
