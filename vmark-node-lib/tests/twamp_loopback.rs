//! Loopback exchange between a sender and a reflector, plus registry
//! lifecycle behavior. No privileges or kernel datapath involved.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use vmark_node_lib::twamp::{
    run_sender, IpVersion, Reflector, ReflectorConfig, SenderConfig, SenderStatus,
    SessionRegistry, SocketOptions,
};

fn reflector_cfg(port: u16) -> ReflectorConfig {
    ReflectorConfig {
        ip_version: IpVersion::V4,
        bind_addr: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        port,
        reset_timer_secs: 0,
        options: SocketOptions::default(),
    }
}

fn sender_cfg(dest: std::net::SocketAddr, count: u32, interval_ms: u64) -> SenderConfig {
    SenderConfig {
        ip_version: IpVersion::V4,
        destination: dest,
        count,
        interval: Duration::from_millis(interval_ms),
        padding: 64,
        options: SocketOptions::default(),
    }
}

#[tokio::test]
async fn test_sender_reflector_exchange() {
    let reflector = Reflector::bind(reflector_cfg(0)).unwrap();
    let addr = reflector.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let reflector_task = tokio::spawn(reflector.run(cancel.clone()));

    let result = run_sender(sender_cfg(addr, 5, 20), CancellationToken::new()).await;

    assert_eq!(result.packets_tx, 5);
    assert_eq!(result.packets_rx, 5);
    assert_eq!(result.total_loss_percent, 0.0);
    assert!(result.error.is_none());
    for dir in [&result.outbound, &result.inbound, &result.roundtrip] {
        assert!(dir.min_us.unwrap() >= 0.0);
        assert!(dir.avg_us.unwrap() >= 0.0);
        assert!(dir.jitter_us.unwrap() >= 0.0);
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_millis(2500), reflector_task)
        .await
        .expect("reflector must observe cancellation promptly")
        .unwrap();
}

#[tokio::test]
async fn test_sender_with_no_reflector_reports_full_loss() {
    // Nothing listens on this socket once it is dropped.
    let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let dead_addr = probe.local_addr().unwrap();
    drop(probe);

    let result = run_sender(sender_cfg(dead_addr, 3, 10), CancellationToken::new()).await;
    assert_eq!(result.packets_tx, 3);
    assert_eq!(result.packets_rx, 0);
    assert_eq!(result.total_loss_percent, 100.0);
    assert!(result.roundtrip.min_us.is_none());
}

#[tokio::test]
async fn test_registry_refuses_duplicate_responder() {
    let registry = SessionRegistry::new();
    registry.start_responder(reflector_cfg(0)).unwrap();
    let err = registry.start_responder(reflector_cfg(0)).unwrap_err();
    assert!(err.to_string().contains("already active"));

    let out = registry.stop_responder((IpVersion::V4, 0)).await.unwrap();
    assert!(out.contains("stopped"));
}

#[tokio::test]
async fn test_registry_stop_is_bounded_and_status_completes() {
    let reflector = Reflector::bind(reflector_cfg(0)).unwrap();
    let addr = reflector.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(reflector.run(cancel.clone()));

    let registry = SessionRegistry::new();
    // Long-running session: 1000 probes at 50 ms would take ~50 s.
    registry
        .start_sender(sender_cfg(addr, 1000, 50))
        .unwrap();
    let key = (IpVersion::V4, addr.ip(), addr.port());

    assert!(matches!(registry.sender_status(key), SenderStatus::Running));

    let started = std::time::Instant::now();
    let out = registry.stop_sender(key).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(out.contains("stopped"));

    // The cancelled task still posted its partial result.
    match registry.sender_status(key) {
        SenderStatus::Completed(completed) => {
            assert!(completed.result.packets_rx <= completed.result.packets_tx);
        }
        other => panic!("expected completed status, got {other:?}"),
    }
    // The record is consumed by the read above.
    assert!(matches!(registry.sender_status(key), SenderStatus::Unknown));

    cancel.cancel();
}

#[tokio::test]
async fn test_sender_result_waits_for_status_read() {
    let reflector = Reflector::bind(reflector_cfg(0)).unwrap();
    let addr = reflector.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(reflector.run(cancel.clone()));

    let registry = SessionRegistry::new();
    registry.start_sender(sender_cfg(addr, 3, 10)).unwrap();
    let key = (IpVersion::V4, addr.ip(), addr.port());

    // Completion includes the 1 s final-reply grace.
    let mut status = registry.sender_status(key);
    for _ in 0..100 {
        if matches!(status, SenderStatus::Completed(_)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        status = registry.sender_status(key);
    }
    match status {
        SenderStatus::Completed(completed) => {
            assert_eq!(completed.result.packets_tx, 3);
            assert_eq!(completed.result.packets_rx, 3);
            assert!(completed.finished_at > 0.0);
        }
        other => panic!("sender never completed: {other:?}"),
    }

    cancel.cancel();
}
