//! Fallback, reconnection and retry exhaustion over scripted in-memory links.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{Behavior, MemoryDialer, drain, next_event, wait_until};
use fleet_transport::client::{QuicTransport, TransportConfig, TransportEvent};
use fleet_transport::core::{Phase, TransportError, TransportMode};

const WAIT: Duration = Duration::from_secs(5);

fn config(max_retries: u32, backoff_ms: u64) -> TransportConfig {
    TransportConfig::builder()
        .peer("agent-hub.test", 4433)
        .max_retries(max_retries)
        .backoff_base(Duration::from_millis(backoff_ms))
        .build()
}

fn transport(config: TransportConfig, dialer: &Arc<MemoryDialer>) -> QuicTransport {
    QuicTransport::builder(config)
        .dialer(dialer.clone())
        .build()
        .unwrap()
}

fn count(events: &[TransportEvent], pred: impl Fn(&TransportEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

#[tokio::test]
async fn test_quic_failure_falls_back_to_tcp() {
    let dialer = MemoryDialer::new(Behavior::FailTransient, Behavior::Succeed);
    let transport = transport(config(3, 10), &dialer);

    transport.initialize().await.unwrap();
    assert_eq!(transport.mode(), Some(TransportMode::Tcp));
    assert_eq!(transport.phase(), Phase::Connected);
    assert_eq!(
        dialer.attempts(),
        vec![(TransportMode::Quic, false), (TransportMode::Tcp, true)]
    );
    transport.close().await;
}

#[tokio::test]
async fn test_reset_reconnects_and_clears_retries() {
    let dialer = MemoryDialer::new(Behavior::Succeed, Behavior::Succeed);
    let transport = transport(config(3, 10), &dialer);
    transport.initialize().await.unwrap();
    let mut events = transport.events();

    dialer.reset_all();

    let lost = next_event(&mut events, WAIT, |e| matches!(e, TransportEvent::ConnectionLost { .. }))
        .await
        .unwrap();
    assert_eq!(lost.phase, Phase::Reconnecting);
    let back = next_event(&mut events, WAIT, |e| matches!(e, TransportEvent::Reconnected { .. }))
        .await
        .unwrap();
    assert_eq!(back.phase, Phase::Connected);
    assert!(matches!(back.event, TransportEvent::Reconnected { attempts: 1, .. }));

    assert_eq!(transport.phase(), Phase::Connected);
    assert_eq!(transport.stats().retry_count, 0);
    assert_eq!(transport.stats().reconnections, 1);

    transport.send("coordination", json!({"after": "reconnect"})).await.unwrap();
    transport.close().await;
}

#[tokio::test]
async fn test_send_while_reconnecting_is_rejected() {
    let dialer = MemoryDialer::new(Behavior::Succeed, Behavior::Succeed);
    // Long backoff keeps the transport in RECONNECTING.
    let transport = transport(config(3, 60_000), &dialer);
    transport.initialize().await.unwrap();
    let mut events = transport.events();
    let sent_before = transport.stats().messages_sent;

    dialer.reset_all();
    next_event(&mut events, WAIT, |e| matches!(e, TransportEvent::ConnectionLost { .. }))
        .await
        .unwrap();
    assert_eq!(transport.phase(), Phase::Reconnecting);

    let err = transport.send("coordination", json!(1)).await.unwrap_err();
    assert!(matches!(err, TransportError::NotConnected { phase: Phase::Reconnecting }));
    assert!(err.is_not_connected());
    assert_eq!(transport.stats().messages_sent, sent_before);

    transport.close().await;
    assert_eq!(transport.phase(), Phase::Disconnected);
}

#[tokio::test]
async fn test_single_retry_then_failed_once() {
    let dialer = MemoryDialer::new(Behavior::Succeed, Behavior::Succeed);
    let transport = transport(config(1, 10), &dialer);
    transport.initialize().await.unwrap();
    let mut events = transport.events();

    dialer.set_all(Behavior::FailTransient);
    dialer.reset_all();

    next_event(&mut events, WAIT, |e| matches!(e, TransportEvent::Failed { .. }))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let rest = drain(&mut events);
    assert_eq!(count(&rest, |e| matches!(e, TransportEvent::Failed { .. })), 0);
    assert_eq!(transport.phase(), Phase::Failed);
    transport.close().await;
}

#[tokio::test]
async fn test_retries_stop_after_max_retries() {
    let dialer = MemoryDialer::new(Behavior::Succeed, Behavior::Succeed);
    let transport = transport(config(3, 10), &dialer);
    let mut events = transport.events();
    transport.initialize().await.unwrap();
    let initial_dials = dialer.attempt_count();

    dialer.set_all(Behavior::FailTransient);
    dialer.reset_all();

    next_event(&mut events, WAIT, |e| matches!(e, TransportEvent::Failed { .. }))
        .await
        .unwrap();
    let dials = dialer.attempt_count();
    // Three attempts, each trying QUIC then TCP.
    assert_eq!(dials - initial_dials, 6);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(dialer.attempt_count(), dials);
    assert_eq!(transport.phase(), Phase::Failed);
    assert_eq!(transport.stats().retry_count, 3);
    transport.close().await;
}

#[tokio::test]
async fn test_backoff_doubles_between_attempts() {
    let dialer = MemoryDialer::new(Behavior::Succeed, Behavior::Succeed);
    let transport = transport(config(3, 10), &dialer);
    transport.initialize().await.unwrap();
    let mut events = transport.events();

    dialer.set_all(Behavior::FailTransient);
    dialer.reset_all();

    let mut delays = Vec::new();
    while let Some(record) = next_event(&mut events, WAIT, |e| {
        matches!(e, TransportEvent::Reconnecting { .. } | TransportEvent::Failed { .. })
    })
    .await
    {
        match record.event {
            TransportEvent::Reconnecting { attempt, delay_ms } => delays.push((attempt, delay_ms)),
            _ => break,
        }
    }
    assert_eq!(delays, vec![(1, 10), (2, 20), (3, 40)]);
    transport.close().await;
}

#[tokio::test]
async fn test_permanent_error_fails_without_retrying() {
    let dialer = MemoryDialer::new(Behavior::Succeed, Behavior::Succeed);
    let transport = transport(config(5, 10), &dialer);
    transport.initialize().await.unwrap();
    let mut events = transport.events();

    dialer.set_all(Behavior::FailPermanent);
    dialer.reset_all();

    next_event(&mut events, WAIT, |e| matches!(e, TransportEvent::Failed { .. }))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.phase(), Phase::Failed);
    assert_eq!(transport.stats().retry_count, 1);
    transport.close().await;
}

#[tokio::test]
async fn test_initial_failure_rejects_and_can_retry() {
    let dialer = MemoryDialer::new(Behavior::FailTransient, Behavior::FailTransient);
    let transport = transport(config(3, 10), &dialer);

    let err = transport.initialize().await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectFailed { quic: Some(_), tcp: Some(_) }));
    assert_eq!(transport.phase(), Phase::Failed);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dialer.attempt_count(), 2);

    dialer.set(TransportMode::Quic, Behavior::Succeed);
    transport.initialize().await.unwrap();
    assert_eq!(transport.mode(), Some(TransportMode::Quic));
    transport.close().await;
}

#[tokio::test]
async fn test_stalled_peer_detected_by_keep_alive() {
    let dialer = MemoryDialer::new(Behavior::Stalled, Behavior::Succeed);
    let config = TransportConfig::builder()
        .peer("agent-hub.test", 4433)
        .backoff_base(Duration::from_millis(10))
        .keep_alive(Duration::from_millis(100), Duration::from_millis(50))
        .build();
    let transport = transport(config, &dialer);
    transport.initialize().await.unwrap();
    assert_eq!(transport.mode(), Some(TransportMode::Quic));
    let mut events = transport.events();

    dialer.set(TransportMode::Quic, Behavior::Succeed);
    let lost = next_event(&mut events, WAIT, |e| matches!(e, TransportEvent::ConnectionLost { .. }))
        .await
        .unwrap();
    assert!(matches!(lost.event, TransportEvent::ConnectionLost { transient: true, .. }));
    next_event(&mut events, WAIT, |e| matches!(e, TransportEvent::Reconnected { .. }))
        .await
        .unwrap();

    // The live peer answers pings, so the link stays up.
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(transport.phase(), Phase::Connected);
    assert_eq!(transport.stats().reconnections, 1);
    transport.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let dialer = MemoryDialer::new(Behavior::Succeed, Behavior::Succeed);
    let transport = transport(config(3, 10), &dialer);
    transport.initialize().await.unwrap();
    let mut events = transport.events();

    transport.close().await;
    assert_eq!(transport.phase(), Phase::Disconnected);
    transport.close().await;
    assert_eq!(transport.phase(), Phase::Disconnected);

    let seen = drain(&mut events);
    assert_eq!(count(&seen, |e| matches!(e, TransportEvent::Disconnected)), 1);

    let err = transport.send("coordination", json!(1)).await.unwrap_err();
    assert!(matches!(err, TransportError::NotConnected { phase: Phase::Disconnected }));
    assert!(err.is_not_connected());
}

#[tokio::test]
async fn test_silent_peers_reject_initialize() {
    let dialer = MemoryDialer::new(Behavior::Silent, Behavior::Silent);
    let config = TransportConfig::builder()
        .peer("agent-hub.test", 4433)
        .keep_alive(Duration::from_millis(200), Duration::from_millis(50))
        .build();
    let transport = transport(config, &dialer);

    let err = transport.initialize().await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectFailed { quic: Some(_), tcp: Some(_) }));
    assert_eq!(transport.phase(), Phase::Failed);
    assert_eq!(transport.mode(), None);
    transport.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_timeout_hands_link_to_reconnection() {
    let dialer = MemoryDialer::new(Behavior::Stalled, Behavior::Succeed);
    let transport = transport(config(3, 10), &dialer);
    transport.initialize().await.unwrap();
    let mut events = transport.events();

    // Larger than the pipe buffer, and the peer never drains it.
    let bulk = json!("x".repeat(300 * 1024));
    let limit = Duration::from_millis(100);
    let err = transport.send_with_timeout("bulk", bulk, limit).await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout(d) if d == limit));
    assert!(err.is_transient());

    let lost = next_event(&mut events, WAIT, |e| matches!(e, TransportEvent::ConnectionLost { .. }))
        .await
        .unwrap();
    assert!(matches!(lost.event, TransportEvent::ConnectionLost { transient: true, .. }));
    let retry = next_event(&mut events, WAIT, |e| matches!(e, TransportEvent::Reconnecting { .. }))
        .await
        .unwrap();
    assert!(matches!(retry.event, TransportEvent::Reconnecting { attempt: 1, .. }));
    transport.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_initialize_timeout_leaves_failed() {
    let dialer = MemoryDialer::new(Behavior::Hang, Behavior::Hang);
    let transport = transport(config(3, 10), &dialer);
    let mut events = transport.events();

    let limit = Duration::from_millis(200);
    let err = transport.initialize_with_timeout(limit).await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout(d) if d == limit));
    assert!(err.is_transient());
    assert_eq!(transport.phase(), Phase::Failed);

    let failed = next_event(&mut events, WAIT, |e| matches!(e, TransportEvent::Failed { .. }))
        .await
        .unwrap();
    assert_eq!(failed.phase, Phase::Failed);
    transport.close().await;
}

#[tokio::test]
async fn test_invalid_config_rejected_at_build() {
    let dialer = MemoryDialer::new(Behavior::Succeed, Behavior::Succeed);
    let config = TransportConfig::builder()
        .peer("agent-hub.test", 4433)
        .keep_alive(Duration::ZERO, Duration::ZERO)
        .build();
    let err = QuicTransport::builder(config).dialer(dialer).build().unwrap_err();
    assert!(matches!(err, TransportError::Config(_)));
}

#[tokio::test]
async fn test_close_during_backoff_stops_retrying() {
    let dialer = MemoryDialer::new(Behavior::Succeed, Behavior::Succeed);
    let transport = transport(config(3, 200), &dialer);
    transport.initialize().await.unwrap();
    let mut events = transport.events();

    dialer.reset_all();
    next_event(&mut events, WAIT, |e| matches!(e, TransportEvent::Reconnecting { .. }))
        .await
        .unwrap();
    let dials = dialer.attempt_count();
    transport.close().await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(dialer.attempt_count(), dials);
    assert_eq!(transport.phase(), Phase::Disconnected);
    assert!(wait_until(WAIT, || transport.stats().active_streams == 0).await);
}
