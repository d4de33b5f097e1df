mod common;

use common::*;
use hostlink::bus::BusKind;
use hostlink::channel::ChannelError;
use hostlink::config::ConfigError;
use hostlink::sim::SlaveProfile;
use hostlink::transport::SetupProgress;
use hostlink::*;
use std::sync::Arc;
use std::time::Duration;

fn discard() -> Arc<dyn ChannelReceiver> {
    Arc::new(|handle: BufferHandle| handle.release())
}

#[tokio::test]
async fn test_operations_before_setup_fail() {
    let h = harness();

    let err = h
        .transport
        .send(SendRequest::copy_from(InterfaceType::Sta, 0, b"early"))
        .unwrap_err();
    assert!(matches!(err, TransportError::NotSetUp));

    let err = h
        .transport
        .register_channel(InterfaceType::Sta, false, discard())
        .unwrap_err();
    assert!(matches!(err, TransportError::NotSetUp));
    assert_eq!(h.transport.handshake_state(), HandshakeState::Idle);
    assert!(!h.transport.is_throttled());
}

#[tokio::test]
async fn test_second_setup_is_rejected() {
    let h = connected().await;
    let err = h.transport.setup(|_| {}).await.unwrap_err();
    assert!(matches!(err, TransportError::AlreadySetUp));
    assert_eq!(h.bus.init_count(), 1);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_touching_the_bus() {
    let config = TransportConfig {
        throttle_high_threshold: 50,
        throttle_low_threshold: 70,
        ..fast_config()
    };
    let h = harness_with(BusKind::Spi, config, SlaveProfile::for_bus(BusKind::Spi));

    let err = h.transport.setup(|_| {}).await.unwrap_err();
    assert!(matches!(err, TransportError::Config(ConfigError::Thresholds { .. })));
    assert_eq!(h.bus.init_count(), 0);
}

#[tokio::test]
async fn test_teardown_is_idempotent() {
    let h = harness();
    h.transport.teardown().await;
    assert_eq!(h.bus.deinit_count(), 0);

    h.transport.setup(|_| {}).await.unwrap();
    h.transport.teardown().await;
    h.transport.teardown().await;

    assert_eq!(h.bus.deinit_count(), 1);
    assert_eq!(h.transport.progress().await, SetupProgress::default());
    assert_eq!(h.transport.handshake_state(), HandshakeState::Idle);
}

#[tokio::test]
async fn test_setup_after_teardown() {
    let h = connected().await;
    h.transport.teardown().await;

    h.transport.setup(|_| {}).await.unwrap();
    h.transport.send(SendRequest::copy_from(InterfaceType::Serial, 0, b"again")).unwrap();

    assert!(wait_until(1000, || h.slave.received().len() == 1).await);
    assert_eq!(h.bus.init_count(), 2);
    assert_eq!(h.slave.stats().configs_received, 2);
}

#[tokio::test]
async fn test_every_buffer_is_released_by_teardown() {
    let config = TransportConfig {
        queue_depth: 8,
        ..fast_config()
    };
    let h = harness_with(BusKind::Spi, config, SlaveProfile::for_bus(BusKind::Spi));
    h.transport.setup(|_| {}).await.unwrap();

    // Hold everything in the queue so teardown has something to drain.
    h.slave.set_throttle(true).await.unwrap();
    assert!(wait_until(1000, || h.transport.is_throttled()).await);

    let mut counters = Vec::new();
    for i in 0..6u8 {
        let (released, hook) = release_counter();
        h.transport
            .send(SendRequest::zero_copy(
                InterfaceType::Sta,
                0,
                Arc::from(vec![i; 32]),
                OwnerToken(i as u64),
                hook,
            ))
            .unwrap();
        counters.push(released);
    }
    assert!(counters.iter().all(|c| count(c) == 0));

    h.transport.teardown().await;

    assert!(counters.iter().all(|c| count(c) == 1));
    let stats = h.transport.stats();
    assert_eq!(stats.buffers_created, stats.buffers_released);
    assert_eq!(stats.buffers_outstanding(), 0);
}

#[tokio::test]
async fn test_channel_registration_rules() {
    let h = connected().await;

    let sta = h.transport.register_channel(InterfaceType::Sta, false, discard()).unwrap();
    assert_eq!(sta.if_type(), InterfaceType::Sta);

    let err = h
        .transport
        .register_channel(InterfaceType::Sta, true, discard())
        .unwrap_err();
    assert!(matches!(err, TransportError::Channel(ChannelError::AlreadyRegistered(InterfaceType::Sta))));

    let err = h
        .transport
        .register_channel(InterfaceType::Priv, false, discard())
        .unwrap_err();
    assert!(matches!(err, TransportError::Channel(ChannelError::Reserved(InterfaceType::Priv))));

    h.transport.deregister_channel(&sta).unwrap();
    let err = sta.transmit(0, b"stale").unwrap_err();
    assert!(matches!(err, TransportError::Channel(ChannelError::NotFound(_))));

    let err = h.transport.deregister_channel(&sta).unwrap_err();
    assert!(matches!(err, TransportError::Channel(ChannelError::NotFound(_))));

    // The interface is free again, and the old handle does not match the new one.
    let again = h.transport.register_channel(InterfaceType::Sta, false, discard()).unwrap();
    assert_ne!(again.id(), sta.id());
    assert!(sta.transmit(0, b"stale").is_err());
    again.transmit(0, b"fresh").unwrap();
}

#[tokio::test]
async fn test_channels_are_cleared_by_teardown() {
    let h = connected().await;
    let channel = h.transport.register_channel(InterfaceType::Ap, false, discard()).unwrap();
    assert_eq!(h.transport.status().await.channels.len(), 1);

    h.transport.teardown().await;

    let err = channel.transmit(0, b"gone").unwrap_err();
    assert!(matches!(err, TransportError::NotSetUp));
    assert!(h.transport.status().await.channels.is_empty());
}

#[tokio::test]
async fn test_status_snapshot_serializes() {
    let h = connected().await;
    let status = h.transport.status().await;

    assert!(status.progress.pumps_started);
    assert_eq!(status.handshake, HandshakeState::Confirmed);
    assert!(status.flow.is_some());

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["handshake"], "Confirmed");
    assert_eq!(json["power_save"], "Active");
}

#[tokio::test]
async fn test_config_loads_from_partial_json() {
    let config = TransportConfig::from_json(r#"{"queue_depth": 32, "raw_tp_request": "HostToSlave"}"#).unwrap();
    assert_eq!(config.queue_depth, 32);
    assert_eq!(config.priority_queues, TransportConfig::default().priority_queues);

    assert!(TransportConfig::from_json(r#"{"queue_depth": 0}"#).is_err());
}

#[tokio::test]
async fn test_teardown_wakes_pumps_blocked_without_timeout() {
    let config = TransportConfig {
        pump_wait_timeout_ms: None,
        ..fast_config()
    };
    let h = harness_with(BusKind::Spi, config, SlaveProfile::for_bus(BusKind::Spi));
    h.transport.setup(|_| {}).await.unwrap();

    // Let both pumps go idle on their wake signals.
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(1), h.transport.teardown())
        .await
        .expect("teardown stalled on a blocked pump");
    assert_eq!(h.bus.deinit_count(), 1);
    assert!(!h.transport.progress().await.pumps_started);
}
