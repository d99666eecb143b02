//! Routing Tests
//!
//! End-to-end control ⇄ equipment routing over the in-memory network:
//! - Connect, forward, switch and disconnect
//! - Failure statuses (unknown control/equipment, refused transport)
//! - Clear-on-disconnect with shared digital ownership
//! - Feedback tagged with another equipment id is dropped
//! - Pool keep-alive and reconnect behaviour, including a drop that races
//!   a second control reconnecting the same host
//! - Listener sharing and protocol level replies

use crosspoint_core::{
    codec, ConnectionStatus, CrosspointInfo, DelimiterFramer, Envelope, HostInfo, MessageType,
    Signal, DEFAULT_DELIMITER,
};
use crosspoint_router::{ControlRegistryConfig, Crosspoint, EquipmentRegistry, RouterError};
use crosspoint_test_utils::{
    wait_for, wait_for_status, wait_with_notify, EnvelopeCollector, StatusCollector, TestSystem,
    DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT,
};
use crosspoint_transport::{
    TransportConnector, TransportEvent, TransportReceiver, TransportSender, TransportServer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn count_of(collector: &EnvelopeCollector, message_type: MessageType) -> usize {
    collector
        .envelopes()
        .iter()
        .filter(|e| e.message_type == message_type)
        .count()
}

// ============================================================================
// Connect and Forward
// ============================================================================

#[tokio::test]
async fn test_connect_and_forward_both_ways() {
    let sys = TestSystem::start().await;
    let equipment = sys.add_equipment(100, "Switcher");
    let control = sys.add_control(1, "Lobby Panel");

    let at_equipment = EnvelopeCollector::new();
    let at_control = EnvelopeCollector::new();
    equipment.on_output(at_equipment.callback());
    control.on_output(at_control.callback());

    // No controls yet: cached only
    assert!(!equipment.send_input(vec![Signal::digital(1, 1, true)]));

    assert_eq!(control.connect(100).await, ConnectionStatus::Connected);
    assert_eq!(control.status(), ConnectionStatus::Connected);
    assert_eq!(sys.controls.try_get_equipment_for_control(1), Some(100));

    // The connect reply replays the equipment cache
    assert!(at_control.wait_for_count(1, DEFAULT_TIMEOUT).await);
    let reply = at_control.envelopes()[0].clone();
    assert_eq!(reply.message_type, MessageType::EquipmentConnect);
    assert_eq!(reply.equipment_id, 100);
    assert_eq!(reply.control_ids, vec![1]);
    assert_eq!(reply.signals, vec![Signal::digital(1, 1, true)]);
    assert_eq!(equipment.status(), ConnectionStatus::Connected);

    assert!(control.send_input(vec![Signal::analog(2, 3, 500)]));
    assert!(at_equipment.wait_for_count(1, DEFAULT_TIMEOUT).await);
    let inbound = at_equipment.last().unwrap();
    assert_eq!(inbound.message_type, MessageType::Message);
    assert_eq!(inbound.control_ids, vec![1]);
    assert_eq!(inbound.signals, vec![Signal::analog(2, 3, 500)]);

    assert!(equipment.send_input(vec![Signal::serial(1, 5, "hello")]));
    assert!(at_control.wait_for_count(2, DEFAULT_TIMEOUT).await);
    let feedback = at_control.last().unwrap();
    assert_eq!(feedback.message_type, MessageType::Message);
    assert_eq!(feedback.signals, vec![Signal::serial(1, 5, "hello")]);
    assert_eq!(
        control.cached_signals(),
        vec![Signal::digital(1, 1, true), Signal::serial(1, 5, "hello")]
    );
}

#[tokio::test]
async fn test_disconnect_clears_control_side() {
    let sys = TestSystem::start().await;
    let equipment = sys.add_equipment(100, "Switcher");
    let control = sys.add_control(1, "Panel");
    let at_control = EnvelopeCollector::new();
    control.on_output(at_control.callback());

    equipment.send_input(vec![Signal::digital(0, 4, true), Signal::analog(0, 9, 1200)]);
    control.connect(100).await;
    assert!(at_control.wait_for_count(1, DEFAULT_TIMEOUT).await);

    assert_eq!(control.disconnect().await, ConnectionStatus::Idle);
    assert_eq!(control.status(), ConnectionStatus::Idle);
    assert_eq!(sys.controls.try_get_equipment_for_control(1), None);

    let clear = at_control.last().unwrap();
    assert_eq!(clear.message_type, MessageType::ControlClear);
    assert_eq!(
        clear.signals,
        vec![Signal::digital(0, 4, false), Signal::analog(0, 9, 0)]
    );
    assert!(control.cached_signals().is_empty());

    assert!(wait_for_status(&*equipment, ConnectionStatus::Idle, DEFAULT_TIMEOUT).await);
    assert!(!control.send_input(vec![Signal::digital(0, 1, true)]));
}

#[tokio::test]
async fn test_connect_zero_disconnects() {
    let sys = TestSystem::start().await;
    sys.add_equipment(100, "Switcher");
    let control = sys.add_control(1, "Panel");

    control.connect(100).await;
    assert_eq!(control.connect(0).await, ConnectionStatus::Idle);
    assert_eq!(sys.controls.try_get_equipment_for_control(1), None);
}

#[tokio::test]
async fn test_connect_twice_is_noop() {
    let sys = TestSystem::start().await;
    let equipment = sys.add_equipment(100, "Switcher");
    let control = sys.add_control(1, "Panel");
    let statuses = StatusCollector::new();
    control.on_status_changed(statuses.observer());

    assert_eq!(control.connect(100).await, ConnectionStatus::Connected);
    assert_eq!(control.connect(100).await, ConnectionStatus::Connected);
    assert_eq!(statuses.statuses_of(1), vec![ConnectionStatus::Connected]);
    assert!(wait_for(
        || async { equipment.connected_controls() == vec![1] },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);
}

// ============================================================================
// Failure Statuses
// ============================================================================

#[tokio::test]
async fn test_unknown_control() {
    let sys = TestSystem::start().await;
    sys.add_equipment(100, "Switcher");
    assert_eq!(
        sys.controls.connect(42, 100).await,
        ConnectionStatus::ControlNotFound
    );
    assert_eq!(
        sys.controls.disconnect(42).await,
        ConnectionStatus::ControlNotFound
    );
}

#[tokio::test]
async fn test_unresolved_equipment_does_no_io() {
    let sys = TestSystem::start().await;
    let control = sys.add_control(1, "Panel");

    assert_eq!(control.connect(999).await, ConnectionStatus::EquipmentNotFound);
    assert_eq!(control.status(), ConnectionStatus::EquipmentNotFound);
    assert!(sys.controls.pool().is_empty());
    assert_eq!(sys.live_connections(), 0);
}

#[tokio::test]
async fn test_failed_connect_leaves_nothing_behind() {
    let sys = TestSystem::start().await;
    sys.add_equipment(100, "Switcher");
    sys.tracker
        .add(CrosspointInfo::new(200, "Ghost", HostInfo::new("nowhere", 1)));
    let control = sys.add_control(1, "Panel");

    assert_eq!(control.connect(200).await, ConnectionStatus::ConnectFailed);
    assert_eq!(control.status(), ConnectionStatus::ConnectFailed);
    assert!(sys.controls.pool().is_empty());
    assert_eq!(sys.controls.try_get_equipment_for_control(1), None);

    // The next attempt starts from Idle
    assert_eq!(control.connect(100).await, ConnectionStatus::Connected);
    assert_eq!(sys.controls.pool().len(), 1);
}

#[tokio::test]
async fn test_refused_transport() {
    let sys = TestSystem::start().await;
    sys.add_equipment(100, "Switcher");
    let control = sys.add_control(1, "Panel");

    sys.network.set_refusing(sys.host.to_string(), true);
    assert_eq!(control.connect(100).await, ConnectionStatus::ConnectFailed);
    assert!(sys.controls.pool().is_empty());

    sys.network.set_refusing(sys.host.to_string(), false);
    assert_eq!(control.connect(100).await, ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_unhosted_equipment_closes_remote() {
    let sys = TestSystem::start().await;
    // Resolvable, but nobody hosts it
    sys.tracker
        .add(CrosspointInfo::new(300, "Missing", sys.host.clone()));
    let control = sys.add_control(1, "Panel");

    assert_eq!(control.connect(300).await, ConnectionStatus::Connected);
    assert!(
        wait_for_status(&*control, ConnectionStatus::ConnectionClosedRemote, DEFAULT_TIMEOUT)
            .await
    );
    assert_eq!(sys.controls.try_get_equipment_for_control(1), None);
}

// ============================================================================
// Routing Invariants
// ============================================================================

#[tokio::test]
async fn test_duplicate_ids_rejected() {
    let sys = TestSystem::start().await;
    sys.add_control(1, "Panel");
    assert!(matches!(
        sys.controls.create(1, "Again"),
        Err(RouterError::DuplicateId(1))
    ));
    sys.add_equipment(100, "Switcher");
    assert!(matches!(
        sys.equipment.create(100, "Again"),
        Err(RouterError::DuplicateId(100))
    ));
}

#[tokio::test]
async fn test_switch_keeps_one_route() {
    let sys = TestSystem::start().await;
    let first = sys.add_equipment(100, "Switcher");
    let second = sys.add_equipment(101, "Projector");
    let control = sys.add_control(1, "Panel");

    assert_eq!(control.connect(100).await, ConnectionStatus::Connected);
    assert!(wait_for(
        || async { first.has_control(1) },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);

    assert_eq!(control.connect(101).await, ConnectionStatus::Connected);
    assert_eq!(sys.controls.try_get_equipment_for_control(1), Some(101));
    assert_eq!(control.connected_equipment_id(), 101);

    assert!(wait_for(
        || async { !first.has_control(1) && second.has_control(1) },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);
    assert_eq!(first.status(), ConnectionStatus::Idle);

    // Both live on one host, so one pooled connection
    assert_eq!(sys.controls.pool().len(), 1);
    assert_eq!(sys.live_connections(), 1);
}

#[tokio::test]
async fn test_switch_defers_clear_into_next_payload() {
    let sys = TestSystem::start().await;
    let first = sys.add_equipment(100, "Switcher");
    let second = sys.add_equipment(101, "Projector");
    let control = sys.add_control(1, "Panel");
    let at_control = EnvelopeCollector::new();
    control.on_output(at_control.callback());

    first.send_input(vec![Signal::digital(0, 1, true)]);
    second.send_input(vec![Signal::digital(0, 2, true)]);

    control.connect(100).await;
    assert!(at_control.wait_for_count(1, DEFAULT_TIMEOUT).await);

    control.connect(101).await;
    assert!(at_control.wait_for_count(2, DEFAULT_TIMEOUT).await);

    let reply = at_control.last().unwrap();
    assert_eq!(reply.message_type, MessageType::EquipmentConnect);
    assert_eq!(reply.equipment_id, 101);
    assert_eq!(
        reply.signals,
        vec![Signal::digital(0, 1, false), Signal::digital(0, 2, true)]
    );
    assert_eq!(count_of(&at_control, MessageType::ControlClear), 0);
}

#[tokio::test]
async fn test_shared_hold_cleared_by_last_holder() {
    let sys = TestSystem::start().await;
    let equipment = sys.add_equipment(100, "Switcher");
    let one = sys.add_control(1, "Panel A");
    let two = sys.add_control(2, "Panel B");
    let at_equipment = EnvelopeCollector::new();
    equipment.on_output(at_equipment.callback());

    one.connect(100).await;
    two.connect(100).await;
    assert!(wait_for(
        || async { equipment.connected_controls() == vec![1, 2] },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);

    one.send_input(vec![Signal::digital(0, 7, true)]);
    two.send_input(vec![Signal::digital(0, 7, true)]);
    one.send_input(vec![Signal::digital(0, 8, true)]);
    assert!(at_equipment.wait_for_count(3, DEFAULT_TIMEOUT).await);

    one.disconnect().await;
    assert!(at_equipment.wait_for_count(4, DEFAULT_TIMEOUT).await);
    let clear = at_equipment.last().unwrap();
    assert_eq!(clear.message_type, MessageType::EquipmentClear);
    assert_eq!(clear.control_ids, vec![1]);
    assert_eq!(clear.signals, vec![Signal::digital(0, 8, false)]);
    assert_eq!(equipment.status(), ConnectionStatus::Connected);

    two.disconnect().await;
    assert!(at_equipment.wait_for_count(5, DEFAULT_TIMEOUT).await);
    let clear = at_equipment.last().unwrap();
    assert_eq!(clear.control_ids, vec![2]);
    assert_eq!(clear.signals, vec![Signal::digital(0, 7, false)]);
    assert!(wait_for_status(&*equipment, ConnectionStatus::Idle, DEFAULT_TIMEOUT).await);
}

#[tokio::test]
async fn test_feedback_reaches_only_routed_controls() {
    let sys = TestSystem::start().await;
    let first = sys.add_equipment(100, "Switcher");
    sys.add_equipment(101, "Projector");
    let on_first = sys.add_control(1, "Panel A");
    let on_second = sys.add_control(2, "Panel B");
    let seen_first = EnvelopeCollector::new();
    let seen_second = EnvelopeCollector::new();
    on_first.on_output(seen_first.callback());
    on_second.on_output(seen_second.callback());

    on_first.connect(100).await;
    on_second.connect(101).await;
    assert!(seen_first.wait_for_count(1, DEFAULT_TIMEOUT).await);
    assert!(seen_second.wait_for_count(1, DEFAULT_TIMEOUT).await);

    first.send_input(vec![Signal::analog(3, 1, 77)]);
    assert!(seen_first.wait_for_count(2, DEFAULT_TIMEOUT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen_second.count(), 1);
}

#[tokio::test]
async fn test_feedback_from_other_equipment_id_dropped() {
    let sys = TestSystem::start().await;
    // Hand-driven remote hosting both ids on one connection
    let mut remote = sys.network.bind("remote:41900").unwrap();
    let remote_host = HostInfo::new("remote", 41900);
    sys.tracker
        .add(CrosspointInfo::new(9, "Projector", remote_host.clone()));
    sys.tracker
        .add(CrosspointInfo::new(7, "Switcher", remote_host));
    let control = sys.add_control(5, "Panel");
    let seen = EnvelopeCollector::new();
    control.on_output(seen.callback());

    assert_eq!(control.connect(9).await, ConnectionStatus::Connected);
    let (sender, _receiver, _) = remote.accept().await.unwrap();

    let foreign = Envelope::message(7, vec![5], vec![Signal::digital(0, 1, true)]);
    let routed = Envelope::message(9, vec![5], vec![Signal::digital(0, 2, true)]);
    sender
        .try_send(codec::encode_frame(&foreign, DEFAULT_DELIMITER).unwrap())
        .unwrap();
    sender
        .try_send(codec::encode_frame(&routed, DEFAULT_DELIMITER).unwrap())
        .unwrap();

    // Frames are dispatched in order, so the first delivery settles it
    assert!(seen.wait_for_count(1, DEFAULT_TIMEOUT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let delivered = seen.envelopes();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].equipment_id, 9);
    assert_eq!(delivered[0].control_ids, vec![5]);
    assert_eq!(delivered[0].signals, vec![Signal::digital(0, 2, true)]);
    assert_eq!(control.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_unregister_is_idempotent() {
    let sys = TestSystem::start().await;
    let equipment = sys.add_equipment(100, "Switcher");
    let control = sys.add_control(1, "Panel");
    control.connect(100).await;

    assert!(sys.controls.unregister(1).await.is_some());
    assert!(sys.controls.unregister(1).await.is_none());
    assert_eq!(control.status(), ConnectionStatus::Uninitialized);
    assert_eq!(
        control.connect(100).await,
        ConnectionStatus::ControlNotFound
    );
    assert!(wait_for(
        || async { equipment.connected_controls().is_empty() },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);

    assert!(sys.equipment.unregister(100).is_some());
    assert!(sys.equipment.unregister(100).is_none());
}

#[tokio::test]
async fn test_equipment_unregister_closes_remote() {
    let sys = TestSystem::start().await;
    sys.add_equipment(100, "Switcher");
    let control = sys.add_control(1, "Panel");
    let at_control = EnvelopeCollector::new();
    control.on_output(at_control.callback());

    control.connect(100).await;
    assert!(at_control.wait_for_count(1, DEFAULT_TIMEOUT).await);

    sys.equipment.unregister(100);
    assert!(
        wait_for_status(&*control, ConnectionStatus::ConnectionClosedRemote, DEFAULT_TIMEOUT)
            .await
    );
    assert_eq!(sys.controls.try_get_equipment_for_control(1), None);
    assert!(sys.controls.pool().is_dispose_pending(&sys.host));

    // Closed remote is a failure state; the next attempt resolves again
    sys.add_equipment(100, "Switcher");
    assert_eq!(control.connect(100).await, ConnectionStatus::Connected);
}

// ============================================================================
// Connection Pool
// ============================================================================

#[tokio::test]
async fn test_pool_keep_alive() {
    let sys = TestSystem::start_with_config(ControlRegistryConfig {
        keep_alive_ms: 100,
        ..Default::default()
    })
    .await;
    sys.add_equipment(100, "Switcher");
    let control = sys.add_control(1, "Panel");

    control.connect(100).await;
    let pooled = sys.controls.pool().get(&sys.host).unwrap();

    control.disconnect().await;
    assert!(sys.controls.pool().is_dispose_pending(&sys.host));
    assert_eq!(sys.live_connections(), 1);

    // Reconnecting within the window reuses the connection
    control.connect(100).await;
    let reused = sys.controls.pool().get(&sys.host).unwrap();
    assert!(Arc::ptr_eq(&pooled, &reused));
    assert!(!sys.controls.pool().is_dispose_pending(&sys.host));

    control.disconnect().await;
    assert!(wait_for(
        || async { sys.controls.pool().is_empty() && sys.live_connections() == 0 },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);
    assert!(pooled.is_disposed());
}

#[tokio::test]
async fn test_reconnect_restores_routes() {
    let sys = TestSystem::start().await;
    let equipment = sys.add_equipment(100, "Switcher");
    let control = sys.add_control(1, "Panel");
    let at_control = EnvelopeCollector::new();
    let at_equipment = EnvelopeCollector::new();
    control.on_output(at_control.callback());
    equipment.on_output(at_equipment.callback());

    control.connect(100).await;
    assert!(at_control.wait_for_count(1, DEFAULT_TIMEOUT).await);

    assert_eq!(sys.sever(), 1);

    // The re-handshake produces a second connect reply
    assert!(wait_for(
        || async { count_of(&at_control, MessageType::EquipmentConnect) >= 2 },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);
    assert_eq!(control.status(), ConnectionStatus::Connected);
    assert_eq!(sys.controls.try_get_equipment_for_control(1), Some(100));
    assert_eq!(sys.live_connections(), 1);

    assert!(wait_for(
        || async { equipment.has_control(1) },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);
    assert!(control.send_input(vec![Signal::digital(0, 1, true)]));
    assert!(wait_for(
        || async { count_of(&at_equipment, MessageType::Message) >= 1 },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);
}

#[tokio::test]
async fn test_drop_without_auto_reconnect() {
    let sys = TestSystem::start_with_config(ControlRegistryConfig {
        auto_reconnect: false,
        ..Default::default()
    })
    .await;
    sys.add_equipment(100, "Switcher");
    let one = sys.add_control(1, "Panel A");
    let two = sys.add_control(2, "Panel B");

    one.connect(100).await;
    two.connect(100).await;
    assert_eq!(sys.sever(), 1);

    assert!(wait_for_status(&*one, ConnectionStatus::ConnectionDropped, DEFAULT_TIMEOUT).await);
    assert!(wait_for_status(&*two, ConnectionStatus::ConnectionDropped, DEFAULT_TIMEOUT).await);
    assert_eq!(sys.controls.try_get_equipment_for_control(1), None);
    assert!(wait_for(
        || async { sys.controls.pool().is_empty() },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);
}

#[tokio::test]
async fn test_failed_reconnect_drops_controls() {
    let sys = TestSystem::start().await;
    sys.add_equipment(100, "Switcher");
    let control = sys.add_control(1, "Panel");

    control.connect(100).await;
    sys.network.set_refusing(sys.host.to_string(), true);
    assert_eq!(sys.sever(), 1);

    assert!(
        wait_for_status(&*control, ConnectionStatus::ConnectionDropped, DEFAULT_TIMEOUT).await
    );

    sys.network.set_refusing(sys.host.to_string(), false);
    assert_eq!(control.connect(100).await, ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_drop_reported_after_other_control_reconnects() {
    let sys = TestSystem::start_with_config(ControlRegistryConfig {
        auto_reconnect: false,
        ..Default::default()
    })
    .await;
    let equipment = sys.add_equipment(100, "Switcher");
    let one = sys.add_control(1, "Panel A");
    let two = sys.add_control(2, "Panel B");
    let dropped = Arc::new(Notify::new());
    let notify = dropped.clone();
    one.on_status_changed(Arc::new(move |_, status| {
        if status == ConnectionStatus::ConnectionDropped {
            notify.notify_one();
        }
    }));

    assert_eq!(one.connect(100).await, ConnectionStatus::Connected);
    assert_eq!(sys.sever(), 1);
    // Reconnects the shared connection before the drop is handled
    assert_eq!(two.connect(100).await, ConnectionStatus::Connected);

    assert!(wait_with_notify(&dropped, DEFAULT_TIMEOUT).await);
    assert_eq!(one.status(), ConnectionStatus::ConnectionDropped);
    assert_eq!(sys.controls.try_get_equipment_for_control(1), None);
    assert_eq!(two.status(), ConnectionStatus::Connected);
    assert_eq!(sys.controls.try_get_equipment_for_control(2), Some(100));
    assert!(wait_for(
        || async { equipment.connected_controls() == vec![2] },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);
}

#[tokio::test]
async fn test_rehandshake_after_other_control_reconnects() {
    let sys = TestSystem::start().await;
    let equipment = sys.add_equipment(100, "Switcher");
    let one = sys.add_control(1, "Panel A");
    let two = sys.add_control(2, "Panel B");
    let at_one = EnvelopeCollector::new();
    one.on_output(at_one.callback());

    assert_eq!(one.connect(100).await, ConnectionStatus::Connected);
    assert!(at_one.wait_for_count(1, DEFAULT_TIMEOUT).await);
    assert_eq!(sys.sever(), 1);
    assert_eq!(two.connect(100).await, ConnectionStatus::Connected);

    assert!(wait_for(
        || async { equipment.connected_controls() == vec![1, 2] },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);
    assert_eq!(one.status(), ConnectionStatus::Connected);
    assert_eq!(sys.live_connections(), 1);

    equipment.send_input(vec![Signal::analog(2, 4, 640)]);
    assert!(wait_for(
        || async {
            at_one
                .envelopes()
                .iter()
                .any(|e| {
                    e.message_type == MessageType::Message
                        && e.signals == vec![Signal::analog(2, 4, 640)]
                })
        },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_release_and_claim_keeps_connection() {
    let sys = TestSystem::start_with_config(ControlRegistryConfig {
        keep_alive_ms: 20,
        ..Default::default()
    })
    .await;
    let equipment = sys.add_equipment(100, "Switcher");
    let mut leaving = sys.add_control(1, "Panel A");
    let mut joining = sys.add_control(2, "Panel B");
    let at_one = EnvelopeCollector::new();
    let at_two = EnvelopeCollector::new();
    leaving.on_output(at_one.callback());
    joining.on_output(at_two.callback());
    assert_eq!(leaving.connect(100).await, ConnectionStatus::Connected);

    for round in 0..20u16 {
        let left = leaving.clone();
        let joined = joining.clone();
        let release = tokio::spawn(async move { left.disconnect().await });
        let claim = tokio::spawn(async move { joined.connect(100).await });
        assert_eq!(release.await.unwrap(), ConnectionStatus::Idle);
        assert_eq!(claim.await.unwrap(), ConnectionStatus::Connected);

        // Outlive the keep-alive of the released route
        tokio::time::sleep(Duration::from_millis(60)).await;
        let pooled = sys.controls.pool().get(&sys.host).expect("connection in use stays pooled");
        assert!(!pooled.is_disposed());
        assert!(pooled.is_connected());
        assert_eq!(joining.status(), ConnectionStatus::Connected);

        let collector = if joining.id() == 1 { &at_one } else { &at_two };
        let value = Signal::analog(1, 1, round + 1);
        assert!(wait_for(
            || async { equipment.has_control(joining.id()) },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await);
        equipment.send_input(vec![value.clone()]);
        assert!(wait_for(
            || async { collector.envelopes().iter().any(|e| e.signals.contains(&value)) },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await);

        std::mem::swap(&mut leaving, &mut joining);
    }
}

// ============================================================================
// Listener Sharing and Protocol
// ============================================================================

#[tokio::test]
async fn test_registries_share_listener() {
    let sys = TestSystem::start().await;
    let other = EquipmentRegistry::new();

    // A second bind of the same address would fail; sharing must skip it
    let net = sys.network.clone();
    let addr = sys.host.to_string();
    other
        .listen_on(&sys.listeners, sys.host.port, move || async move { net.bind(addr) })
        .await
        .unwrap();
    assert_eq!(sys.listeners.ref_count(sys.host.port), 2);

    let projector = other.create(200, "Projector").unwrap();
    sys.tracker
        .add(CrosspointInfo::new(200, "Projector", sys.host.clone()));
    let control = sys.add_control(1, "Panel");

    assert_eq!(control.connect(200).await, ConnectionStatus::Connected);
    assert!(wait_for(
        || async { projector.has_control(1) },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);

    other.stop_listening();
    assert_eq!(sys.listeners.ref_count(sys.host.port), 1);
}

#[tokio::test]
async fn test_listener_answers_ping() {
    let sys = TestSystem::start().await;
    let (sender, mut receiver) = sys.network.connector().connect(&sys.host).await.unwrap();

    sender
        .try_send(codec::encode_frame(&Envelope::ping(), DEFAULT_DELIMITER).unwrap())
        .unwrap();

    let mut framer = DelimiterFramer::default();
    let reply = tokio::time::timeout(DEFAULT_TIMEOUT, async {
        loop {
            match receiver.recv().await {
                Some(TransportEvent::Data(data)) => {
                    framer.push(&data);
                    if let Some(frame) = framer.next_frame().unwrap() {
                        return codec::decode(&frame).unwrap();
                    }
                }
                Some(_) => {}
                None => panic!("connection closed before pong"),
            }
        }
    })
    .await
    .expect("pong in time");

    assert_eq!(reply.message_type, MessageType::Pong);
}
