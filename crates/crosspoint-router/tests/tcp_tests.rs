//! TCP Routing Tests
//!
//! - Equipment announced over loopback UDP is routed to over real TCP
//! - A tracked host with no listener reports a failed connect

use crosspoint_core::{ConnectionStatus, CrosspointInfo, HostInfo, MessageType, Signal};
use crosspoint_discovery::{AnnouncementListener, Announcer, BroadcastConfig, RemoteCrosspointTracker};
use crosspoint_router::{
    ControlRegistry, ControlRegistryConfig, Crosspoint, EquipmentRegistry, ListenerPool,
    SystemConfig,
};
use crosspoint_test_utils::{
    find_available_port, find_available_udp_port, wait_for, wait_for_flag,
    DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// End to End
// ============================================================================

#[tokio::test]
async fn test_announced_equipment_routed_over_tcp() {
    let tcp_port = find_available_port().await;
    let udp_port = find_available_udp_port();
    let system = SystemConfig {
        system_id: 1,
        bind_address: "127.0.0.1".into(),
        base_port: tcp_port - 1,
    };

    // Equipment side
    let listeners = ListenerPool::new();
    let equipment = Arc::new(EquipmentRegistry::new());
    let switcher = equipment.create(100, "Switcher").unwrap();
    let pressed = Arc::new(AtomicBool::new(false));
    let flag = pressed.clone();
    switcher.on_output(move |envelope| {
        if envelope.message_type == MessageType::Message {
            flag.store(true, Ordering::SeqCst);
        }
    });
    equipment.listen_tcp(&listeners, &system).await.unwrap();

    let advertised = HostInfo::new("0.0.0.0", tcp_port);
    let source = equipment.clone();
    let announcer = Announcer::bind(
        BroadcastConfig {
            port: udp_port,
            address: "127.0.0.1".into(),
            interval_ms: 50,
        },
        system.system_id,
        move || source.crosspoint_infos(&advertised),
    )
    .await
    .unwrap();

    // Control side
    let tracker = Arc::new(RemoteCrosspointTracker::default());
    let listener = AnnouncementListener::bind(udp_port, system.system_id, tracker.clone())
        .await
        .unwrap();
    let listen_task = listener.start();
    let announce_task = announcer.start();

    assert!(wait_for(
        || async { tracker.contains(100) },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);
    assert_eq!(tracker.try_get(100).unwrap().host_info(), HostInfo::new("127.0.0.1", tcp_port));

    let controls = ControlRegistry::tcp(ControlRegistryConfig::default(), tracker.clone());
    let panel = controls.create(1, "Panel").unwrap();
    assert_eq!(panel.connect(100).await, ConnectionStatus::Connected);
    assert!(wait_for(
        || async { switcher.has_control(1) },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);

    assert!(panel.send_input(vec![Signal::digital(0, 1, true)]));
    assert!(wait_for_flag(&pressed, DEFAULT_TIMEOUT).await);

    controls.shutdown().await;
    equipment.stop_listening();
    announce_task.abort();
    listen_task.abort();
}

#[tokio::test]
async fn test_unlistened_tcp_port_fails_connect() {
    let port = find_available_port().await;
    let tracker = Arc::new(RemoteCrosspointTracker::default());
    tracker.add(CrosspointInfo::new(
        100,
        "Switcher",
        HostInfo::new("127.0.0.1", port),
    ));

    let controls = ControlRegistry::tcp(ControlRegistryConfig::default(), tracker);
    let panel = controls.create(1, "Panel").unwrap();
    assert_eq!(panel.connect(100).await, ConnectionStatus::ConnectFailed);
    assert_eq!(panel.status(), ConnectionStatus::ConnectFailed);
    assert!(controls.pool().is_empty());
}
