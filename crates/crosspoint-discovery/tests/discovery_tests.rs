//! Discovery Tests
//!
//! - Expiry never removes an entry before `added_at + 5 × interval`
//! - Found/Lost events
//! - Announcements over loopback UDP reach the tracker

use crosspoint_core::{CrosspointInfo, HostInfo};
use crosspoint_discovery::{
    AnnouncementListener, Announcer, BroadcastConfig, DiscoveryEvent, RemoteCrosspointTracker,
    TrackerConfig,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

fn equipment(id: u32) -> CrosspointInfo {
    CrosspointInfo::new(id, format!("Equipment {}", id), HostInfo::new("10.0.0.4", 41801))
}

// ============================================================================
// Expiry
// ============================================================================

#[test]
fn test_expiry_boundary() {
    let tracker = RemoteCrosspointTracker::new(TrackerConfig {
        broadcast_interval_ms: 1000,
        expiry_multiplier: 5,
        ..Default::default()
    })
    .unwrap();

    let t0 = Instant::now();
    tracker.add_at(equipment(1), t0);

    assert!(tracker.purge_expired_at(t0 + Duration::from_secs(4)).is_empty());
    assert!(tracker.purge_expired_at(t0 + Duration::from_secs(5)).is_empty());
    assert!(tracker.contains(1));

    let purged = tracker.purge_expired_at(t0 + Duration::from_millis(5001));
    assert_eq!(purged, vec![1]);
    assert!(!tracker.contains(1));
}

#[test]
fn test_refresh_extends_lifetime() {
    let tracker = RemoteCrosspointTracker::new(TrackerConfig {
        broadcast_interval_ms: 1000,
        ..Default::default()
    })
    .unwrap();

    let t0 = Instant::now();
    tracker.add_at(equipment(1), t0);
    tracker.add_at(equipment(1), t0 + Duration::from_secs(4));

    assert!(tracker.purge_expired_at(t0 + Duration::from_secs(8)).is_empty());
    assert_eq!(
        tracker.purge_expired_at(t0 + Duration::from_secs(10)),
        vec![1]
    );
}

#[tokio::test]
async fn test_expiry_task_purges() {
    let tracker = Arc::new(RemoteCrosspointTracker::new(TrackerConfig {
        broadcast_interval_ms: 20,
        expiry_multiplier: 2,
        ..Default::default()
    })
    .unwrap());
    tracker.add(equipment(7));
    tracker.start_expiry();

    let deadline = Instant::now() + Duration::from_secs(2);
    while tracker.contains(7) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!tracker.contains(7));
    tracker.stop_expiry();
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn test_found_and_lost_events() {
    let tracker = RemoteCrosspointTracker::default();
    let mut events = tracker.subscribe();

    tracker.add(equipment(3));
    tracker.add(equipment(3)); // refresh, no event
    tracker.remove(3);
    tracker.remove(3); // already gone, no event

    assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::Found(equipment(3)));
    assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::Lost(3));
    assert!(events.try_recv().is_err());
}

// ============================================================================
// Announcements
// ============================================================================

#[tokio::test]
async fn test_announcement_reaches_tracker() {
    let tracker = Arc::new(RemoteCrosspointTracker::default());
    let listener = AnnouncementListener::bind(0, 2, tracker.clone())
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();
    let listen_task = listener.start();

    let config = BroadcastConfig {
        port,
        address: "127.0.0.1".into(),
        interval_ms: 50,
    };
    let announcer = Announcer::bind(config, 2, || {
        vec![CrosspointInfo::new(
            21,
            "Switcher",
            HostInfo::new("0.0.0.0", 41802),
        )]
    })
    .await
    .unwrap();
    let announce_task = announcer.start();

    let found = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(info) = tracker.try_get(21) {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("announcement never arrived");

    // Unspecified host replaced by the datagram source
    assert_eq!(found.host, "127.0.0.1");
    assert_eq!(found.port, 41802);

    announce_task.abort();
    listen_task.abort();
}

#[tokio::test]
async fn test_other_system_ignored() {
    let tracker = Arc::new(RemoteCrosspointTracker::default());
    let listener = AnnouncementListener::bind(0, 1, tracker.clone())
        .await
        .unwrap();

    let foreign = crosspoint_discovery::Announcement {
        system_id: 9,
        crosspoints: vec![equipment(5)],
    };
    let from = "10.0.0.4:5000".parse().unwrap();
    assert_eq!(listener.handle_datagram(&foreign.encode().unwrap(), from), 0);
    assert_eq!(listener.handle_datagram(b"garbage", from), 0);
    assert!(tracker.is_empty());
}
