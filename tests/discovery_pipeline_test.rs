//! Datagram -> match events -> routing table -> reachable stream set

mod common;

use closecircuit_core::{DiscoveryConfig, RoutingConfig};
use closecircuit_discovery::{
    parse_message, routing, DiscoveryClient, DiscoveryMessage, NetworkInterface, ProbeMatch,
    RoutingTable,
};
use common::probe_matches_datagram;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn parse_probe_matches(datagram: &[u8]) -> Vec<ProbeMatch> {
    match parse_message(datagram).expect("datagram should parse") {
        DiscoveryMessage::ProbeMatches(matches) => matches,
        other => panic!("expected ProbeMatches, got {:?}", other),
    }
}

#[tokio::test]
async fn test_datagram_to_playback_url() {
    let datagram = probe_matches_datagram(&[(
        "urn:uuid:1234",
        "http://192.168.1.5:8080/onvif/device_service",
    )]);

    let mut table = RoutingTable::from_config(&RoutingConfig::default());
    let now = Instant::now();
    for m in parse_probe_matches(&datagram) {
        table.upsert(&m, now);
    }

    let reachable = table.reachable_at(now);
    assert_eq!(
        reachable.into_iter().collect::<Vec<_>>(),
        vec!["http://192.168.1.5:8080/video".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_silent_camera_expires_while_renewing_camera_stays() {
    let (tx, rx) = broadcast::channel(64);
    let handle = routing::spawn(rx, &RoutingConfig::default(), CancellationToken::new());
    let mut reachable = handle.subscribe();

    let both = probe_matches_datagram(&[
        ("urn:uuid:front-door", "http://10.0.0.2:8080/onvif/device_service"),
        ("urn:uuid:garage", "http://10.0.0.3:8080/onvif/device_service"),
    ]);
    let front_door_only = probe_matches_datagram(&[(
        "urn:uuid:front-door",
        "http://10.0.0.2:8080/onvif/device_service",
    )]);

    for m in parse_probe_matches(&both) {
        tx.send(m).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.current().len(), 2);

    // Only the front door keeps answering the once-a-second probe
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        for m in parse_probe_matches(&front_door_only) {
            tx.send(m).unwrap();
        }
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    let current = reachable.borrow_and_update().clone();
    assert_eq!(
        current.into_iter().collect::<Vec<_>>(),
        vec!["http://10.0.0.2:8080/video".to_string()]
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn test_client_feeds_routing_table() {
    let config = DiscoveryConfig {
        port: 0,
        probe_interval_ms: None,
        ..Default::default()
    };
    let mut client = DiscoveryClient::new(config);
    let handle = routing::spawn(
        client.probe_matches(),
        &RoutingConfig::default(),
        CancellationToken::new(),
    );
    let mut reachable = handle.subscribe();

    // No addresses: the client listens for unicast replies only
    client
        .initialize(NetworkInterface::new("test0", 0))
        .await
        .unwrap();
    let port = client.local_addrs()[0].port();

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let datagram = probe_matches_datagram(&[(
        "urn:uuid:cam-1",
        "http://127.0.0.1:8554/onvif/device_service",
    )]);
    sender.send_to(&datagram, ("127.0.0.1", port)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), reachable.changed())
        .await
        .expect("reachable set should change")
        .unwrap();
    assert!(reachable
        .borrow_and_update()
        .contains("http://127.0.0.1:8554/video"));

    client.close().await.unwrap();
    handle.shutdown().await;
}
