//! Integration tests for the envelope path over loopback UDP.
//!
//! A publisher sends to a subscriber bound on 127.0.0.1, and received
//! envelopes are handed to a running aggregator task the way the listener
//! command wires them.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use chrono::Utc;
use p1meter::aggregator::{Aggregator, Event, SinkSet};
use p1meter::config::{AggregatorConfig, MulticastConfig, SinkConfig};
use p1meter::window::Calendar;
use p1meter::{Envelope, Measurement, ObisTable, Publisher, Subscriber, TelegramParser};
use tempfile::tempdir;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

const TELEGRAM: &[u8] = b"/ISK5\\2M550T-1013\r\n1-0:1.8.0(00123.456*kWh)\r\n!9A54";

fn measurement() -> Measurement {
    TelegramParser::default().parse(TELEGRAM).unwrap()
}

async fn loopback_pair() -> (Subscriber, Publisher) {
    let listen = MulticastConfig {
        group: Ipv4Addr::LOCALHOST,
        port: 0,
        ..MulticastConfig::default()
    };
    let subscriber = Subscriber::bind(&listen, Duration::from_millis(500))
        .await
        .unwrap();
    let send = MulticastConfig {
        port: subscriber.local_addr().unwrap().port(),
        ..listen
    };
    let publisher = Publisher::bind(&send).await.unwrap();
    (subscriber, publisher)
}

async fn receive(subscriber: &mut Subscriber) -> Envelope {
    timeout(Duration::from_secs(5), subscriber.next())
        .await
        .expect("no envelope within 5s")
        .unwrap()
}

#[tokio::test]
async fn test_malformed_datagram_skipped() {
    let (mut subscriber, mut publisher) = loopback_pair().await;
    let target: SocketAddr = publisher.target();

    let stray = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    stray.send_to(b"{\"not\": \"an envelope\"", target).await.unwrap();
    stray.send_to(&[0xff, 0x00, 0x13], target).await.unwrap();

    let now = Utc::now();
    let sent = publisher.publish(measurement(), now, now).await.unwrap();

    let received = receive(&mut subscriber).await;
    assert_eq!(received, sent);
    assert_eq!(received.sequence, 1);
    assert_eq!(
        received.measurement.number("1-0:1.8.0").unwrap().to_string(),
        "123.456"
    );
}

#[tokio::test]
async fn test_publisher_restart_detected() {
    let (mut subscriber, mut first) = loopback_pair().await;
    let now = Utc::now();

    for _ in 0..3 {
        first.publish(measurement(), now, now).await.unwrap();
    }
    for expected in 1..=3 {
        assert_eq!(receive(&mut subscriber).await.sequence, expected);
    }

    // A new process starts numbering from 1 again on a new source port.
    let send = MulticastConfig {
        group: Ipv4Addr::LOCALHOST,
        port: subscriber.local_addr().unwrap().port(),
        ..MulticastConfig::default()
    };
    let mut second = Publisher::bind(&send).await.unwrap();
    second.publish(measurement(), now, now).await.unwrap();

    assert_eq!(receive(&mut subscriber).await.sequence, 1);
    assert_eq!(subscriber.tracker().resets(), 1);
    assert_eq!(subscriber.tracker().missed(), 0);
}

#[tokio::test]
async fn test_received_envelopes_reach_detail_file() {
    let dir = tempdir().unwrap();
    let sinks = SinkConfig {
        detail: format!("{}/detail.jsonl", dir.path().display()),
        interval: format!("{}/interval.jsonl", dir.path().display()),
        day: format!("{}/day.jsonl", dir.path().display()),
        week: format!("{}/week.jsonl", dir.path().display()),
    };
    let config = AggregatorConfig::default();
    let now = Utc::now();
    let calendar = Calendar::new(Utc, config.interval);
    let sink_set = SinkSet::from_config(&sinks, &calendar, now).unwrap();
    let aggregator = Aggregator::new(&config, ObisTable::dsmr(), calendar, sink_set, now);

    let (events, queue) = mpsc::channel(16);
    let worker = tokio::spawn(aggregator.run(queue));

    let (mut subscriber, mut publisher) = loopback_pair().await;
    for _ in 0..3 {
        let at = Utc::now();
        publisher.publish(measurement(), at, at).await.unwrap();
    }
    for _ in 0..3 {
        let envelope = receive(&mut subscriber).await;
        events.send(Event::Envelope(envelope)).await.unwrap();
    }
    events.send(Event::Shutdown).await.unwrap();

    let stats = timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.envelopes, 3);
    assert_eq!(stats.snapshots_lost, 0);

    let detail = fs::read_to_string(dir.path().join("detail.jsonl")).unwrap();
    let sequences: Vec<u64> = detail
        .lines()
        .map(|line| serde_json::from_str::<Envelope>(line).unwrap().sequence)
        .collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert!(dir.path().join("day.jsonl").exists());
}
