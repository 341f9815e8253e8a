use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use netchan::{
    peek_qport, ChannelConfig, ChannelManager, ChannelSide, ChannelState, Delivery,
    LinkConditions, LoopbackTransport, NetChannel, SimulatedTransport, Transport, UdpTransport,
    VarintFraming,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(40000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

fn wait_for_datagram(
    transport: &mut dyn Transport,
    timeout_ms: u64,
) -> Option<(Vec<u8>, SocketAddr)> {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        if let Some(received) = transport.recv().unwrap() {
            return Some(received);
        }
        thread::sleep(Duration::from_millis(1));
    }
    None
}

#[test]
fn test_reliable_delivery_over_udp() {
    let port = next_port();
    let server_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let client_addr: SocketAddr = format!("127.0.0.1:{}", port + 1).parse().unwrap();

    let mut server_transport = UdpTransport::bind(server_addr).unwrap();
    let mut client_transport = UdpTransport::bind(client_addr).unwrap();

    let now = Instant::now();
    let qport = 1234;
    let mut client = NetChannel::new(
        ChannelSide::Client,
        server_addr,
        qport,
        ChannelConfig::default(),
        now,
    );

    let mut manager = ChannelManager::new(8, ChannelConfig::default());

    client.enqueue_reliable(b"hello server").unwrap();
    client.set_unreliable(b"tick 0");
    client
        .transmit(Instant::now(), &VarintFraming, &mut client_transport)
        .unwrap();

    let (data, from) = wait_for_datagram(&mut server_transport, 200).expect("no packet received");
    assert_eq!(from, client_addr);
    assert_eq!(peek_qport(&data), Some(qport));

    let id = manager.create(from, qport, Instant::now()).unwrap();
    let channel = manager.get_mut(id).unwrap();
    let deliveries = channel.process(&data, from, Instant::now(), &VarintFraming);
    assert_eq!(
        deliveries,
        vec![
            Delivery::Reliable(b"hello server".to_vec()),
            Delivery::Unreliable(b"tick 0".to_vec()),
        ]
    );
    assert_eq!(channel.state(), ChannelState::Connected);

    // the server's next packet carries the ack that retires the fragment
    channel
        .transmit(Instant::now(), &VarintFraming, &mut server_transport)
        .unwrap();

    let (data, from) = wait_for_datagram(&mut client_transport, 200).expect("no packet received");
    assert_eq!(from, server_addr);
    assert!(client.has_pending_reliable());
    client.process(&data, from, Instant::now(), &VarintFraming);
    assert!(!client.has_pending_reliable());
    assert_eq!(client.state(), ChannelState::Connected);
}

#[test]
fn test_reliable_survives_total_loss_window() {
    let addr_a: SocketAddr = "10.1.0.1:27901".parse().unwrap();
    let addr_b: SocketAddr = "10.1.0.2:27910".parse().unwrap();
    let (ta, tb) = LoopbackTransport::pair(addr_a, addr_b);

    let lossy = LinkConditions {
        enabled: true,
        loss_percent: 100.0,
        ..LinkConditions::default()
    };
    let mut ta = SimulatedTransport::new(ta, lossy);
    let mut tb = tb;

    let now = Instant::now();
    let mut a = NetChannel::new(ChannelSide::Client, addr_b, 7, ChannelConfig::default(), now);
    let mut b = NetChannel::new(ChannelSide::Server, addr_a, 7, ChannelConfig::default(), now);

    a.enqueue_reliable(b"payload").unwrap();

    // a few ticks into a black hole: nothing arrives, nothing is acked
    for _ in 0..3 {
        a.transmit(Instant::now(), &VarintFraming, &mut ta).unwrap();
        assert!(tb.recv().unwrap().is_none());
    }
    assert!(a.has_pending_reliable());

    // the link heals; keep ticking both sides until the fragment lands
    ta.set_conditions(LinkConditions::default());
    let mut reliable_deliveries = 0;
    for _ in 0..10 {
        a.transmit(Instant::now(), &VarintFraming, &mut ta).unwrap();
        while let Some((data, from)) = tb.recv().unwrap() {
            for delivery in b.process(&data, from, Instant::now(), &VarintFraming) {
                if delivery == Delivery::Reliable(b"payload".to_vec()) {
                    reliable_deliveries += 1;
                }
            }
        }
        b.transmit(Instant::now(), &VarintFraming, &mut tb).unwrap();
        while let Some((data, from)) = ta.recv().unwrap() {
            a.process(&data, from, Instant::now(), &VarintFraming);
        }
        if !a.has_pending_reliable() {
            break;
        }
    }

    assert_eq!(reliable_deliveries, 1);
    assert!(!a.has_pending_reliable());
}

#[test]
fn test_queued_reliables_arrive_in_order() {
    let addr_a: SocketAddr = "10.1.0.1:27901".parse().unwrap();
    let addr_b: SocketAddr = "10.1.0.2:27910".parse().unwrap();
    let (mut ta, mut tb) = LoopbackTransport::pair(addr_a, addr_b);

    let now = Instant::now();
    let mut a = NetChannel::new(ChannelSide::Client, addr_b, 7, ChannelConfig::default(), now);
    let mut b = NetChannel::new(ChannelSide::Server, addr_a, 7, ChannelConfig::default(), now);

    let messages: Vec<Vec<u8>> = (0..5).map(|i| format!("msg {i}").into_bytes()).collect();
    for message in &messages {
        a.enqueue_reliable(message).unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..12 {
        a.transmit(Instant::now(), &VarintFraming, &mut ta).unwrap();
        while let Some((data, from)) = tb.recv().unwrap() {
            for delivery in b.process(&data, from, Instant::now(), &VarintFraming) {
                if let Delivery::Reliable(payload) = delivery {
                    received.push(payload);
                }
            }
        }
        b.transmit(Instant::now(), &VarintFraming, &mut tb).unwrap();
        while let Some((data, from)) = ta.recv().unwrap() {
            a.process(&data, from, Instant::now(), &VarintFraming);
        }
        if received.len() == messages.len() && !a.has_pending_reliable() {
            break;
        }
    }

    assert_eq!(received, messages);
}

#[test]
fn test_manager_routes_multiple_clients_over_udp() {
    let port = next_port();
    let server_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let mut server_transport = UdpTransport::bind(server_addr).unwrap();
    let mut manager = ChannelManager::new(8, ChannelConfig::default());

    let mut clients = Vec::new();
    for i in 0..3u16 {
        let addr: SocketAddr = format!("127.0.0.1:{}", port + 1 + i).parse().unwrap();
        let transport = UdpTransport::bind(addr).unwrap();
        let channel = NetChannel::new(
            ChannelSide::Client,
            server_addr,
            100 + i,
            ChannelConfig::default(),
            Instant::now(),
        );
        clients.push((channel, transport));
    }

    for (i, (channel, transport)) in clients.iter_mut().enumerate() {
        channel.set_unreliable(format!("from client {i}").as_bytes());
        channel
            .transmit(Instant::now(), &VarintFraming, transport)
            .unwrap();
    }

    let mut routed = 0;
    let start = Instant::now();
    while routed < 3 && start.elapsed() < Duration::from_millis(500) {
        let Some((data, from)) = server_transport.recv().unwrap() else {
            thread::sleep(Duration::from_millis(1));
            continue;
        };
        let qport = peek_qport(&data).expect("sequenced packet without qport");
        let id = match manager.lookup(from, Some(qport)) {
            Some(id) => id,
            None => manager.create(from, qport, Instant::now()).unwrap(),
        };
        let channel = manager.get_mut(id).unwrap();
        let deliveries = channel.process(&data, from, Instant::now(), &VarintFraming);
        assert_eq!(deliveries.len(), 1);
        routed += 1;
    }

    assert_eq!(routed, 3);
    assert_eq!(manager.len(), 3);
}
