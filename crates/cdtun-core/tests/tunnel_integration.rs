//! End-to-end tunnel scenarios over in-memory duplex streams and a fake
//! TUN device: handshake, forwarding in both directions, fanout, and
//! shutdown coupling.

use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

use cdtun_core::demux::L4Protocol;
use cdtun_core::error::Error;
use cdtun_core::handshake::perform_handshake;
use cdtun_core::netconfig;
use cdtun_core::protocol::TunnelParameters;
use cdtun_core::tunnel::{SessionState, TunDevice, TunnelSession};
use cdtun_test_utils::FakeTun;

fn params() -> TunnelParameters {
    TunnelParameters {
        client_address: "fd00::2".parse::<Ipv6Addr>().unwrap(),
        mtu: 1500,
        server_address: "fd00::1".parse::<Ipv6Addr>().unwrap(),
        server_rsd_port: None,
    }
}

/// IPv6 datagram from fd00::2 to fd00::1 with the given next-header and
/// payload.
fn ipv6_datagram(next_header: u8, payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; 40 + payload.len()];
    pkt[0] = 0x60;
    pkt[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    pkt[6] = next_header;
    pkt[7] = 64;
    pkt[8..24].copy_from_slice(&"fd00::2".parse::<Ipv6Addr>().unwrap().octets());
    pkt[24..40].copy_from_slice(&"fd00::1".parse::<Ipv6Addr>().unwrap().octets());
    pkt[40..].copy_from_slice(payload);
    pkt
}

/// The 48-byte UDP probe used across scenarios: sport 1234, dport 5678,
/// length 8, no data.
fn udp_probe() -> Vec<u8> {
    let pkt = ipv6_datagram(17, &[0x04, 0xD2, 0x16, 0x2E, 0x00, 0x08, 0x00, 0x00]);
    assert_eq!(pkt.len(), 48);
    pkt
}

async fn wait_for_state(session: &Arc<TunnelSession>, state: SessionState, budget: Duration) {
    let deadline = tokio::time::Instant::now() + budget;
    while session.state() != state {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session did not reach {state:?} within {budget:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn successful_handshake_with_literal_frame() {
    // Wire bytes exactly as a peer would send them: magic, 0x00 0x5A, and
    // a 90-byte JSON payload (padded with trailing whitespace).
    let json = r#"{"clientParameters":{"address":"fd00::2","mtu":1500},"serverAddress":"fd00::1"}"#;
    let payload = format!("{json:<90}");
    assert_eq!(payload.len(), 0x5A);

    let mut frame = Vec::new();
    frame.extend_from_slice(b"CDTunnel");
    frame.extend_from_slice(&[0x00, 0x5A]);
    frame.extend_from_slice(payload.as_bytes());

    let (mut client, mut server) = duplex(4096);
    let peer = tokio::spawn(async move {
        let mut req = vec![0u8; 55];
        server.read_exact(&mut req).await.unwrap();
        server.write_all(&frame).await.unwrap();
        req
    });

    let params = perform_handshake(&mut client).await.unwrap();
    assert_eq!(params.client_address, "fd00::2".parse::<Ipv6Addr>().unwrap());
    assert_eq!(params.mtu, 1500);
    assert_eq!(params.server_address, "fd00::1".parse::<Ipv6Addr>().unwrap());
    assert_eq!(params.server_rsd_port, None);

    // The request on the wire is the canonical 45-byte JSON frame.
    let req = peer.await.unwrap();
    assert_eq!(&req[..8], b"CDTunnel");
    assert_eq!(
        &req[10..],
        br#"{"type":"clientHandshakeRequest","mtu":16000}"#
    );
}

#[tokio::test]
async fn udp_packet_fans_out_to_subscriber() {
    let tun = FakeTun::new("faketun0");
    let session = TunnelSession::from_device(Arc::new(tun.clone()), params());
    let mut records = session.packet_stream().unwrap();

    let (client, mut peer) = duplex(4096);
    session.start_forwarding(client).unwrap();

    peer.write_all(&udp_probe()).await.unwrap();

    let record = tokio::time::timeout(Duration::from_secs(1), records.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.protocol, L4Protocol::Udp);
    assert_eq!(record.src, "fd00:0000:0000:0000:0000:0000:0000:0002");
    assert_eq!(record.dst, "fd00:0000:0000:0000:0000:0000:0000:0001");
    assert_eq!(record.source_port, 1234);
    assert_eq!(record.dest_port, 5678);
    assert!(record.payload.is_empty());

    // The datagram was also forwarded to the interface.
    assert_eq!(tun.take_all_outgoing(), vec![udp_probe()]);

    session.stop().await;
}

#[tokio::test]
async fn short_tcp_packet_is_forwarded_without_event() {
    let tun = FakeTun::new("faketun0");
    let session = TunnelSession::from_device(Arc::new(tun.clone()), params());
    let mut records = session.packet_stream().unwrap();

    let (client, mut peer) = duplex(4096);
    session.start_forwarding(client).unwrap();

    // 15-byte TCP payload: below the minimum TCP header length.
    let pkt = ipv6_datagram(6, &[0u8; 15]);
    peer.write_all(&pkt).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    while tun.outgoing_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "packet not forwarded");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(tun.take_outgoing_frame().unwrap(), pkt);
    assert!(records.try_next().is_none());

    session.stop().await;
}

#[tokio::test]
async fn chunked_framing_produces_one_event() {
    let tun = FakeTun::new("faketun0");
    let session = TunnelSession::from_device(Arc::new(tun.clone()), params());
    let mut records = session.packet_stream().unwrap();

    let (client, mut peer) = duplex(4096);
    session.start_forwarding(client).unwrap();

    let pkt = udp_probe();
    let chunks: Vec<&[u8]> = pkt.chunks(12).collect();
    assert_eq!(chunks.len(), 4);

    for chunk in &chunks[..3] {
        peer.write_all(chunk).await.unwrap();
        peer.flush().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(records.try_next().is_none(), "no event before the final chunk");

    peer.write_all(chunks[3]).await.unwrap();
    let record = tokio::time::timeout(Duration::from_secs(1), records.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.source_port, 1234);
    assert!(records.try_next().is_none(), "exactly one event");

    session.stop().await;
}

#[tokio::test]
async fn stream_close_stops_session_within_budget() {
    let tun = FakeTun::new("faketun0");
    let session = TunnelSession::from_device(Arc::new(tun.clone()), params());

    let (client, mut peer) = duplex(4096);
    session.start_forwarding(client).unwrap();

    // Forward a few packets, then the peer goes away.
    for _ in 0..3 {
        peer.write_all(&udp_probe()).await.unwrap();
    }
    drop(peer);

    wait_for_state(&session, SessionState::Stopped, Duration::from_millis(200)).await;
    assert!(tun.is_closed());
}

#[tokio::test]
async fn egress_round_trip_through_darwin_framing() {
    let tun = FakeTun::new_darwin("utun9");
    let session = TunnelSession::from_device(Arc::new(tun.clone()), params());

    let (client, mut peer) = duplex(4096);
    session.start_forwarding(client).unwrap();

    // Kernel-side frame carries the family prefix; the peer must see the
    // bare datagram.
    let pkt = udp_probe();
    tun.inject_packet(&pkt);

    let mut got = vec![0u8; pkt.len()];
    tokio::time::timeout(Duration::from_secs(1), peer.read_exact(&mut got))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, pkt);

    // Peer-to-interface direction prepends the prefix on the wire frame.
    peer.write_all(&pkt).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    loop {
        if let Some(frame) = tun.take_outgoing_frame() {
            assert_eq!(&frame[..4], &[0, 0, 0, 30]);
            assert_eq!(&frame[4..], &pkt[..]);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "write not observed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    session.stop().await;
}

#[tokio::test]
async fn close_is_idempotent_and_operations_fail_after() {
    let tun = FakeTun::new("faketun0");
    let session = TunnelSession::from_device(Arc::new(tun.clone()), params());
    let (client, _peer) = duplex(4096);
    session.start_forwarding(client).unwrap();

    for _ in 0..3 {
        session.close().await;
    }

    assert_eq!(session.state(), SessionState::Stopped);
    assert!(tun.is_closed());
    assert!(matches!(session.packet_stream(), Err(Error::AlreadyClosed)));

    // No reads happen after cleanup.
    let reads = tun.read_count();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(tun.read_count(), reads);
}

#[tokio::test]
async fn close_ends_stream_gracefully_for_peer() {
    let tun = FakeTun::new("faketun0");
    let session = TunnelSession::from_device(Arc::new(tun.clone()), params());

    let (client, mut peer) = duplex(4096);
    session.start_forwarding(client).unwrap();

    // Traffic flows, then the local side closes the session.
    peer.write_all(&udp_probe()).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    while tun.outgoing_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "packet not forwarded");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    session.close().await;
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(tun.is_closed());

    // The peer reads a clean EOF from the shut-down stream rather than
    // hanging on a wedged socket.
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_millis(200), peer.read(&mut buf))
        .await
        .expect("peer did not observe end of stream")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn invalid_configuration_is_rejected_before_any_command() {
    let err = netconfig::configure("faketun0", "not-an-ip", 1500).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));

    let err = netconfig::configure("faketun0", "fd00::3", 100).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
    assert!(err.to_string().contains("MTU must be between 1280 and 65535"));
}

#[tokio::test]
async fn subscribers_all_see_records_in_wire_order() {
    let tun = FakeTun::new("faketun0");
    let session = TunnelSession::from_device(Arc::new(tun), params());
    let mut a = session.packet_stream().unwrap();
    let mut b = session.packet_stream().unwrap();

    let (client, mut peer) = duplex(4096);
    session.start_forwarding(client).unwrap();

    // Three UDP datagrams with distinct source ports, written back to back.
    let mut wire = Vec::new();
    for sport in [10u16, 20, 30] {
        let mut payload = vec![0u8; 8];
        payload[0..2].copy_from_slice(&sport.to_be_bytes());
        payload[2..4].copy_from_slice(&53u16.to_be_bytes());
        payload[4..6].copy_from_slice(&8u16.to_be_bytes());
        wire.extend_from_slice(&ipv6_datagram(17, &payload));
    }
    peer.write_all(&wire).await.unwrap();

    for stream in [&mut a, &mut b] {
        for expected in [10u16, 20, 30] {
            let record = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.source_port, expected);
        }
    }

    session.stop().await;
    assert!(a.next().await.is_none());
    assert!(b.next().await.is_none());
}
