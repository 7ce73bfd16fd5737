//! Overlay End-to-End
//!
//! Full loop on loopback: coordinator + relay + STUN server on one side,
//! two muxes on the other. Traffic starts on the relay fallback and moves
//! to a direct UDP path once endpoint exchange and probing promote one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshlink_control::{server, Coordinator, Ipam, MemStore, Relay, StunServer};
use meshlink_net::{Conn, InboundPacket, Mux};
use meshlink_types::api::LoginRequest;
use meshlink_types::{PrivateKey, PublicKey};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

struct TestServer {
    coordinator: Arc<Coordinator>,
    http_addr: SocketAddr,
    stun_addr: SocketAddr,
}

async fn start_server() -> TestServer {
    let store = Arc::new(MemStore::new());
    let ipam = Ipam::new("100.70.0.0/24".parse().unwrap(), []);
    let coordinator = Arc::new(Coordinator::new(
        store,
        ipam,
        PrivateKey::generate(),
        "please".into(),
    ));
    let relay = Arc::new(Relay::new());
    relay.set_key_verifier(coordinator.key_verifier());

    let app = server::app(Arc::clone(&coordinator), Arc::clone(&relay));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let stun = StunServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let stun_addr = stun.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = stun.run().await;
    });

    TestServer {
        coordinator,
        http_addr,
        stun_addr,
    }
}

async fn start_node(
    server: &TestServer,
    hostname: &str,
) -> (u64, PublicKey, Arc<Mux>, mpsc::Receiver<InboundPacket>) {
    let key = PrivateKey::generate().public();
    let login = server
        .coordinator
        .login(LoginRequest {
            node_key: key,
            hostname: hostname.into(),
            provision_key: "please".into(),
        })
        .await
        .unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (mux, inbound) = Mux::new(
        login.node_config.id,
        key,
        socket,
        &format!("http://{}", server.http_addr),
        &server.stun_addr.to_string(),
    )
    .await
    .unwrap();

    (login.node_config.id, key, mux, inbound)
}

async fn recv_payload(
    inbound: &mut mpsc::Receiver<InboundPacket>,
    want: &[u8],
    deadline: Duration,
) -> InboundPacket {
    let until = Instant::now() + deadline;
    loop {
        let left = until.saturating_duration_since(Instant::now());
        let packet = tokio::time::timeout(left, inbound.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for payload {:?}", want))
            .expect("inbound channel closed");
        if packet.payload == want {
            return packet;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relay_fallback_then_direct_promotion() {
    let server = start_server().await;

    let (id_a, key_a, mux_a, _inbound_a) = start_node(&server, "a").await;
    let (id_b, key_b, mux_b, mut inbound_b) = start_node(&server, "b").await;
    assert_ne!(id_a, id_b);

    let conn_ab = mux_a.get_conn(id_b, key_b).unwrap();
    let conn_ba: Arc<Conn> = mux_b.get_conn(id_a, key_a).unwrap();

    // both relay attachments must be live before traffic flows
    let until = Instant::now() + Duration::from_secs(10);
    while !(mux_a.relay_connected() && mux_b.relay_connected()) {
        assert!(Instant::now() < until, "relay clients never connected");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // no candidates yet, so writes fall back to the relay; delivery proves
    // the relay path, since b has no demux entry for a's address yet and
    // would drop a direct datagram. Retried because the server registers
    // the websocket a moment after the client handshake completes.
    assert_eq!(conn_ab.send_addr(), None);
    let packet = {
        let until = Instant::now() + Duration::from_secs(10);
        loop {
            conn_ab.write(b"via relay").await;
            let reply =
                tokio::time::timeout(Duration::from_millis(200), inbound_b.recv()).await;
            match reply {
                Ok(Some(packet)) if packet.payload == b"via relay" => break packet,
                _ => assert!(Instant::now() < until, "relay path never delivered"),
            }
        }
    };
    assert_eq!(packet.peer_id, id_a);

    // keep both sessions busy: exchange and probing promote the loopback
    // path on each side (the receiver needs its own promotion before its
    // demux map accepts direct traffic from the peer)
    let until = Instant::now() + Duration::from_secs(15);
    while conn_ab.send_addr().is_none() || conn_ba.send_addr().is_none() {
        assert!(Instant::now() < until, "no direct path was promoted");
        conn_ab.write(b"driver").await;
        conn_ba.write(b"driver").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(
        conn_ab.send_addr(),
        Some(mux_b.local_addr()),
        "best path should be the peer's loopback socket"
    );

    // traffic now takes the direct path end to end
    conn_ab.write(b"direct now").await;
    let packet = recv_payload(&mut inbound_b, b"direct now", Duration::from_secs(5)).await;
    assert_eq!(packet.peer_id, id_a);

    mux_a.close();
    mux_b.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stun_reports_reflexive_address() {
    let server = start_server().await;
    let (_, _, mux, _inbound) = start_node(&server, "a").await;

    let until = Instant::now() + Duration::from_secs(5);
    while mux.reflexive_addr().is_none() {
        assert!(Instant::now() < until, "no reflexive address discovered");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // on loopback the reflexive address is the socket's own address
    assert_eq!(mux.reflexive_addr(), Some(mux.local_addr()));
    mux.close();
}
