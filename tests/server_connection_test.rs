//! Server connection routing, liveness and handover against loopback peers.

mod common;

use common::{listener, mos_xml, MockNcs, PeerConnection, WAIT};
use mos_transport::{
    ConnectionEvent, ConnectionOptions, MosBody, MosError, MosMessage, NcsServerConnection,
    PortType,
};
use std::time::Duration;
use tokio::sync::broadcast;

fn connection(id: &str, timeout_ms: u64) -> NcsServerConnection {
    let options = ConnectionOptions::default()
        .with_command_timeout(Duration::from_millis(timeout_ms))
        .with_auto_reconnect_interval(Duration::from_millis(50));
    NcsServerConnection::new(id, "127.0.0.1", "MOS.TEST", options).unwrap()
}

fn ro_request(port: PortType) -> MosMessage {
    MosMessage::new(port, MosBody::new("roReq", "<roID>RO1</roID>"))
}

/// Poll the aggregate status until it reads `connected`.
async fn wait_connected(conn: &NcsServerConnection, connected: bool) {
    tokio::time::timeout(WAIT, async {
        while conn.connected().await != connected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("status never changed");
}

async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("no event")
        .unwrap()
}

#[tokio::test]
async fn test_heartbeats_bring_connection_up() {
    common::init_tracing();
    let mut peer = MockNcs::acking().await;
    let conn = connection("NCS.TEST", 500);
    conn.create_client("lower", peer.port, PortType::Lower, true).await.unwrap();
    let mut events = conn.subscribe();

    conn.connect().await.unwrap();
    match next_event(&mut events).await {
        ConnectionEvent::Info(info) => assert_eq!(
            info,
            format!("Connect client lower on lower on host 127.0.0.1 ({})", peer.port)
        ),
        other => panic!("unexpected event {:?}", other),
    }
    loop {
        if let ConnectionEvent::ConnectionChanged = next_event(&mut events).await {
            break;
        }
    }

    let status = conn.get_connected_status().await;
    assert!(status.connected);
    assert_eq!(status.status, "Connected");

    let heartbeat = peer.next_of_type("heartbeat").await;
    assert_eq!(heartbeat.mos_id, "MOS.TEST");
    assert_eq!(heartbeat.ncs_id, "NCS.TEST");
    assert!(heartbeat.body_xml.starts_with("<heartbeat><time>"));
    conn.dispose().await;
}

#[tokio::test]
async fn test_status_names_client_without_heartbeats() {
    let lower = MockNcs::acking().await;
    let upper = MockNcs::silent().await;
    let conn = connection("NCS.TEST", 300);
    conn.create_client("lower", lower.port, PortType::Lower, true).await.unwrap();
    conn.create_client("upper", upper.port, PortType::Upper, true).await.unwrap();
    let mut events = conn.subscribe();
    conn.connect().await.unwrap();

    loop {
        if let ConnectionEvent::Error(error) = next_event(&mut events).await {
            match error.as_ref() {
                MosError::Heartbeat { port, source } => {
                    assert_eq!(*port, PortType::Upper);
                    assert!(source.is_timeout());
                    assert!(error.to_string().starts_with("Heartbeat error on upper: "));
                }
                other => panic!("unexpected error {:?}", other),
            }
            break;
        }
    }

    let status = conn.get_connected_status().await;
    assert!(!status.connected);
    assert_eq!(status.status, "No heartbeats on port upper (client upper)");
    conn.dispose().await;
}

#[tokio::test]
async fn test_commands_reach_only_their_port() {
    let mut lower = MockNcs::acking().await;
    let mut upper = MockNcs::acking().await;
    let conn = connection("NCS.TEST", 2000);
    conn.create_client("lower", lower.port, PortType::Lower, false).await.unwrap();
    conn.create_client("upper", upper.port, PortType::Upper, false).await.unwrap();
    conn.connect().await.unwrap();

    let reply = conn.execute_command(ro_request(PortType::Upper)).await.unwrap();
    assert_eq!(reply.message_type(), "roAck");

    let request = upper.next_received().await;
    assert_eq!(request.message_type(), "roReq");
    assert_eq!(request.mos_id, "MOS.TEST");
    assert_eq!(request.ncs_id, "NCS.TEST");
    assert_eq!(request.message_id, reply.message_id);
    assert!(lower.try_next().is_none());

    let err = conn.execute_command(ro_request(PortType::Query)).await.unwrap_err();
    assert!(matches!(err, MosError::NoClients(PortType::Query)));
    conn.dispose().await;
}

#[tokio::test]
async fn test_socket_state_drives_status_without_heartbeats() {
    let peer = MockNcs::acking().await;
    let conn = connection("NCS.TEST", 200);
    conn.create_client("lower", peer.port, PortType::Lower, false).await.unwrap();
    let mut events = conn.subscribe();
    conn.connect().await.unwrap();

    wait_connected(&conn, true).await;

    drop(peer);
    wait_connected(&conn, false).await;
    assert_eq!(
        conn.get_connected_status().await.status,
        "Socket not connected on port lower (client lower)"
    );

    // The socket close is announced, and the failed reconnects surface as warnings.
    let mut saw_change = false;
    let mut saw_warning = false;
    while !(saw_change && saw_warning) {
        match next_event(&mut events).await {
            ConnectionEvent::ConnectionChanged => saw_change = true,
            ConnectionEvent::Warning(warning) => {
                assert!(warning.starts_with("MosSocketClient: "), "{warning}");
                saw_warning = true;
            }
            _ => {}
        }
    }
    conn.dispose().await;
}

#[tokio::test]
async fn test_unsolicited_message_is_forwarded() {
    let (listener, port) = listener().await;
    let conn = connection("NCS.TEST", 2000);
    conn.create_client("lower", port, PortType::Lower, false).await.unwrap();
    let mut events = conn.subscribe();
    conn.connect().await.unwrap();
    let mut peer = PeerConnection::accept(&listener).await;

    peer.send(&mos_xml(None, "<roReadyToAir><roID>RO1</roID></roReadyToAir>")).await;
    loop {
        if let ConnectionEvent::RawMessage { message_type, text } = next_event(&mut events).await {
            assert_eq!(message_type, "roReadyToAir");
            assert!(text.contains("<roID>RO1</roID>"));
            break;
        }
    }
    conn.dispose().await;
}

#[tokio::test]
async fn test_hand_over_settles_every_pending_command() {
    common::init_tracing();
    let mut stalled = MockNcs::silent().await;
    let mut healthy = MockNcs::acking().await;

    let a = connection("NCS.A", 10_000);
    a.create_client("a-lower", stalled.port, PortType::Lower, false).await.unwrap();
    a.connect().await.unwrap();
    let b = connection("NCS.B", 2000);
    b.create_client("b-lower", healthy.port, PortType::Lower, false).await.unwrap();
    b.connect().await.unwrap();

    let mut pending = Vec::new();
    for _ in 0..5 {
        let a = a.clone();
        pending.push(tokio::spawn(async move {
            a.execute_command(ro_request(PortType::Lower)).await
        }));
    }
    let mut sent_ids = Vec::new();
    for _ in 0..5 {
        sent_ids.push(stalled.next_received().await.message_id);
    }

    a.hand_over_queue(&b).await;
    assert_eq!(a.lower_port_clients().await[0].pending_count().await, 0);

    // Re-sent in the order they were first written, re-stamped for the
    // receiving connection with the original IDs kept.
    let mut resent_ids = Vec::new();
    for _ in 0..5 {
        let request = healthy.next_of_type("roReq").await;
        assert_eq!(request.ncs_id, "NCS.B");
        resent_ids.push(request.message_id);
    }
    assert_eq!(resent_ids, sent_ids);

    for handle in pending {
        let reply = handle.await.unwrap().unwrap();
        assert_eq!(reply.message_type(), "roAck");
    }
    a.dispose().await;
    b.dispose().await;
}

#[tokio::test]
async fn test_dispose_rejects_outstanding_commands() {
    let mut peer = MockNcs::silent().await;
    let conn = connection("NCS.TEST", 10_000);
    conn.create_client("lower", peer.port, PortType::Lower, false).await.unwrap();
    conn.connect().await.unwrap();

    let mut pending = Vec::new();
    for _ in 0..3 {
        let conn = conn.clone();
        pending.push(tokio::spawn(async move {
            conn.execute_command(ro_request(PortType::Lower)).await
        }));
    }
    for _ in 0..3 {
        peer.next_received().await;
    }

    conn.dispose().await;
    for handle in pending {
        assert!(matches!(handle.await.unwrap(), Err(MosError::Disposed)));
    }
    let status = conn.get_connected_status().await;
    assert!(!status.connected);
    assert_eq!(status.status, "Not connected");
}
