//! End-to-end tests for the console WebSocket relay: a real gateway bound on
//! an ephemeral port, a mock upstream VNC websocket, and a real client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pvegate_common::{ConsoleSessionBundle, Database, PveServer, VirtualMachine};
use pvegate_web::server::{WebServer, WebServerConfig, WebUiAuth};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::Message;

/// Accept a websocket like PVE does: echo the `binary` subprotocol the relay
/// requests, or the client side of the handshake fails.
async fn accept_binary(
    stream: tokio::net::TcpStream,
) -> tokio_tungstenite::WebSocketStream<tokio::net::TcpStream> {
    tokio_tungstenite::accept_hdr_async(
        stream,
        |_req: &HandshakeRequest, mut resp: HandshakeResponse| {
            resp.headers_mut()
                .insert("Sec-WebSocket-Protocol", "binary".parse().unwrap());
            Ok(resp)
        },
    )
    .await
    .unwrap()
}

const AUTH: &str = "test-token";
const WAIT: Duration = Duration::from_secs(5);

async fn start_gateway(db: Database) -> (SocketAddr, WebServer) {
    let server = WebServer::new(
        db,
        WebServerConfig {
            auth: WebUiAuth::Token(AUTH.to_string()),
            console_session_ttl: Duration::from_secs(60),
        },
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = server.router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, server)
}

fn seed_inventory(db: &Database) -> (PveServer, VirtualMachine) {
    let server = PveServer::new(
        "lab".to_string(),
        "127.0.0.1".to_string(),
        8006,
        "root@pam!gw".to_string(),
        "s3cr3t".to_string(),
        false,
    );
    db.insert_server(&server).unwrap();
    let vm = VirtualMachine::new(server.id.clone(), 100, "web-1".to_string(), "pve1".to_string());
    db.insert_vm(&vm).unwrap();
    (server, vm)
}

/// Mock upstream VNC websocket. On connect it sends three binary frames,
/// then records everything it receives until the peer goes away.
async fn start_upstream(
    contacted: Arc<AtomicBool>,
    received_tx: mpsc::UnboundedSender<Message>,
    closed_tx: oneshot::Sender<()>,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            contacted.store(true, Ordering::SeqCst);
            let mut ws = accept_binary(stream).await;
            for i in 0..3u8 {
                ws.send(Message::Binary(vec![0xA0, i])).await.unwrap();
            }
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                    other => {
                        let _ = received_tx.send(other);
                    }
                }
            }
        }
        let _ = closed_tx.send(());
    });
    addr
}

fn bundle_for(vm: &VirtualMachine, server: &PveServer, upstream: SocketAddr) -> ConsoleSessionBundle {
    ConsoleSessionBundle {
        // Plain ws: the mock has no TLS; the relay's connector only engages
        // for wss URLs.
        websocket_url: format!("ws://{}/vncwebsocket?port=5900&vncticket=abc", upstream),
        ticket: "abc".to_string(),
        password: Some("pw".to_string()),
        port: 5900,
        vm_id: vm.id.clone(),
        vmid: vm.vmid,
        node: vm.node.clone(),
        server_id: server.id.clone(),
        vm_name: vm.name.clone(),
        origin: "https://127.0.0.1:8006".to_string(),
    }
}

#[tokio::test]
async fn relays_frames_both_ways_and_tears_down_upstream() {
    let db = Database::open_memory().unwrap();
    let (server, vm) = seed_inventory(&db);
    let (gateway, web) = start_gateway(db).await;

    let contacted = Arc::new(AtomicBool::new(false));
    let (received_tx, mut received_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = oneshot::channel();
    let upstream = start_upstream(contacted.clone(), received_tx, closed_tx).await;

    let token = web
        .session_broker()
        .issue(bundle_for(&vm, &server, upstream), Duration::from_secs(60));

    let url = format!(
        "ws://{}/console/{}?token={}&auth={}",
        gateway, vm.id, token, AUTH
    );
    let (mut client, _) = tokio::time::timeout(WAIT, tokio_tungstenite::connect_async(url))
        .await
        .unwrap()
        .expect("relay accepts a valid session");

    // Upstream greets with three binary frames; they must arrive unmodified
    // and in order.
    for i in 0..3u8 {
        let msg = tokio::time::timeout(WAIT, client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::Binary(vec![0xA0, i]));
    }

    // Client sends three binary frames and one text frame; the upstream must
    // see them byte-for-byte with frame types preserved.
    for i in 0..3u8 {
        client.send(Message::Binary(vec![0xB0, i])).await.unwrap();
    }
    client
        .send(Message::Text("RFB 003.008\n".to_string()))
        .await
        .unwrap();

    for i in 0..3u8 {
        let msg = tokio::time::timeout(WAIT, received_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::Binary(vec![0xB0, i]));
    }
    let msg = tokio::time::timeout(WAIT, received_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg, Message::Text("RFB 003.008\n".to_string()));

    // Client disconnect must close the upstream leg within a bounded time.
    client.close(None).await.unwrap();
    drop(client);
    tokio::time::timeout(WAIT, closed_rx)
        .await
        .expect("upstream closed after client disconnect")
        .unwrap();

    assert!(contacted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn invalid_token_is_rejected_without_upstream_dial() {
    let db = Database::open_memory().unwrap();
    let (_server, vm) = seed_inventory(&db);
    let (gateway, _web) = start_gateway(db).await;

    let contacted = Arc::new(AtomicBool::new(false));
    let (received_tx, _received_rx) = mpsc::unbounded_channel();
    let (closed_tx, _closed_rx) = oneshot::channel();
    let _upstream = start_upstream(contacted.clone(), received_tx, closed_tx).await;

    let url = format!(
        "ws://{}/console/{}?token=invalid&auth={}",
        gateway, vm.id, AUTH
    );
    let err = tokio::time::timeout(WAIT, tokio_tungstenite::connect_async(url))
        .await
        .unwrap()
        .expect_err("invalid token must not upgrade");

    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => {
            assert_eq!(resp.status().as_u16(), 403);
        }
        other => panic!("expected HTTP rejection, got {:?}", other),
    }
    assert!(!contacted.load(Ordering::SeqCst), "upstream must never be dialed");
}

#[tokio::test]
async fn token_bound_to_another_vm_is_rejected_and_consumed() {
    let db = Database::open_memory().unwrap();
    let (server, vm) = seed_inventory(&db);
    let (gateway, web) = start_gateway(db).await;

    let contacted = Arc::new(AtomicBool::new(false));
    let (received_tx, _received_rx) = mpsc::unbounded_channel();
    let (closed_tx, _closed_rx) = oneshot::channel();
    let upstream = start_upstream(contacted.clone(), received_tx, closed_tx).await;

    let token = web
        .session_broker()
        .issue(bundle_for(&vm, &server, upstream), Duration::from_secs(60));

    let url = format!(
        "ws://{}/console/{}?token={}&auth={}",
        gateway, "some-other-vm", token, AUTH
    );
    let err = tokio::time::timeout(WAIT, tokio_tungstenite::connect_async(url))
        .await
        .unwrap()
        .expect_err("mismatched vm identity must not upgrade");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => {
            assert_eq!(resp.status().as_u16(), 403);
        }
        other => panic!("expected HTTP rejection, got {:?}", other),
    }
    assert!(!contacted.load(Ordering::SeqCst));

    // Redemption consumed the token; a retry with the right vm fails too.
    let url = format!(
        "ws://{}/console/{}?token={}&auth={}",
        gateway, vm.id, token, AUTH
    );
    assert!(tokio::time::timeout(WAIT, tokio_tungstenite::connect_async(url))
        .await
        .unwrap()
        .is_err());
}

#[tokio::test]
async fn unauthenticated_connection_is_rejected() {
    let db = Database::open_memory().unwrap();
    let (server, vm) = seed_inventory(&db);
    let (gateway, web) = start_gateway(db).await;

    let contacted = Arc::new(AtomicBool::new(false));
    let (received_tx, _received_rx) = mpsc::unbounded_channel();
    let (closed_tx, _closed_rx) = oneshot::channel();
    let upstream = start_upstream(contacted.clone(), received_tx, closed_tx).await;

    let token = web
        .session_broker()
        .issue(bundle_for(&vm, &server, upstream), Duration::from_secs(60));

    let url = format!("ws://{}/console/{}?token={}", gateway, vm.id, token);
    let err = tokio::time::timeout(WAIT, tokio_tungstenite::connect_async(url))
        .await
        .unwrap()
        .expect_err("missing auth must not upgrade");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => {
            assert_eq!(resp.status().as_u16(), 401);
        }
        other => panic!("expected HTTP rejection, got {:?}", other),
    }
    assert!(!contacted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn upstream_disconnect_closes_the_client_side() {
    let db = Database::open_memory().unwrap();
    let (server, vm) = seed_inventory(&db);
    let (gateway, web) = start_gateway(db).await;

    // Upstream that accepts, sends one frame, then closes.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let mut ws = accept_binary(stream).await;
            ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
            ws.close(None).await.unwrap();
        }
    });

    let token = web
        .session_broker()
        .issue(bundle_for(&vm, &server, upstream), Duration::from_secs(60));
    let url = format!(
        "ws://{}/console/{}?token={}&auth={}",
        gateway, vm.id, token, AUTH
    );
    let (mut client, _) = tokio::time::timeout(WAIT, tokio_tungstenite::connect_async(url))
        .await
        .unwrap()
        .unwrap();

    let msg = tokio::time::timeout(WAIT, client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg, Message::Binary(vec![1, 2, 3]));

    // After the upstream goes away the client stream must end too.
    let end = tokio::time::timeout(WAIT, async {
        while let Some(msg) = client.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    })
    .await;
    assert!(end.is_ok(), "client socket must close after upstream drop");
}
