//! noVNC console WebSocket relay
//!
//! Bridges an authenticated browser WebSocket to PVE's `vncwebsocket`
//! endpoint. Frames are relayed opaquely in both directions; the relay never
//! parses VNC traffic. The upstream leg is dialed before the inbound upgrade
//! is accepted, so the browser only ever sees a live session.

use axum::extract::ws::{Message as ClientMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use pvegate_common::{ConsoleSessionBundle, Error, PveServer, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as UpstreamRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{
    connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Build the upgrade request for the upstream vncwebsocket endpoint.
///
/// The Authorization header carries the *server record's* static API token —
/// PVE trusts the gateway's service identity here, not the end user.
fn build_upstream_request(
    bundle: &ConsoleSessionBundle,
    server: Option<&PveServer>,
) -> Result<UpstreamRequest> {
    let mut request = bundle
        .websocket_url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Transport(format!("invalid upstream URL: {}", e)))?;

    let headers = request.headers_mut();
    if !bundle.origin.is_empty() {
        let origin = HeaderValue::from_str(&bundle.origin)
            .map_err(|e| Error::Transport(format!("invalid origin header: {}", e)))?;
        headers.insert("Origin", origin);
    }
    if let Some(server) = server {
        if !server.token_id.is_empty() && !server.token_secret.is_empty() {
            let auth = format!("PVEAPIToken={}={}", server.token_id, server.token_secret);
            let auth = HeaderValue::from_str(&auth)
                .map_err(|e| Error::Transport(format!("invalid auth header: {}", e)))?;
            headers.insert("Authorization", auth);
        }
    }
    headers.insert("Sec-WebSocket-Protocol", HeaderValue::from_static("binary"));

    Ok(request)
}

/// Dial the upstream VNC WebSocket named in the session bundle.
///
/// TLS is always negotiated but never validated: PVE runs self-signed
/// certificates and the vncticket in the URL is the actual credential.
/// Connection failures are terminal; the caller rejects the inbound upgrade
/// and the browser must request a fresh session.
pub async fn connect_upstream(
    bundle: &ConsoleSessionBundle,
    server: Option<&PveServer>,
) -> Result<UpstreamSocket> {
    let request = build_upstream_request(bundle, server)?;

    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| Error::Internal(format!("failed to build TLS connector: {}", e)))?;

    let (socket, response) =
        connect_async_tls_with_config(request, None, false, Some(Connector::NativeTls(tls)))
            .await
            .map_err(|e| Error::Transport(format!("upstream VNC connect failed: {}", e)))?;

    debug!(
        "Connected to upstream VNC websocket for vmid {} ({})",
        bundle.vmid,
        response.status()
    );
    Ok(socket)
}

/// Pump frames between the browser and the upstream socket until either side
/// goes away, then tear both legs down.
///
/// The upstream→client direction runs as a spawned task; the client→upstream
/// direction runs here, driven by the inbound receive loop. Teardown cancels
/// the pump task first, then closes the other socket, tolerating errors from
/// a peer that is already gone.
pub async fn run(client: WebSocket, upstream: UpstreamSocket) {
    let (mut upstream_sink, mut upstream_stream) = upstream.split();
    let (mut client_sink, mut client_stream) = client.split();

    let pump = tokio::spawn(async move {
        while let Some(msg) = upstream_stream.next().await {
            let forward = match msg {
                Ok(UpstreamMessage::Binary(data)) => ClientMessage::Binary(data),
                Ok(UpstreamMessage::Text(text)) => ClientMessage::Text(text),
                Ok(UpstreamMessage::Ping(data)) => ClientMessage::Ping(data),
                Ok(UpstreamMessage::Pong(data)) => ClientMessage::Pong(data),
                Ok(UpstreamMessage::Close(_)) => {
                    debug!("Upstream VNC websocket closed");
                    break;
                }
                Ok(UpstreamMessage::Frame(_)) => continue,
                Err(e) => {
                    debug!("Upstream VNC websocket error: {}", e);
                    break;
                }
            };
            if client_sink.send(forward).await.is_err() {
                break;
            }
        }
        let _ = client_sink.close().await;
    });

    while let Some(msg) = client_stream.next().await {
        let forward = match msg {
            Ok(ClientMessage::Binary(data)) => UpstreamMessage::Binary(data),
            Ok(ClientMessage::Text(text)) => UpstreamMessage::Text(text),
            Ok(ClientMessage::Ping(data)) => UpstreamMessage::Ping(data),
            Ok(ClientMessage::Pong(data)) => UpstreamMessage::Pong(data),
            Ok(ClientMessage::Close(_)) => {
                debug!("Client websocket closed");
                break;
            }
            Err(e) => {
                warn!("Client websocket error: {}", e);
                break;
            }
        };
        if upstream_sink.send(forward).await.is_err() {
            break;
        }
    }

    // Client leg is done: cancel the pump, then close the upstream socket.
    pump.abort();
    let _ = pump.await;
    let _ = upstream_sink.close().await;
    debug!("Console relay session ended");
}
