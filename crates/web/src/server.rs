//! Web server implementation

use crate::console_relay;
use crate::pve::PveApiClient;
use crate::session::SessionBroker;
use axum::{
    extract::{
        ws::WebSocketUpgrade,
        Path, Query, Request, State,
    },
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pvegate_common::{ConsoleSessionBundle, Database, Error, PveServer, VirtualMachine, VmStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Default TTL for the issuance-to-redemption handshake window.
pub const DEFAULT_CONSOLE_SESSION_TTL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct WebServerConfig {
    /// Authentication policy for the gateway API.
    pub auth: WebUiAuth,
    /// How long an issued console session token stays redeemable.
    pub console_session_ttl: Duration,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            auth: WebUiAuth::DevRandom,
            console_session_ttl: DEFAULT_CONSOLE_SESSION_TTL,
        }
    }
}

#[derive(Clone, Debug)]
pub enum WebUiAuth {
    /// Require a bearer token (recommended even on localhost).
    Token(String),
    /// Generate a random ephemeral token at startup and print it once.
    DevRandom,
    /// No auth (not recommended).
    None,
}

/// Web server state
#[derive(Clone)]
pub struct WebServer {
    state: Arc<AppState>,
}

pub(crate) struct AppState {
    db: Database,
    broker: SessionBroker,
    console_session_ttl: Duration,
    /// Resolved bearer token; `None` disables auth.
    bearer: Option<String>,
}

impl WebServer {
    pub fn new(db: Database, cfg: WebServerConfig) -> Self {
        let bearer = match &cfg.auth {
            WebUiAuth::Token(t) => Some(t.clone()),
            WebUiAuth::DevRandom => {
                let token = crate::session::generate_token();
                info!("Generated web auth token: {}", token);
                Some(token)
            }
            WebUiAuth::None => None,
        };

        Self {
            state: Arc::new(AppState {
                db,
                broker: SessionBroker::new(),
                console_session_ttl: cfg.console_session_ttl,
                bearer,
            }),
        }
    }

    /// Access the session broker, for embedders that issue console sessions
    /// out of band.
    pub fn session_broker(&self) -> &SessionBroker {
        &self.state.broker
    }

    pub fn router(&self) -> Router {
        let state = self.state.clone();
        let auth_layer = middleware::from_fn(move |req: Request, next: Next| {
            let state = state.clone();
            async move { auth_middleware_inner(state, req, next).await }
        });

        Router::new()
            .route("/api/health", get(health_handler))
            // PVE server inventory
            .route(
                "/api/servers",
                get(list_servers_handler).post(create_server_handler),
            )
            .route(
                "/api/servers/:id",
                get(get_server_handler).delete(delete_server_handler),
            )
            .route(
                "/api/servers/:id/test-connection",
                post(test_connection_handler),
            )
            .route("/api/servers/:id/nodes", get(server_nodes_handler))
            .route(
                "/api/servers/:id/nodes/:node/vms",
                get(server_node_vms_handler),
            )
            // Virtual machine inventory and lifecycle
            .route(
                "/api/virtual-machines",
                get(list_vms_handler).post(create_vm_handler),
            )
            .route(
                "/api/virtual-machines/:id",
                get(get_vm_handler).delete(delete_vm_handler),
            )
            .route("/api/virtual-machines/:id/action", post(vm_action_handler))
            .route(
                "/api/virtual-machines/:id/sync-status",
                post(sync_status_handler),
            )
            // Console session front door
            .route(
                "/api/virtual-machines/:id/console-session",
                post(console_session_handler),
            )
            // noVNC WebSocket relay
            .route("/console/:vm_id", get(console_ws_handler))
            .layer(auth_layer)
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the web server
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        info!("PVE gateway starting on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

async fn auth_middleware_inner(state: Arc<AppState>, req: Request, next: Next) -> Response {
    let path = req.uri().path();

    // Public paths - no authentication required
    let is_public_path = path == "/api/health";

    // WebSocket paths - auth handled at connection time
    let is_websocket_path = path.starts_with("/console/");

    if is_public_path || is_websocket_path {
        return next.run(req).await;
    }

    let Some(expected) = state.bearer.as_deref() else {
        return next.run(req).await;
    };

    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let provided = auth_header.strip_prefix("Bearer ").unwrap_or("");

    if provided.is_empty() {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing bearer token"})),
        )
            .into_response();
    }
    if provided != expected {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid bearer token"})),
        )
            .into_response();
    }

    next.run(req).await
}

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        e if e.is_bad_request() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"detail": err.to_string()}))).into_response()
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "pvegate-web"
    }))
}

/// Server record as exposed over the API. The token secret never leaves the
/// database.
fn server_public(server: &PveServer) -> serde_json::Value {
    json!({
        "id": server.id,
        "name": server.name,
        "host": server.host,
        "port": server.port,
        "token_id": server.token_id,
        "verify_ssl": server.verify_ssl,
        "is_active": server.is_active,
        "created_at": server.created_at,
        "updated_at": server.updated_at,
    })
}

async fn list_servers_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.db.list_servers() {
        Ok(servers) => Json(json!({
            "servers": servers.iter().map(server_public).collect::<Vec<_>>(),
            "count": servers.len(),
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateServerRequest {
    name: String,
    host: String,
    #[serde(default = "default_pve_port")]
    port: u16,
    token_id: String,
    token_secret: String,
    #[serde(default)]
    verify_ssl: bool,
}

fn default_pve_port() -> u16 {
    8006
}

async fn create_server_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateServerRequest>,
) -> Response {
    if req.name.trim().is_empty() || req.host.trim().is_empty() {
        return error_response(Error::InvalidConfig(
            "server name and host are required".to_string(),
        ));
    }
    if req.token_id.trim().is_empty() || req.token_secret.trim().is_empty() {
        return error_response(Error::InvalidConfig(
            "PVE token id and token secret are required".to_string(),
        ));
    }

    let server = PveServer::new(
        req.name,
        req.host,
        req.port,
        req.token_id,
        req.token_secret,
        req.verify_ssl,
    );
    match state.db.insert_server(&server) {
        Ok(()) => (StatusCode::CREATED, Json(server_public(&server))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_server_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match lookup_server(&state, &id) {
        Ok(server) => Json(server_public(&server)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_server_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.db.delete_server(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn test_connection_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let result = async {
        let server = lookup_server(&state, &id)?;
        let client = PveApiClient::for_server(&server)?;
        client.version().await
    }
    .await;

    match result {
        Ok(version) => Json(json!({"status": "ok", "version": version})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn server_nodes_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let result = async {
        let server = lookup_server(&state, &id)?;
        let client = PveApiClient::for_server(&server)?;
        client.nodes().await
    }
    .await;

    match result {
        Ok(nodes) => Json(json!({"nodes": nodes})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn server_node_vms_handler(
    State(state): State<Arc<AppState>>,
    Path((id, node)): Path<(String, String)>,
) -> Response {
    let result = async {
        let server = lookup_server(&state, &id)?;
        let client = PveApiClient::for_server(&server)?;
        client.list_vms(&node).await
    }
    .await;

    match result {
        Ok(vms) => Json(json!({"vms": vms})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_vms_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.db.list_vms() {
        Ok(vms) => Json(json!({"virtual_machines": vms, "count": vms.len()})).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateVmRequest {
    server_id: String,
    vmid: u32,
    name: String,
    node: String,
    cpu_cores: Option<u32>,
    memory_mb: Option<u64>,
    disk_gb: Option<u64>,
    #[serde(default)]
    description: String,
}

async fn create_vm_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateVmRequest>,
) -> Response {
    let result: pvegate_common::Result<VirtualMachine> = (|| {
        // The VM must reference a known server record.
        lookup_server(&state, &req.server_id)?;

        let mut vm = VirtualMachine::new(req.server_id, req.vmid, req.name, req.node);
        if let Some(cpu_cores) = req.cpu_cores {
            vm.cpu_cores = cpu_cores;
        }
        if let Some(memory_mb) = req.memory_mb {
            vm.memory_mb = memory_mb;
        }
        if let Some(disk_gb) = req.disk_gb {
            vm.disk_gb = disk_gb;
        }
        vm.description = req.description;
        state.db.insert_vm(&vm)?;
        Ok(vm)
    })();

    match result {
        Ok(vm) => (StatusCode::CREATED, Json(vm)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_vm_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match lookup_vm(&state, &id) {
        Ok(vm) => Json(vm).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_vm_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.db.delete_vm(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct VmActionRequest {
    action: String,
}

async fn vm_action_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<VmActionRequest>,
) -> Response {
    let result = async {
        let vm = lookup_vm(&state, &id)?;
        let server = lookup_server(&state, &vm.server_id)?;
        let client = PveApiClient::for_server(&server)?;

        let upid = match req.action.as_str() {
            "start" => client.start_vm(&vm.node, vm.vmid).await?,
            "stop" => client.stop_vm(&vm.node, vm.vmid).await?,
            "shutdown" => client.shutdown_vm(&vm.node, vm.vmid).await?,
            "reboot" => client.reboot_vm(&vm.node, vm.vmid).await?,
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unsupported action: {}",
                    other
                )))
            }
        };
        Ok((req.action, upid))
    }
    .await;

    match result {
        Ok((action, upid)) => Json(json!({"action": action, "upid": upid})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn sync_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let result = async {
        let vm = lookup_vm(&state, &id)?;
        let server = lookup_server(&state, &vm.server_id)?;
        let client = PveApiClient::for_server(&server)?;

        let status_value = client.vm_status(&vm.node, vm.vmid).await?;
        let status = status_value
            .get("status")
            .and_then(|s| s.as_str())
            .map(VmStatus::parse)
            .unwrap_or(VmStatus::Unknown);

        state.db.update_vm_status(&vm.id, status)?;
        lookup_vm(&state, &id)
    }
    .await;

    match result {
        Ok(vm) => Json(vm).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Console session front door and relay endpoint
// ============================================================================

#[derive(Debug, Deserialize)]
struct ConsoleSessionRequest {
    #[serde(rename = "type", default = "default_session_type")]
    session_type: String,
}

fn default_session_type() -> String {
    "novnc".to_string()
}

/// What the front door hands back to the browser. The upstream URL and its
/// embedded vncticket stay server-side; the browser only learns the
/// relay-facing path and its one-shot token.
#[derive(Debug, Serialize)]
pub struct ConsoleSessionIssued {
    pub session_token: String,
    pub proxy_path: String,
    pub password: Option<String>,
    pub port: u16,
    pub node: String,
    pub vmid: u32,
    pub ttl_seconds: u64,
}

/// Create a VNC proxy ticket on PVE and bind it to a single-use relay token.
///
/// Nothing is stored until the hypervisor call succeeds, so a failed request
/// never leaves a dangling token behind.
pub async fn issue_console_session(
    client: &PveApiClient,
    vm: &VirtualMachine,
    server: &PveServer,
    broker: &SessionBroker,
    ttl: Duration,
) -> pvegate_common::Result<ConsoleSessionIssued> {
    let proxy = client.create_vnc_proxy(&vm.node, vm.vmid, true).await?;

    let encoded_ticket = urlencoding::encode(&proxy.ticket);
    let websocket_url = format!(
        "wss://{}:{}/api2/json/nodes/{}/qemu/{}/vncwebsocket?port={}&vncticket={}",
        server.host, server.port, vm.node, vm.vmid, proxy.port, encoded_ticket
    );

    let bundle = ConsoleSessionBundle {
        websocket_url,
        ticket: proxy.ticket,
        password: proxy.password.clone(),
        port: proxy.port,
        vm_id: vm.id.clone(),
        vmid: vm.vmid,
        node: vm.node.clone(),
        server_id: server.id.clone(),
        vm_name: vm.name.clone(),
        origin: format!("https://{}:{}", server.host, server.port),
    };

    let token = broker.issue(bundle, ttl);
    let proxy_path = format!("/console/{}?token={}", vm.id, token);

    info!(
        "Issued console session for vm {} (vmid {} on {})",
        vm.id, vm.vmid, vm.node
    );

    Ok(ConsoleSessionIssued {
        session_token: token,
        proxy_path,
        password: proxy.password,
        port: proxy.port,
        node: vm.node.clone(),
        vmid: vm.vmid,
        ttl_seconds: ttl.as_secs(),
    })
}

async fn console_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ConsoleSessionRequest>,
) -> Response {
    if req.session_type != "novnc" {
        return error_response(Error::InvalidConfig(
            "only novnc console sessions are supported".to_string(),
        ));
    }

    let result = async {
        let vm = lookup_vm(&state, &id)?;
        let server = lookup_server(&state, &vm.server_id)?;
        let client = PveApiClient::for_server(&server)?;
        issue_console_session(&client, &vm, &server, &state.broker, state.console_session_ttl)
            .await
    }
    .await;

    match result {
        Ok(issued) => {
            let proxy_url = format!(
                "{}://{}{}",
                relay_scheme(&headers),
                request_host(&headers),
                issued.proxy_path
            );
            let mut body = serde_json::to_value(&issued).unwrap_or_default();
            if let Some(obj) = body.as_object_mut() {
                obj.insert("proxy_url".to_string(), json!(proxy_url));
            }
            Json(body).into_response()
        }
        Err(e) => {
            error!("Failed to create console session for vm {}: {}", id, e);
            error_response(e)
        }
    }
}

fn relay_scheme(headers: &HeaderMap) -> &'static str {
    let forwarded = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if forwarded.eq_ignore_ascii_case("https") {
        "wss"
    } else {
        "ws"
    }
}

fn request_host(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string()
}

#[derive(Debug, Deserialize)]
struct ConsoleQuery {
    token: Option<String>,
    /// Bearer credential; browsers cannot attach headers to an upgrade
    /// request, so it rides in the query string.
    auth: Option<String>,
}

/// The relay endpoint. Everything up to and including the upstream dial
/// happens before the upgrade is accepted: a browser that presents a bad
/// token or hits an unreachable hypervisor gets an HTTP error, never a
/// WebSocket that dies immediately after connecting.
async fn console_ws_handler(
    State(state): State<Arc<AppState>>,
    Path(vm_id): Path<String>,
    Query(query): Query<ConsoleQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(expected) = state.bearer.as_deref() {
        if query.auth.as_deref() != Some(expected) {
            warn!("Console websocket: unauthenticated connection rejected");
            return (StatusCode::UNAUTHORIZED, "authentication required").into_response();
        }
    }

    let Some(token) = query.token else {
        warn!("Console websocket: missing session token");
        return (StatusCode::BAD_REQUEST, "missing session token").into_response();
    };

    let bundle = match redeem_and_validate(&state, &vm_id, &token) {
        Ok(bundle) => bundle,
        Err(e) => {
            // Details stay server-side; the peer only learns the session is bad.
            warn!("Console websocket rejected for vm {}: {}", vm_id, e);
            return (StatusCode::FORBIDDEN, "invalid console session").into_response();
        }
    };

    let server = state.db.get_server(&bundle.server_id).ok().flatten();

    let upstream = match console_relay::connect_upstream(&bundle, server.as_ref()).await {
        Ok(socket) => socket,
        Err(e) => {
            error!(
                "Console websocket: upstream dial failed for vm {}: {}",
                vm_id, e
            );
            return (StatusCode::BAD_GATEWAY, "failed to reach console upstream").into_response();
        }
    };

    ws.protocols(["binary"])
        .on_upgrade(move |socket| console_relay::run(socket, upstream))
}

/// Redeem the session token and cross-check the bundle against the route's
/// VM identity. Redemption happens first, so a token burned on the wrong
/// route cannot be replayed on the right one.
fn redeem_and_validate(
    state: &AppState,
    vm_id: &str,
    token: &str,
) -> pvegate_common::Result<ConsoleSessionBundle> {
    let bundle = state.broker.redeem(token).ok_or(Error::SessionExpired)?;
    if bundle.vm_id != vm_id {
        return Err(Error::IdentityMismatch);
    }
    Ok(bundle)
}

fn lookup_server(state: &AppState, id: &str) -> pvegate_common::Result<PveServer> {
    state.db.get_server(id)?.ok_or_else(|| Error::NotFound {
        kind: "server".to_string(),
        id: id.to_string(),
    })
}

fn lookup_vm(state: &AppState, id: &str) -> pvegate_common::Result<VirtualMachine> {
    state.db.get_vm(id)?.ok_or_else(|| Error::NotFound {
        kind: "virtual machine".to_string(),
        id: id.to_string(),
    })
}
