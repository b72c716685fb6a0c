use std::net::SocketAddr;
use std::time::Duration;

use pvegate_common::Database;
use pvegate_web::server::{WebServer, WebServerConfig, WebUiAuth, DEFAULT_CONSOLE_SESSION_TTL};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let web_addr: SocketAddr = std::env::var("PVEGATE_WEB_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let db_path = std::env::var("PVEGATE_DB_PATH").unwrap_or_else(|_| "pvegate.db".to_string());
    let db = Database::open(&db_path)?;

    let auth = match std::env::var("PVEGATE_WEB_AUTH_TOKEN") {
        Ok(token) if !token.trim().is_empty() => WebUiAuth::Token(token),
        _ => WebUiAuth::DevRandom,
    };

    let console_session_ttl = std::env::var("PVEGATE_CONSOLE_SESSION_TTL")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_CONSOLE_SESSION_TTL);

    let cfg = WebServerConfig {
        auth,
        console_session_ttl,
    };

    info!(
        "Starting PVE gateway on http://{} (db: {})",
        web_addr, db_path
    );

    WebServer::new(db, cfg).serve(web_addr).await
}
