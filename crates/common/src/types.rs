//! Core types for the PVE gateway

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A managed Proxmox VE server and its API token credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PveServer {
    pub id: String,
    pub name: String,
    /// Host or IP of the PVE API endpoint.
    pub host: String,
    /// PVE API port, 8006 by default.
    pub port: u16,
    pub token_id: String,
    pub token_secret: String,
    /// Whether to validate the server's TLS certificate. PVE installs
    /// typically run with a self-signed certificate, so this defaults off.
    pub verify_ssl: bool,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PveServer {
    pub fn new(
        name: String,
        host: String,
        port: u16,
        token_id: String,
        token_secret: String,
        verify_ssl: bool,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            host,
            port,
            token_id,
            token_secret,
            verify_ssl,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// VM power state as reported by PVE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Running,
    Stopped,
    Paused,
    Unknown,
}

impl Default for VmStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Paused => "paused",
            VmStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => VmStatus::Running,
            "stopped" => VmStatus::Stopped,
            "paused" => VmStatus::Paused,
            _ => VmStatus::Unknown,
        }
    }
}

/// A virtual machine registered with the gateway.
///
/// `id` is the gateway's own identity; `vmid` is the numeric id PVE assigned
/// on the hypervisor side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: String,
    pub server_id: String,
    pub vmid: u32,
    pub name: String,
    pub node: String,
    #[serde(default)]
    pub status: VmStatus,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub description: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl VirtualMachine {
    pub fn new(server_id: String, vmid: u32, name: String, node: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            server_id,
            vmid,
            name,
            node,
            status: VmStatus::Unknown,
            cpu_cores: 1,
            memory_mb: 512,
            disk_gb: 10,
            ip_address: String::new(),
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Everything a console relay needs to take over a REST-issued VNC proxy
/// ticket: the upstream endpoint, its credentials and the identity of the
/// machine the ticket was issued for.
///
/// `websocket_url` embeds the short-lived vncticket and must not be surfaced
/// to unauthenticated peers or logged above debug level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleSessionBundle {
    pub websocket_url: String,
    pub ticket: String,
    pub password: Option<String>,
    pub port: u16,
    /// Gateway VM id the ticket was issued for.
    pub vm_id: String,
    /// Hypervisor-assigned numeric id.
    pub vmid: u32,
    pub node: String,
    pub server_id: String,
    pub vm_name: String,
    /// Origin header to present upstream; PVE validates it on some setups.
    pub origin: String,
}
