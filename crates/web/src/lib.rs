//! PVE Console Gateway
//!
//! Axum web service fronting Proxmox VE: a thin inventory REST API,
//! console session issuance, and the noVNC WebSocket relay.

pub mod console_relay;
pub mod pve;
pub mod server;
pub mod session;

pub use pve::PveApiClient;
pub use server::{WebServer, WebServerConfig, WebUiAuth};
pub use session::SessionBroker;
