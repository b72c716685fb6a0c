//! Proxmox VE API client
//!
//! Wraps the PVE JSON REST API: token-based auth header construction,
//! request dispatch with a fixed timeout, and normalization of PVE's
//! `{"errors": ...}` / `{"message": ...}` error envelope. Successful
//! responses arrive wrapped as `{"data": ...}`; the client unwraps them.

use pvegate_common::{Error, PveServer, Result};
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// VNC proxy ticket as returned by `POST .../vncproxy`.
#[derive(Debug, Clone)]
pub struct VncProxy {
    pub port: u16,
    pub ticket: String,
    pub password: Option<String>,
    pub cert: Option<String>,
}

/// Client for one PVE server's REST API.
pub struct PveApiClient {
    base_url: String,
    auth_header: String,
    client: reqwest::Client,
}

impl PveApiClient {
    /// Build a client for `https://{host}:{port}/api2/json`.
    ///
    /// When `verify_ssl` is false the client still negotiates TLS but skips
    /// certificate and hostname validation; PVE installs commonly run with
    /// self-signed certificates and this is an operator-level trust decision.
    pub fn new(
        host: &str,
        port: u16,
        token_id: &str,
        token_secret: &str,
        verify_ssl: bool,
    ) -> Result<Self> {
        Self::with_base_url(
            format!("https://{}:{}/api2/json", host, port),
            token_id,
            token_secret,
            verify_ssl,
        )
    }

    /// Build a client for a PVE server inventory record.
    pub fn for_server(server: &PveServer) -> Result<Self> {
        Self::new(
            &server.host,
            server.port,
            &server.token_id,
            &server.token_secret,
            server.verify_ssl,
        )
    }

    /// Build a client against an explicit API base URL. Production callers go
    /// through [`PveApiClient::new`]; this exists for plain-HTTP mock servers.
    pub fn with_base_url(
        base_url: String,
        token_id: &str,
        token_secret: &str,
        verify_ssl: bool,
    ) -> Result<Self> {
        if token_id.is_empty() || token_secret.is_empty() {
            return Err(Error::InvalidConfig(
                "PVE token id and token secret are required".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!verify_ssl)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header: format!("PVEAPIToken={}={}", token_id, token_secret),
            client,
        })
    }

    /// Issue a request and unwrap the PVE response envelope.
    ///
    /// `params` become URL query parameters, `body` the JSON request body;
    /// both must be flat JSON objects.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: Option<&Value>,
        body: Option<&Value>,
    ) -> Result<Value> {
        let url = if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        };

        let mut req = self
            .client
            .request(method.clone(), url.as_str())
            .header("Authorization", &self.auth_header);
        if let Some(params) = params {
            req = req.query(params);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await.map_err(|e| {
            error!("PVE API request failed: {} {}: {}", method, url, e);
            Error::Transport(e.to_string())
        })?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let text = response.text().await.unwrap_or_default();
            let message = extract_error_message(status.as_u16(), &text);
            error!("PVE API error: {} {} -> {}: {}", method, url, status, message);
            return Err(Error::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("invalid JSON from PVE: {}", e)))?;

        debug!("PVE API: {} {} -> {}", method, url, status);

        // PVE wraps real payloads as {"data": ...}
        match value {
            Value::Object(mut map) if map.contains_key("data") => {
                Ok(map.remove("data").unwrap_or(Value::Null))
            }
            other => Ok(other),
        }
    }

    pub async fn version(&self) -> Result<Value> {
        self.request(Method::GET, "/version", None, None).await
    }

    pub async fn nodes(&self) -> Result<Value> {
        self.request(Method::GET, "/nodes", None, None).await
    }

    pub async fn node_status(&self, node: &str) -> Result<Value> {
        self.request(Method::GET, &format!("/nodes/{}/status", node), None, None)
            .await
    }

    pub async fn list_vms(&self, node: &str) -> Result<Value> {
        self.request(Method::GET, &format!("/nodes/{}/qemu", node), None, None)
            .await
    }

    pub async fn vm_status(&self, node: &str, vmid: u32) -> Result<Value> {
        self.request(
            Method::GET,
            &format!("/nodes/{}/qemu/{}/status/current", node, vmid),
            None,
            None,
        )
        .await
    }

    pub async fn vm_config(&self, node: &str, vmid: u32) -> Result<Value> {
        self.request(
            Method::GET,
            &format!("/nodes/{}/qemu/{}/config", node, vmid),
            None,
            None,
        )
        .await
    }

    /// Start a VM. Returns the UPID of the spawned PVE task.
    pub async fn start_vm(&self, node: &str, vmid: u32) -> Result<Value> {
        self.request(
            Method::POST,
            &format!("/nodes/{}/qemu/{}/status/start", node, vmid),
            None,
            None,
        )
        .await
    }

    /// Hard-stop a VM. Returns a UPID.
    pub async fn stop_vm(&self, node: &str, vmid: u32) -> Result<Value> {
        self.request(
            Method::POST,
            &format!("/nodes/{}/qemu/{}/status/stop", node, vmid),
            None,
            None,
        )
        .await
    }

    /// Graceful guest shutdown. Returns a UPID.
    pub async fn shutdown_vm(&self, node: &str, vmid: u32) -> Result<Value> {
        self.request(
            Method::POST,
            &format!("/nodes/{}/qemu/{}/status/shutdown", node, vmid),
            None,
            None,
        )
        .await
    }

    /// Reboot the guest. Returns a UPID.
    pub async fn reboot_vm(&self, node: &str, vmid: u32) -> Result<Value> {
        self.request(
            Method::POST,
            &format!("/nodes/{}/qemu/{}/status/reboot", node, vmid),
            None,
            None,
        )
        .await
    }

    pub async fn delete_vm(&self, node: &str, vmid: u32) -> Result<Value> {
        self.request(
            Method::DELETE,
            &format!("/nodes/{}/qemu/{}", node, vmid),
            None,
            None,
        )
        .await
    }

    pub async fn task_status(&self, node: &str, upid: &str) -> Result<Value> {
        self.request(
            Method::GET,
            &format!("/nodes/{}/tasks/{}/status", node, upid),
            None,
            None,
        )
        .await
    }

    pub async fn next_vmid(&self) -> Result<u32> {
        let value = self
            .request(Method::GET, "/cluster/nextid", None, None)
            .await?;
        value_to_u32(&value).ok_or_else(|| Error::Upstream {
            status: 200,
            message: format!("unexpected nextid response: {}", value),
        })
    }

    /// Create a VNC proxy ticket for a VM. With `websocket` set, the ticket
    /// is valid for the `vncwebsocket` endpoint the console relay dials.
    pub async fn create_vnc_proxy(&self, node: &str, vmid: u32, websocket: bool) -> Result<VncProxy> {
        let params = serde_json::json!({ "websocket": if websocket { 1 } else { 0 } });
        let value = self
            .request(
                Method::POST,
                &format!("/nodes/{}/qemu/{}/vncproxy", node, vmid),
                Some(&params),
                None,
            )
            .await?;

        // PVE returns the port as either a JSON number or a string.
        let port = value.get("port").and_then(value_to_u16);
        let ticket = value
            .get("ticket")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        match (port, ticket) {
            (Some(port), Some(ticket)) if !ticket.is_empty() => Ok(VncProxy {
                port,
                ticket,
                password: value
                    .get("password")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                cert: value
                    .get("cert")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            }),
            _ => Err(Error::Upstream {
                status: 200,
                message: "vncproxy response missing port or ticket".to_string(),
            }),
        }
    }
}

fn value_to_u16(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_to_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Flatten PVE's error envelope into a readable message.
///
/// Known shapes: `{"errors": {"param": "msg"}}`, `{"errors": {"param":
/// {"message": "msg"}}}`, `{"message": "msg"}`. Anything else falls back to
/// the raw body, or the bare status code when the body is empty.
fn extract_error_message(status: u16, body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();

    if let Some(value) = parsed {
        if let Some(errors) = value.get("errors") {
            if let Some(map) = errors.as_object() {
                let mut parts: Vec<String> = Vec::new();
                for (key, v) in map {
                    let msg = match v {
                        Value::String(s) => s.clone(),
                        Value::Object(o) => o
                            .get("message")
                            .and_then(|m| m.as_str())
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| v.to_string()),
                        other => other.to_string(),
                    };
                    parts.push(format!("{}: {}", key, msg));
                }
                if !parts.is_empty() {
                    return parts.join("; ");
                }
            }
            return errors.to_string();
        }
        if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
            if !message.is_empty() {
                return message.to_string();
            }
        }
    }

    if body.trim().is_empty() {
        format!("HTTP {}", status)
    } else {
        body.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_rejected() {
        assert!(matches!(
            PveApiClient::new("pve.local", 8006, "", "secret", false),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            PveApiClient::new("pve.local", 8006, "root@pam!gw", "", false),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn auth_header_uses_pve_token_scheme() {
        let client = PveApiClient::new("pve.local", 8006, "root@pam!gw", "s3cr3t", false).unwrap();
        assert_eq!(client.auth_header, "PVEAPIToken=root@pam!gw=s3cr3t");
        assert_eq!(client.base_url, "https://pve.local:8006/api2/json");
    }

    #[test]
    fn error_envelope_with_string_errors() {
        let msg = extract_error_message(500, r#"{"errors":{"vmid":"already exists"}}"#);
        assert_eq!(msg, "vmid: already exists");
    }

    #[test]
    fn error_envelope_with_nested_message() {
        let msg = extract_error_message(
            400,
            r#"{"errors":{"node":{"message":"no such node"},"port":"out of range"}}"#,
        );
        assert!(msg.contains("node: no such node"));
        assert!(msg.contains("port: out of range"));
    }

    #[test]
    fn error_envelope_with_top_level_message() {
        let msg = extract_error_message(403, r#"{"message":"permission denied"}"#);
        assert_eq!(msg, "permission denied");
    }

    #[test]
    fn error_envelope_falls_back_to_raw_body() {
        assert_eq!(extract_error_message(500, "boom"), "boom");
        assert_eq!(extract_error_message(500, ""), "HTTP 500");
    }

    #[test]
    fn port_values_accept_string_and_number() {
        assert_eq!(value_to_u16(&serde_json::json!(5900)), Some(5900));
        assert_eq!(value_to_u16(&serde_json::json!("5900")), Some(5900));
        assert_eq!(value_to_u16(&serde_json::json!(70000)), None);
        assert_eq!(value_to_u16(&serde_json::json!(null)), None);
    }
}
