//! Console session broker
//!
//! Binds a REST-issued VNC proxy ticket to a single future WebSocket
//! redemption: opaque single-use tokens with a short TTL over a shared
//! in-memory expiring store.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use parking_lot::Mutex;
use pvegate_common::ConsoleSessionBundle;
use rand::RngCore;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

struct Entry {
    bundle: ConsoleSessionBundle,
    expires_at: Instant,
}

/// Issues and redeems single-use console session tokens.
///
/// Redemption is get-and-delete under one lock, so a token can never open
/// more than one relay session. Expired entries count as absent and are
/// swept opportunistically; there is no background reaper.
#[derive(Default)]
pub struct SessionBroker {
    entries: Mutex<HashMap<String, Entry>>,
}

impl SessionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bundle` under a fresh random token valid for `ttl`.
    pub fn issue(&self, bundle: ConsoleSessionBundle, ttl: Duration) -> String {
        let expires_at = Instant::now() + ttl;
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.expires_at > Instant::now());

        loop {
            let token = generate_token();
            // Collisions are astronomically unlikely; never overwrite one.
            if entries.contains_key(&token) {
                continue;
            }
            entries.insert(
                token.clone(),
                Entry {
                    bundle: bundle.clone(),
                    expires_at,
                },
            );
            debug!("Issued console session token (ttl {:?})", ttl);
            return token;
        }
    }

    /// Number of unredeemed, unexpired sessions currently held.
    pub fn pending_sessions(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    /// Atomically fetch and delete the bundle for `token`.
    ///
    /// Returns `None` for unknown, expired or already-redeemed tokens; the
    /// relay must treat all three as an invalid session and close.
    pub fn redeem(&self, token: &str) -> Option<ConsoleSessionBundle> {
        let entry = self.entries.lock().remove(token)?;
        if entry.expires_at <= Instant::now() {
            debug!("Console session token expired before redemption");
            return None;
        }
        Some(entry.bundle)
    }
}

/// 32 bytes from the OS RNG, URL-safe base64 — 256 bits of entropy that can
/// ride in a query string unescaped.
pub(crate) fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
