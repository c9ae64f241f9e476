//! Live-session registry: per-server fan-out and the per-IP connection
//! counter.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::websocket_models::OutboundEvent;

/// Hard cap on inbound and outbound frame payloads.
pub const PAYLOAD_CAP: usize = 50 * 1024;

/// Emissions allowed per broadcast invocation; bounds tail amplification
/// when one server has many watchers.
const BROADCAST_CAP: usize = 10;

pub type SocketSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// One authenticated (or authenticating) client connection.
pub struct SessionHandle {
    pub id: Uuid,
    pub server_id: String,
    sender: SocketSink,
    authenticated: AtomicBool,
    open: AtomicBool,
    last_heartbeat_ms: AtomicI64,
}

impl SessionHandle {
    pub fn new(server_id: String, sender: SocketSink) -> Arc<Self> {
        Arc::new(SessionHandle {
            id: Uuid::new_v4(),
            server_id,
            sender,
            authenticated: AtomicBool::new(false),
            open: AtomicBool::new(true),
            last_heartbeat_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        })
    }

    pub fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::Relaxed);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Every inbound message, ping frame, or heartbeat event refreshes this.
    pub fn touch_heartbeat(&self) {
        self.last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_heartbeat_ms(&self) -> i64 {
        self.last_heartbeat_ms.load(Ordering::Relaxed)
    }

    /// Sends one event frame. Oversized payloads are dropped and replaced by
    /// an error frame. Returns false once the socket is no longer writable.
    pub async fn send(&self, event: &OutboundEvent) -> bool {
        if !self.is_open() {
            return false;
        }
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!(session = %self.id, error = %e, "Failed to serialize outbound frame.");
                return false;
            }
        };
        if json.len() > PAYLOAD_CAP {
            warn!(
                session = %self.id,
                bytes = json.len(),
                "Dropping oversized outbound frame."
            );
            let error = OutboundEvent::Error {
                message: "payload too large".to_string(),
            };
            let json = serde_json::to_string(&error).unwrap_or_default();
            return self.send_text(json).await;
        }
        self.send_text(json).await
    }

    async fn send_text(&self, json: String) -> bool {
        let mut sender = self.sender.lock().await;
        if sender.send(Message::Text(Utf8Bytes::from(json))).await.is_err() {
            self.open.store(false, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Closes the socket with a status code; further sends become no-ops.
    pub async fn close(&self, code: u16, reason: &str) {
        if !self.open.swap(false, Ordering::Relaxed) {
            return;
        }
        let mut sender = self.sender.lock().await;
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: Utf8Bytes::from(reason.to_string()),
            })))
            .await;
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Relaxed);
    }
}

/// Owner of all live sessions and the per-IP accept counter.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, Arc<SessionHandle>>>,
    ip_counts: Arc<DashMap<IpAddr, usize>>,
    max_per_ip: Option<usize>,
}

impl SessionRegistry {
    pub fn new(max_per_ip: Option<usize>) -> Self {
        SessionRegistry {
            sessions: Arc::new(DashMap::new()),
            ip_counts: Arc::new(DashMap::new()),
            max_per_ip,
        }
    }

    pub fn register(&self, handle: Arc<SessionHandle>) {
        debug!(session = %handle.id, server_id = %handle.server_id, "Session registered.");
        self.sessions.insert(handle.id, handle);
    }

    pub fn unregister(&self, id: &Uuid) {
        if self.sessions.remove(id).is_some() {
            debug!(session = %id, "Session unregistered.");
        }
    }

    /// Sends to every authenticated session of one server, capped per
    /// invocation; over-cap recipients are skipped.
    pub async fn broadcast(&self, server_id: &str, event: &OutboundEvent) {
        let targets: Vec<Arc<SessionHandle>> = self
            .sessions
            .iter()
            .filter(|entry| entry.server_id == server_id && entry.is_authenticated())
            .map(|entry| entry.value().clone())
            .collect();

        let skipped = targets.len().saturating_sub(BROADCAST_CAP);
        if skipped > 0 {
            warn!(
                server_id = %server_id,
                skipped,
                "Broadcast recipient cap reached; skipping remainder."
            );
        }
        for handle in targets.into_iter().take(BROADCAST_CAP) {
            handle.send(event).await;
        }
    }

    /// Counts a new connection from `ip`. False when the configured per-IP
    /// bound is already reached.
    pub fn try_acquire_ip(&self, ip: IpAddr) -> bool {
        let mut count = self.ip_counts.entry(ip).or_insert(0);
        if let Some(max) = self.max_per_ip {
            if *count >= max {
                return false;
            }
        }
        *count += 1;
        true
    }

    pub fn release_ip(&self, ip: IpAddr) {
        if let Some(mut count) = self.ip_counts.get_mut(&ip) {
            *count = count.saturating_sub(1);
        }
        self.ip_counts.remove_if(&ip, |_, count| *count == 0);
    }

    #[cfg(test)]
    pub fn ip_count(&self, ip: IpAddr) -> usize {
        self.ip_counts.get(&ip).map(|c| *c).unwrap_or(0)
    }
}
