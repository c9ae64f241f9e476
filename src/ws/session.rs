//! Per-client live session: authentication, inbound dispatch, the log
//! attacher, and the stats sampler.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::db::services;
use crate::lifecycle::ServerManager;
use crate::models::PowerAction;
use crate::websocket_models::{InboundEvent, OutboundEvent, StatsPayload};
use crate::ws::log_stream::{brand_rewrite, demultiplex, BurstGuard, LineAssembler};
use crate::ws::registry::{SessionHandle, PAYLOAD_CAP};
use crate::ws::stats::{extract_sample, StatsTracker};

/// Close codes for the live socket.
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_INTERNAL: u16 = 1011;
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

const AUTH_DEADLINE: Duration = Duration::from_secs(5);
const REATTACH_DELAY: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(2);
const RING_TAIL_ON_AUTH: usize = 10;

/// Strips any character outside `[A-Za-z0-9_-]` from a client-supplied
/// server id.
pub fn sanitize_server_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Keeps printable ASCII, drops quote characters, trims. An empty result is
/// a no-op command.
pub fn sanitize_command(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control() && *c != '"' && *c != '\'')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Drives one client connection to completion. The caller has already
/// accounted the connection against the per-IP bound.
pub async fn run_session(
    socket: WebSocket,
    manager: Arc<ServerManager>,
    raw_server_id: String,
    token: String,
    peer_ip: Option<IpAddr>,
) {
    let server_id = sanitize_server_id(&raw_server_id);
    let (sender, mut receiver) = socket.split();
    let handle = SessionHandle::new(server_id.clone(), Arc::new(Mutex::new(sender)));
    manager.sessions.register(handle.clone());

    let attacher: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
    let mut sampler: Option<JoinHandle<()>> = None;

    let auth = timeout(
        AUTH_DEADLINE,
        authenticate(&manager, &handle, &server_id, &token),
    )
    .await;
    match auth {
        Ok(Ok(())) => {
            handle.mark_authenticated();
            info!(session = %handle.id, server_id = %server_id, "Session authenticated.");

            *attacher.lock().await = Some(spawn_attacher(manager.clone(), handle.clone()));
            sampler = Some(spawn_sampler(manager.clone(), handle.clone()));

            // Inbound loop. The reader owns the heartbeat clock.
            while let Some(message) = receiver.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(session = %handle.id, error = %e, "Socket read error.");
                        break;
                    }
                };
                handle.touch_heartbeat();
                match message {
                    Message::Text(text) => {
                        handle_frame(&manager, &handle, &attacher, text.as_str()).await;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Binary(_) => {
                        handle
                            .send(&OutboundEvent::Error {
                                message: "binary frames are not supported".to_string(),
                            })
                            .await;
                    }
                    Message::Close(_) => break,
                }
            }
        }
        Ok(Err(close_code)) => {
            handle.close(close_code, "authentication failed").await;
        }
        Err(_) => {
            warn!(session = %handle.id, server_id = %server_id, "Authentication deadline expired.");
            handle.close(CLOSE_TRY_AGAIN_LATER, "authentication timeout").await;
        }
    }

    // Teardown: cancel the session's background activities promptly.
    handle.mark_closed();
    if let Some(task) = attacher.lock().await.take() {
        task.abort();
    }
    if let Some(task) = sampler {
        task.abort();
    }
    manager.sessions.unregister(&handle.id);
    if let Some(ip) = peer_ip {
        manager.sessions.release_ip(ip);
    }
    info!(session = %handle.id, server_id = %server_id, "Session closed.");
}

/// Validates the token (cache first, panel on miss) and primes the client
/// with the ring tail, an initial stats frame, and `auth_success`.
async fn authenticate(
    manager: &Arc<ServerManager>,
    handle: &Arc<SessionHandle>,
    server_id: &str,
    token: &str,
) -> Result<(), u16> {
    if server_id.is_empty() || token.is_empty() {
        return Err(CLOSE_POLICY_VIOLATION);
    }

    let verdict = match manager.validation.get(server_id, token).await {
        Some(verdict) => verdict,
        None => {
            let verdict = manager.panel.validate(server_id, token).await;
            if verdict {
                manager.validation.insert(server_id, token, true).await;
            }
            verdict
        }
    };
    if !verdict {
        return Err(CLOSE_POLICY_VIOLATION);
    }

    let record = services::get_server(&manager.db, server_id)
        .await
        .ok()
        .flatten()
        .ok_or(CLOSE_POLICY_VIOLATION)?;
    if record.docker_id.is_none() {
        return Err(CLOSE_INTERNAL);
    }

    for line in manager.rings.tail(server_id, RING_TAIL_ON_AUTH) {
        handle
            .send(&OutboundEvent::ConsoleOutput { message: line })
            .await;
    }

    let mut tracker = StatsTracker::new();
    let stats = build_stats_frame(manager, server_id, &mut tracker).await;
    handle.send(&OutboundEvent::Stats(stats)).await;

    handle
        .send(&OutboundEvent::AuthSuccess {
            state: record.state.clone(),
        })
        .await;
    Ok(())
}

async fn handle_frame(
    manager: &Arc<ServerManager>,
    handle: &Arc<SessionHandle>,
    attacher: &Arc<Mutex<Option<JoinHandle<()>>>>,
    text: &str,
) {
    if text.len() > PAYLOAD_CAP {
        handle
            .send(&OutboundEvent::Error {
                message: "payload too large".to_string(),
            })
            .await;
        return;
    }
    let event: InboundEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(_) => {
            handle
                .send(&OutboundEvent::Error {
                    message: "malformed frame".to_string(),
                })
                .await;
            return;
        }
    };

    match event {
        InboundEvent::Heartbeat => {
            handle.send(&OutboundEvent::HeartbeatAck).await;
        }
        InboundEvent::SendCommand(raw) => {
            let command = sanitize_command(&raw);
            if command.is_empty() {
                return;
            }
            let docker_id = services::get_server(&manager.db, &handle.server_id)
                .await
                .ok()
                .flatten()
                .and_then(|record| record.docker_id);
            let Some(docker_id) = docker_id else {
                handle
                    .send(&OutboundEvent::Error {
                        message: "server has no container".to_string(),
                    })
                    .await;
                return;
            };
            if let Err(e) = manager.gateway.write_stdin(&docker_id, &command).await {
                warn!(session = %handle.id, error = %e, "Command forward failed.");
                handle
                    .send(&OutboundEvent::Error {
                        message: "failed to send command".to_string(),
                    })
                    .await;
            }
        }
        InboundEvent::PowerAction(request) => {
            let action = match PowerAction::from_str(&request.action) {
                Ok(action) => action,
                Err(_) => {
                    handle
                        .send(&OutboundEvent::Error {
                            message: format!("unknown power action '{}'", request.action),
                        })
                        .await;
                    return;
                }
            };
            match manager.power_action(&handle.server_id, action).await {
                Ok(_) => {
                    // A started container is a new log stream; re-arm the
                    // attacher so the tail follows it.
                    if matches!(action, PowerAction::Start | PowerAction::Restart) {
                        let mut slot = attacher.lock().await;
                        if let Some(task) = slot.take() {
                            task.abort();
                        }
                        *slot = Some(spawn_attacher(manager.clone(), handle.clone()));
                    }
                }
                Err(e) => {
                    handle
                        .send(&OutboundEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        }
    }
}

/// Tails the container's output stream for one session, re-attaching while
/// the session stays open.
fn spawn_attacher(manager: Arc<ServerManager>, handle: Arc<SessionHandle>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if !handle.is_open() {
                return;
            }
            let docker_id = services::get_server(&manager.db, &handle.server_id)
                .await
                .ok()
                .flatten()
                .and_then(|record| record.docker_id);

            if let Some(docker_id) = docker_id {
                let mut stream = manager.gateway.logs_follow(&docker_id, false);
                let mut assembler = LineAssembler::new();
                let mut guard = BurstGuard::new();
                while let Some(chunk) = stream.next().await {
                    if !handle.is_open() {
                        return;
                    }
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            debug!(session = %handle.id, error = %e, "Log stream error.");
                            break;
                        }
                    };
                    for payload in demultiplex(&chunk) {
                        for line in assembler.push(payload) {
                            process_console_line(&manager, &handle, &mut guard, line).await;
                        }
                    }
                }
            }

            if !handle.is_open() {
                return;
            }
            tokio::time::sleep(REATTACH_DELAY).await;
        }
    })
}

async fn process_console_line(
    manager: &Arc<ServerManager>,
    handle: &Arc<SessionHandle>,
    guard: &mut BurstGuard,
    line: String,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let line = brand_rewrite(line);
    if line.len() > PAYLOAD_CAP {
        warn!(session = %handle.id, bytes = line.len(), "Dropping oversized console line.");
        return;
    }
    if !guard.admit(Instant::now()) {
        return;
    }
    manager.rings.append(&handle.server_id, &line);
    handle
        .send(&OutboundEvent::ConsoleOutput { message: line })
        .await;
}

/// Samples engine statistics every two seconds while the session lives.
fn spawn_sampler(manager: Arc<ServerManager>, handle: Arc<SessionHandle>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tracker = StatsTracker::new();
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        // The initial frame went out during authentication.
        interval.tick().await;
        loop {
            interval.tick().await;
            if !handle.is_open() {
                return;
            }
            let frame = build_stats_frame(&manager, &handle.server_id, &mut tracker).await;
            if !handle.send(&OutboundEvent::Stats(frame)).await {
                return;
            }
        }
    })
}

async fn build_stats_frame(
    manager: &Arc<ServerManager>,
    server_id: &str,
    tracker: &mut StatsTracker,
) -> StatsPayload {
    let record = match services::get_server(&manager.db, server_id).await {
        Ok(Some(record)) => record,
        _ => return StatsPayload::state_only("unknown"),
    };
    let Some(docker_id) = record.docker_id.clone() else {
        tracker.reset();
        return StatsPayload::state_only(&record.state);
    };

    let running = matches!(
        manager.gateway.inspect(&docker_id).await,
        Ok(snapshot) if snapshot.running
    );
    if !running {
        tracker.reset();
        return StatsPayload::state_only(&record.state);
    }

    match manager.gateway.stats_once(&docker_id).await {
        Ok(Some(stats)) => tracker.update(&record.state, extract_sample(&stats), Instant::now()),
        _ => StatsPayload::state_only(&record.state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_server_id_strips_everything_unsafe() {
        assert_eq!(sanitize_server_id("srv_1-a"), "srv_1-a");
        assert_eq!(sanitize_server_id("../srv/1"), "srv1");
        assert_eq!(sanitize_server_id("s p a c e"), "space");
        // Dots are stripped here, unlike volume names.
        assert_eq!(sanitize_server_id("a.b"), "ab");
    }

    #[test]
    fn test_sanitize_command_filters_and_trims() {
        assert_eq!(sanitize_command("  say hello  "), "say hello");
        assert_eq!(sanitize_command("say \"quoted\" 'text'"), "say quoted text");
        assert_eq!(sanitize_command("line\r\nbreak\ttab"), "linebreaktab");
        assert_eq!(sanitize_command("ünïcödé"), "ncd");
    }

    #[test]
    fn test_sanitize_command_empty_is_noop() {
        assert_eq!(sanitize_command("   "), "");
        assert_eq!(sanitize_command("\"\"''"), "");
    }
}
