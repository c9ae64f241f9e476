//! Frame vocabulary for the live client socket. Every frame is JSON of the
//! shape `{event, data}`.

use serde::{Deserialize, Serialize};

/// Messages a browser client may send to the daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    SendCommand(String),
    PowerAction(PowerActionRequest),
    Heartbeat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PowerActionRequest {
    pub action: String,
}

/// Messages the daemon pushes to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    AuthSuccess {
        state: String,
    },
    ConsoleOutput {
        message: String,
    },
    Stats(StatsPayload),
    PowerStatus {
        status: String,
        action: String,
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    HeartbeatAck,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsPayload {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkStats>,
}

impl StatsPayload {
    /// The reduced frame sent while the container is not running.
    pub fn state_only(state: &str) -> Self {
        StatsPayload {
            state: state.to_string(),
            cpu_percent: None,
            memory: None,
            network: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub used: u64,
    pub limit: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_rate: u64,
    pub tx_rate: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_event_shapes() {
        let cmd: InboundEvent =
            serde_json::from_str(r#"{"event":"send_command","data":"say hi"}"#).unwrap();
        assert!(matches!(cmd, InboundEvent::SendCommand(ref c) if c == "say hi"));

        let power: InboundEvent =
            serde_json::from_str(r#"{"event":"power_action","data":{"action":"kill"}}"#).unwrap();
        assert!(matches!(power, InboundEvent::PowerAction(ref p) if p.action == "kill"));

        let hb: InboundEvent = serde_json::from_str(r#"{"event":"heartbeat"}"#).unwrap();
        assert!(matches!(hb, InboundEvent::Heartbeat));
    }

    #[test]
    fn test_outbound_event_tagging() {
        let json = serde_json::to_value(OutboundEvent::ConsoleOutput {
            message: "hello".to_string(),
        })
        .unwrap();
        assert_eq!(json["event"], "console_output");
        assert_eq!(json["data"]["message"], "hello");

        let json = serde_json::to_value(OutboundEvent::HeartbeatAck).unwrap();
        assert_eq!(json["event"], "heartbeat_ack");
    }

    #[test]
    fn test_stats_state_only_omits_optional_fields() {
        let json = serde_json::to_value(OutboundEvent::Stats(StatsPayload::state_only("stopped")))
            .unwrap();
        assert_eq!(json["data"]["state"], "stopped");
        assert!(json["data"].get("cpu_percent").is_none());
        assert!(json["data"].get("memory").is_none());
    }
}
