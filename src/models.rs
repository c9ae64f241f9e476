use serde::{Deserialize, Serialize};

/// A templated startup/config variable, panel-defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub default_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<String>,
    #[serde(default)]
    pub rules: String,
}

impl Variable {
    /// The value templating actually substitutes.
    pub fn effective_value(&self) -> &str {
        self.current_value.as_deref().unwrap_or(&self.default_value)
    }
}

/// The one-shot installer description from the server's unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallSpec {
    pub image: String,
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    pub script: String,
}

fn default_entrypoint() -> String {
    "bash".to_string()
}

/// The (bindAddress, port) pair bound for both TCP and UDP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub bind_address: String,
    pub port: u16,
}

/// A game config file materialized into the volume after install.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CargoProperties {
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub no_delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_properties: Option<serde_json::Value>,
    // Unknown optional properties from the panel are carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An auxiliary artifact fetched from a URL into the server volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CargoFile {
    pub url: String,
    pub target_path: String,
    #[serde(default)]
    pub properties: CargoProperties,
}

/// The JSON document persisted in the record's `config_files` column:
/// templatable files plus the cargo manifest they may reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFilesDoc {
    #[serde(default)]
    pub files: Vec<ConfigFile>,
    #[serde(default)]
    pub cargo: Vec<CargoFile>,
}

/// Lifecycle state of a managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Creating,
    Installing,
    InstallFailed,
    Installed,
    Starting,
    Running,
    Updating,
    UpdateFailed,
    Stopping,
    Stopped,
    Errored,
    Deleting,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Creating => "creating",
            ServerState::Installing => "installing",
            ServerState::InstallFailed => "install_failed",
            ServerState::Installed => "installed",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Updating => "updating",
            ServerState::UpdateFailed => "update_failed",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
            ServerState::Errored => "errored",
            ServerState::Deleting => "deleting",
        }
    }
}

impl std::str::FromStr for ServerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(ServerState::Creating),
            "installing" => Ok(ServerState::Installing),
            "install_failed" => Ok(ServerState::InstallFailed),
            "installed" => Ok(ServerState::Installed),
            "starting" => Ok(ServerState::Starting),
            "running" => Ok(ServerState::Running),
            "updating" => Ok(ServerState::Updating),
            "update_failed" => Ok(ServerState::UpdateFailed),
            "stopping" => Ok(ServerState::Stopping),
            "stopped" => Ok(ServerState::Stopped),
            "errored" => Ok(ServerState::Errored),
            "deleting" => Ok(ServerState::Deleting),
            other => Err(format!("unknown server state: {other}")),
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client-requested power action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
    Kill,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Restart => "restart",
            PowerAction::Kill => "kill",
        }
    }
}

impl std::str::FromStr for PowerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(PowerAction::Start),
            "stop" => Ok(PowerAction::Stop),
            "restart" => Ok(PowerAction::Restart),
            "kill" => Ok(PowerAction::Kill),
            other => Err(format!("unknown power action: {other}")),
        }
    }
}

/// Maps any character outside `[A-Za-z0-9._-]` to `_`. Used for volume
/// directory names; idempotent.
pub fn sanitize_volume_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_sanitize_maps_into_safe_alphabet() {
        assert_eq!(sanitize_volume_id("srv-1.a_B"), "srv-1.a_B");
        assert_eq!(sanitize_volume_id("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_volume_id("a b/c"), "a_b_c");
        for c in sanitize_volume_id("日本語 id!@#").chars() {
            assert!(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
        }
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let once = sanitize_volume_id("we?ird/id here");
        assert_eq!(sanitize_volume_id(&once), once);
    }

    #[test]
    fn test_server_state_round_trip() {
        for state in [
            ServerState::Creating,
            ServerState::Installing,
            ServerState::InstallFailed,
            ServerState::Installed,
            ServerState::Starting,
            ServerState::Running,
            ServerState::Updating,
            ServerState::UpdateFailed,
            ServerState::Stopping,
            ServerState::Stopped,
            ServerState::Errored,
            ServerState::Deleting,
        ] {
            assert_eq!(ServerState::from_str(state.as_str()).unwrap(), state);
        }
        assert!(ServerState::from_str("exploded").is_err());
    }

    #[test]
    fn test_variable_effective_value_prefers_current() {
        let mut var = Variable {
            name: "Server Port".to_string(),
            default_value: "25565".to_string(),
            current_value: None,
            rules: "string".to_string(),
        };
        assert_eq!(var.effective_value(), "25565");
        var.current_value = Some("25570".to_string());
        assert_eq!(var.effective_value(), "25570");
    }

    #[test]
    fn test_power_action_parsing() {
        assert_eq!(PowerAction::from_str("kill").unwrap(), PowerAction::Kill);
        assert!(PowerAction::from_str("explode").is_err());
    }
}
