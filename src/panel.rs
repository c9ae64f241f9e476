//! Client for the panel's two upstream endpoints: server config fetch and
//! session-token validation.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::models::{CargoFile, ConfigFile, InstallSpec, Variable};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const FETCH_ATTEMPTS: u32 = 3;
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// The panel's authoritative snapshot of a server's unit: image, variables,
/// install script, startup command, and the files/cargo to materialize.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteServerConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub image: String,
    pub startup_command: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
    pub install: InstallSpec,
    #[serde(default)]
    pub config_files: Vec<ConfigFile>,
    #[serde(default)]
    pub cargo: Vec<CargoFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationResponse {
    #[serde(default)]
    pub validated: bool,
    #[serde(default)]
    pub server: Option<ValidatedServer>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedServer {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone)]
pub struct PanelClient {
    http: reqwest::Client,
    base_url: String,
}

impl PanelClient {
    pub fn new(base_url: &str) -> Self {
        PanelClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetches the server's config, retrying transport failures and non-2xx
    /// responses with linear back-off.
    pub async fn fetch_config(&self, server_id: &str) -> Result<RemoteServerConfig, AppError> {
        let url = format!("{}/api/servers/{}/config", self.base_url, server_id);
        let mut last_error = String::new();

        for attempt in 1..=FETCH_ATTEMPTS {
            match self.try_fetch_config(&url).await {
                Ok(config) => return Ok(config),
                Err(reason) => {
                    warn!(
                        server_id = %server_id,
                        attempt,
                        error = %reason,
                        "Panel config fetch failed."
                    );
                    last_error = reason;
                }
            }
            if attempt < FETCH_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
        }
        Err(AppError::PanelUnavailable(last_error))
    }

    async fn try_fetch_config(&self, url: &str) -> Result<RemoteServerConfig, String> {
        let response = self
            .http
            .get(url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("panel returned {}", response.status()));
        }
        response
            .json::<RemoteServerConfig>()
            .await
            .map_err(|e| format!("malformed config payload: {e}"))
    }

    /// Checks a client session token against the panel. Single attempt; any
    /// failure is an unvalidated verdict, never an error; callers close the
    /// socket.
    pub async fn validate(&self, server_id: &str, token: &str) -> bool {
        let url = format!(
            "{}/api/servers/{}/validate/{}",
            self.base_url, server_id, token
        );
        let response = match self
            .http
            .get(&url)
            .bearer_auth(token)
            .timeout(VALIDATE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(server_id = %server_id, error = %e, "Panel validation transport failure.");
                return false;
            }
        };
        if !response.status().is_success() {
            debug!(server_id = %server_id, status = %response.status(), "Panel rejected token.");
            return false;
        }
        match response.json::<ValidationResponse>().await {
            Ok(body) => body.validated,
            Err(e) => {
                warn!(server_id = %server_id, error = %e, "Malformed validation payload.");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_config_parses_panel_shape() {
        let raw = serde_json::json!({
            "name": "Lobby",
            "image": "ghcr.io/argon/java:17",
            "startupCommand": "java -Xmx%memory%M -jar server.jar",
            "variables": [
                {"name": "Memory", "defaultValue": "1024", "rules": "string"}
            ],
            "install": {
                "image": "debian:bookworm",
                "entrypoint": "bash",
                "script": "echo hi"
            },
            "configFiles": [
                {"path": "server.properties", "content": "port=%server_port%"}
            ],
            "cargo": [
                {
                    "url": "https://example.com/map.zip",
                    "targetPath": "maps/map.zip",
                    "properties": {"readonly": true, "checksum": "abc123"}
                }
            ]
        });
        let config: RemoteServerConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.image, "ghcr.io/argon/java:17");
        assert_eq!(config.variables[0].name, "Memory");
        assert_eq!(config.install.entrypoint, "bash");
        assert!(config.cargo[0].properties.readonly);
        // Unknown optional properties survive the boundary.
        assert_eq!(
            config.cargo[0].properties.extra["checksum"],
            serde_json::json!("abc123")
        );
    }

    #[test]
    fn test_remote_config_defaults_optional_sections() {
        let raw = serde_json::json!({
            "image": "ghcr.io/argon/java:17",
            "startupCommand": "./run.sh",
            "install": {"image": "debian:bookworm", "script": "exit 0"}
        });
        let config: RemoteServerConfig = serde_json::from_value(raw).unwrap();
        assert!(config.name.is_none());
        assert!(config.variables.is_empty());
        assert!(config.config_files.is_empty());
        assert!(config.cargo.is_empty());
        assert_eq!(config.install.entrypoint, "bash");
    }

    #[test]
    fn test_validation_response_defaults_to_unvalidated() {
        let body: ValidationResponse = serde_json::from_str("{}").unwrap();
        assert!(!body.validated);
    }
}
