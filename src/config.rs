use std::env;

/// Runtime configuration for the daemon, loaded from the environment.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Address the HTTP/WebSocket server listens on (host:port).
    pub bind: String,
    /// Database URL for the server record store.
    pub database_url: String,
    /// Host directory that holds one volume per managed server.
    pub volumes_dir: String,
    /// Static API key required on the `/servers` routes.
    pub api_key: String,
    /// Base URL of the panel (no trailing slash).
    pub panel_url: String,
    /// Maximum concurrent socket connections per client IP. `None` disables
    /// the limit.
    pub max_connections_per_ip: Option<usize>,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, String> {
        let bind = env::var("KRYPTON_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let database_url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://krypton.db?mode=rwc".to_string());

        let volumes_dir =
            env::var("VOLUMES_DIR").unwrap_or_else(|_| "/var/lib/krypton/volumes".to_string());

        let api_key =
            env::var("KRYPTON_API_KEY").map_err(|_| "KRYPTON_API_KEY must be set".to_string())?;

        let panel_url = env::var("PANEL_URL")
            .map_err(|_| "PANEL_URL must be set".to_string())?
            .trim_end_matches('/')
            .to_string();

        let max_connections_per_ip = match env::var("MAX_CONNECTIONS_PER_IP") {
            Ok(raw) => Some(
                raw.parse::<usize>()
                    .map_err(|_| "MAX_CONNECTIONS_PER_IP must be a positive integer".to_string())?,
            ),
            Err(_) => None,
        };

        Ok(DaemonConfig {
            bind,
            database_url,
            volumes_dir,
            api_key,
            panel_url,
            max_connections_per_ip,
        })
    }
}
