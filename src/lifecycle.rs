//! The server lifecycle controller: sole writer of record state and
//! container identity. Create, update, reinstall, delete, and power actions
//! all serialize on a per-server lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::cargo;
use crate::config::DaemonConfig;
use crate::db::entities::server;
use crate::db::services;
use crate::docker::{ContainerGateway, RuntimeContainerSpec};
use crate::error::AppError;
use crate::installer;
use crate::logs::{LogRegistry, LogType};
use crate::models::{
    sanitize_volume_id, Allocation, ConfigFilesDoc, PowerAction, ServerState,
};
use crate::panel::PanelClient;
use crate::template;
use crate::websocket_models::OutboundEvent;
use crate::ws::registry::SessionRegistry;
use crate::ws::validation::ValidationCache;

/// Graceful-stop window for client power actions.
const POWER_STOP_GRACE: Duration = Duration::from_secs(30);
/// Shorter window while an update replaces the container.
const UPDATE_STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateServerRequest {
    #[serde(default)]
    pub server_id: Option<String>,
    pub name: Option<String>,
    pub memory_limit: Option<i64>,
    pub cpu_limit: Option<f64>,
    #[serde(default)]
    pub unit_changed: bool,
    pub docker_image: Option<String>,
}

/// Shared daemon context. Everything the HTTP surface and the session
/// multiplexer touch goes through here.
pub struct ServerManager {
    pub db: DatabaseConnection,
    pub gateway: ContainerGateway,
    pub panel: PanelClient,
    pub http: reqwest::Client,
    pub config: DaemonConfig,
    pub rings: Arc<LogRegistry>,
    pub sessions: SessionRegistry,
    pub validation: ValidationCache,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ServerManager {
    pub fn new(
        db: DatabaseConnection,
        gateway: ContainerGateway,
        panel: PanelClient,
        config: DaemonConfig,
    ) -> Arc<Self> {
        let sessions = SessionRegistry::new(config.max_connections_per_ip);
        Arc::new(ServerManager {
            db,
            gateway,
            panel,
            http: reqwest::Client::new(),
            config,
            rings: Arc::new(LogRegistry::new()),
            sessions,
            validation: ValidationCache::new(),
            locks: DashMap::new(),
        })
    }

    pub fn volume_dir(&self, server_id: &str) -> PathBuf {
        PathBuf::from(&self.config.volumes_dir).join(sanitize_volume_id(server_id))
    }

    fn lock_for(&self, server_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Appends a daemon status line to the ring and broadcasts it.
    pub async fn daemon_message(&self, server_id: &str, message: &str) {
        self.rings
            .append(server_id, &format!("[Krypton Daemon] {message}"));
        self.sessions
            .broadcast(
                server_id,
                &OutboundEvent::ConsoleOutput {
                    message: LogType::Daemon.format(message),
                },
            )
            .await;
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Accepts a create request: the record is persisted as `installing`
    /// and the provisioning flow runs in the background. The HTTP response
    /// goes out before any panel or engine work starts.
    pub async fn create_server(
        self: &Arc<Self>,
        server_id: &str,
        validation_token: &str,
        name: &str,
        memory_limit: i64,
        cpu_limit: f64,
        allocation: &Allocation,
    ) -> Result<server::Model, AppError> {
        if services::get_server(&self.db, server_id).await?.is_some() {
            return Err(AppError::BadRequest(format!(
                "server '{server_id}' already exists"
            )));
        }
        let record =
            services::create_server(&self.db, server_id, name, memory_limit, cpu_limit, allocation)
                .await?;
        // The panel minted this token for the creating client; seed the
        // verdict so the first socket doesn't round-trip.
        self.validation.insert(server_id, validation_token, true).await;
        self.spawn_create_flow(server_id.to_string());
        Ok(record)
    }

    fn spawn_create_flow(self: &Arc<Self>, server_id: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            let lock = manager.lock_for(&server_id);
            let _guard = lock.lock().await;
            if let Err(e) = manager.provision(&server_id).await {
                error!(server_id = %server_id, error = %e, "Installation failed.");
                let _ =
                    services::set_state(&manager.db, &server_id, ServerState::InstallFailed).await;
                manager
                    .daemon_message(&server_id, &format!("Installation failed: {e}"))
                    .await;
            }
        });
    }

    /// The full first-install flow: panel config, template validation,
    /// cargo, install container, config files, runtime container.
    async fn provision(&self, server_id: &str) -> Result<(), AppError> {
        let config = self.panel.fetch_config(server_id).await?;
        let doc = ConfigFilesDoc {
            files: config.config_files.clone(),
            cargo: config.cargo.clone(),
        };
        let record = services::apply_unit_config(
            &self.db,
            server_id,
            config.name.as_deref(),
            &config.image,
            &config.startup_command,
            &config.variables,
            &config.install,
            &doc,
        )
        .await?;

        // Template inputs are checked before any container operation so a
        // bad variable never costs an image pull.
        template::render(&record.startup_command, &record.variable_list(), &doc.cargo)?;

        let volume_dir = self.volume_dir(server_id);
        fs::create_dir_all(&volume_dir).await?;
        cargo::ship_cargo(&self.http, &volume_dir, &doc.cargo).await?;

        self.daemon_message(server_id, "Running installation script.").await;
        installer::run_install(
            &self.gateway,
            self.rings.clone(),
            &self.sessions,
            server_id,
            &volume_dir,
            record.memory_limit,
            &record.image,
            &config.install,
            &record.variable_list(),
        )
        .await?;

        self.materialize_config_files(&record, &doc).await?;

        let docker_id = self.create_runtime_container(&record).await?;
        services::set_container(
            &self.db,
            server_id,
            Some(docker_id.clone()),
            ServerState::Starting,
        )
        .await?;
        self.gateway.start(&docker_id).await?;
        services::set_state(&self.db, server_id, ServerState::Running).await?;
        info!(server_id = %server_id, container = %docker_id, "Server installed and running.");
        self.daemon_message(server_id, "Installation complete, server started.")
            .await;
        Ok(())
    }

    /// Renders and writes the panel's config files into the volume.
    async fn materialize_config_files(
        &self,
        record: &server::Model,
        doc: &ConfigFilesDoc,
    ) -> Result<(), AppError> {
        if doc.files.is_empty() {
            return Ok(());
        }
        let variables = record.variable_list();
        let volume_dir = self.volume_dir(&record.id);
        for file in &doc.files {
            let rendered = template::render(&file.content, &variables, &doc.cargo)?;
            let relative = cargo::safe_relative_path(&file.path);
            if relative.as_os_str().is_empty() {
                warn!(server_id = %record.id, path = %file.path, "Skipping config file with empty path.");
                continue;
            }
            let target = volume_dir.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&target, rendered).await?;
        }
        Ok(())
    }

    /// Creates (but does not start) the runtime container for a record.
    async fn create_runtime_container(&self, record: &server::Model) -> Result<String, AppError> {
        let doc = record.config_doc();
        let startup =
            template::render(&record.startup_command, &record.variable_list(), &doc.cargo)?;
        let allocation: Allocation = record
            .allocation_spec()
            .ok_or_else(|| AppError::Internal("record has no allocation".to_string()))?;

        let container_name = sanitize_volume_id(&record.id);
        // A stale container under our name blocks creation; clear it.
        self.gateway.remove(&container_name, false).await?;

        let spec = RuntimeContainerSpec {
            server_id: record.id.clone(),
            server_name: record.name.clone(),
            image: record.image.clone(),
            volume_dir: self.volume_dir(&record.id).to_string_lossy().into_owned(),
            memory_limit: record.memory_limit,
            cpu_limit: record.cpu_limit,
            allocation,
            startup_command: startup,
            variables: record.variable_list(),
        };
        self.gateway.create_container(&container_name, spec.to_config()).await
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Applies a panel update. Only `running`/`stopped` servers are
    /// eligible; failure parks the record in `update_failed` without
    /// restoring the old container.
    pub async fn update_server(
        &self,
        server_id: &str,
        request: &UpdateServerRequest,
    ) -> Result<server::Model, AppError> {
        let lock = self.lock_for(server_id);
        let _guard = lock.lock().await;

        let record = services::require_server(&self.db, server_id).await?;
        let state = record.server_state();
        if !matches!(state, ServerState::Running | ServerState::Stopped) {
            return Err(AppError::InvalidTransition {
                action: "update".to_string(),
                state: state.as_str().to_string(),
            });
        }
        services::set_state(&self.db, server_id, ServerState::Updating).await?;

        match self.perform_update(&record, request).await {
            Ok(updated) => Ok(updated),
            Err(e) => {
                error!(server_id = %server_id, error = %e, "Update failed.");
                let _ = services::set_state(&self.db, server_id, ServerState::UpdateFailed).await;
                Err(e)
            }
        }
    }

    async fn perform_update(
        &self,
        record: &server::Model,
        request: &UpdateServerRequest,
    ) -> Result<server::Model, AppError> {
        let server_id = &record.id;

        // A unit swap re-fetches the authoritative config; a resource tweak
        // reuses the stored copy and deliberately skips config files.
        let (record, new_image) = if request.unit_changed {
            let config = self.panel.fetch_config(server_id).await?;
            let new_image = request
                .docker_image
                .clone()
                .unwrap_or_else(|| config.image.clone());
            if new_image != record.image {
                // Pull before touching the old container; a failed pull
                // must leave the server untouched.
                self.gateway.pull(&new_image).await?;
            }
            let doc = ConfigFilesDoc {
                files: config.config_files.clone(),
                cargo: config.cargo.clone(),
            };
            let updated = services::apply_unit_config(
                &self.db,
                server_id,
                config.name.as_deref(),
                &new_image,
                &config.startup_command,
                &config.variables,
                &config.install,
                &doc,
            )
            .await?;
            (updated, new_image)
        } else {
            let image = record.image.clone();
            (record.clone(), image)
        };

        if let Some(docker_id) = &record.docker_id {
            match self.gateway.inspect(docker_id).await {
                Ok(snapshot) if snapshot.running => {
                    self.gateway.stop(docker_id, UPDATE_STOP_GRACE).await?;
                }
                Ok(_) => {}
                Err(e) => warn!(server_id = %server_id, error = %e, "Old container not inspectable."),
            }
            self.gateway.remove(docker_id, false).await?;
        }

        let name = request.name.clone().unwrap_or_else(|| record.name.clone());
        let memory_limit = request.memory_limit.unwrap_or(record.memory_limit);
        let cpu_limit = request.cpu_limit.unwrap_or(record.cpu_limit);

        let staged = server::Model {
            name: name.clone(),
            image: new_image.clone(),
            memory_limit,
            cpu_limit,
            ..record.clone()
        };
        let docker_id = self.create_runtime_container(&staged).await?;
        self.gateway.start(&docker_id).await?;

        let updated = services::apply_update_result(
            &self.db,
            server_id,
            &docker_id,
            &name,
            &new_image,
            memory_limit,
            cpu_limit,
        )
        .await?;
        info!(server_id = %server_id, container = %docker_id, "Update applied.");
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Reinstall
    // ------------------------------------------------------------------

    /// Tears down the runtime container and re-runs the installer from the
    /// stored record. The next `start` power action rebuilds the container.
    pub async fn reinstall_server(self: &Arc<Self>, server_id: &str) -> Result<(), AppError> {
        {
            let lock = self.lock_for(server_id);
            let _guard = lock.lock().await;
            let record = services::require_server(&self.db, server_id).await?;
            if let Some(docker_id) = &record.docker_id {
                self.gateway.remove(docker_id, false).await?;
            }
            services::set_container(&self.db, server_id, None, ServerState::Installing).await?;
        }

        let manager = self.clone();
        let server_id = server_id.to_string();
        tokio::spawn(async move {
            let lock = manager.lock_for(&server_id);
            let _guard = lock.lock().await;
            match manager.run_reinstall(&server_id).await {
                Ok(()) => {
                    let _ =
                        services::set_state(&manager.db, &server_id, ServerState::Installed).await;
                    manager.daemon_message(&server_id, "Reinstall complete.").await;
                }
                Err(e) => {
                    error!(server_id = %server_id, error = %e, "Reinstall failed.");
                    let _ = services::set_state(&manager.db, &server_id, ServerState::InstallFailed)
                        .await;
                    manager
                        .daemon_message(&server_id, &format!("Reinstall failed: {e}"))
                        .await;
                }
            }
        });
        Ok(())
    }

    async fn run_reinstall(&self, server_id: &str) -> Result<(), AppError> {
        let record = services::require_server(&self.db, server_id).await?;
        let install = record
            .install_spec()
            .ok_or_else(|| AppError::Internal("record has no install script".to_string()))?;
        let doc = record.config_doc();

        template::render(&record.startup_command, &record.variable_list(), &doc.cargo)?;

        let volume_dir = self.volume_dir(server_id);
        fs::create_dir_all(&volume_dir).await?;
        cargo::ship_cargo(&self.http, &volume_dir, &doc.cargo).await?;

        self.daemon_message(server_id, "Running installation script.").await;
        installer::run_install(
            &self.gateway,
            self.rings.clone(),
            &self.sessions,
            server_id,
            &volume_dir,
            record.memory_limit,
            &record.image,
            &install,
            &record.variable_list(),
        )
        .await?;
        self.materialize_config_files(&record, &doc).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Removes container, volume, and record in that order. Container
    /// failures are swallowed; deletion is idempotent by intent.
    pub async fn delete_server(&self, server_id: &str) -> Result<(), AppError> {
        let lock = self.lock_for(server_id);
        let _guard = lock.lock().await;

        let record = services::require_server(&self.db, server_id).await?;
        let _ = services::set_state(&self.db, server_id, ServerState::Deleting).await;

        if let Some(docker_id) = &record.docker_id {
            if let Err(e) = self.gateway.remove(docker_id, true).await {
                warn!(server_id = %server_id, error = %e, "Container removal failed during delete; continuing.");
            }
        }

        match fs::remove_dir_all(self.volume_dir(server_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        services::delete_server(&self.db, server_id).await?;
        self.rings.remove(server_id);
        info!(server_id = %server_id, "Server deleted.");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Power
    // ------------------------------------------------------------------

    /// Executes a gated power action and broadcasts the outcome. Returns
    /// the resulting state.
    pub async fn power_action(
        &self,
        server_id: &str,
        action: PowerAction,
    ) -> Result<ServerState, AppError> {
        let lock = self.lock_for(server_id);
        let _guard = lock.lock().await;

        let record = services::require_server(&self.db, server_id).await?;
        let state = record.server_state();
        ensure_transition(action, state)?;

        // A fresh container instance gets a fresh console.
        self.rings.clear(server_id);

        let result = self.execute_power(&record, action).await;
        match result {
            Ok(new_state) => {
                self.daemon_message(server_id, &format!("Server marked as {new_state}."))
                    .await;
                self.sessions
                    .broadcast(
                        server_id,
                        &OutboundEvent::PowerStatus {
                            status: "completed".to_string(),
                            action: action.as_str().to_string(),
                            state: new_state.as_str().to_string(),
                            error: None,
                        },
                    )
                    .await;
                Ok(new_state)
            }
            Err(e) => {
                let _ = services::set_state(&self.db, server_id, ServerState::Errored).await;
                self.sessions
                    .broadcast(
                        server_id,
                        &OutboundEvent::PowerStatus {
                            status: "failed".to_string(),
                            action: action.as_str().to_string(),
                            state: ServerState::Errored.as_str().to_string(),
                            error: Some(e.to_string()),
                        },
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn execute_power(
        &self,
        record: &server::Model,
        action: PowerAction,
    ) -> Result<ServerState, AppError> {
        let server_id = &record.id;
        match action {
            PowerAction::Start => {
                let docker_id = match &record.docker_id {
                    Some(docker_id) => docker_id.clone(),
                    // After a reinstall there is no container yet; build it
                    // from the stored record.
                    None => self.create_runtime_container(record).await?,
                };
                services::set_container(
                    &self.db,
                    server_id,
                    Some(docker_id.clone()),
                    ServerState::Starting,
                )
                .await?;
                self.gateway.start(&docker_id).await?;
                services::set_state(&self.db, server_id, ServerState::Running).await?;
                Ok(ServerState::Running)
            }
            PowerAction::Stop => {
                let docker_id = require_container(record)?;
                services::set_state(&self.db, server_id, ServerState::Stopping).await?;
                self.gateway.stop(&docker_id, POWER_STOP_GRACE).await?;
                services::set_state(&self.db, server_id, ServerState::Stopped).await?;
                Ok(ServerState::Stopped)
            }
            PowerAction::Restart => {
                let docker_id = match &record.docker_id {
                    Some(docker_id) => docker_id.clone(),
                    None => self.create_runtime_container(record).await?,
                };
                services::set_container(
                    &self.db,
                    server_id,
                    Some(docker_id.clone()),
                    ServerState::Starting,
                )
                .await?;
                self.gateway.restart(&docker_id, POWER_STOP_GRACE).await?;
                services::set_state(&self.db, server_id, ServerState::Running).await?;
                Ok(ServerState::Running)
            }
            PowerAction::Kill => {
                let docker_id = require_container(record)?;
                self.gateway.kill(&docker_id).await?;
                services::set_state(&self.db, server_id, ServerState::Stopped).await?;
                Ok(ServerState::Stopped)
            }
        }
    }

    /// Live engine status for the GET-by-id augmentation.
    pub async fn live_status(&self, record: &server::Model) -> Option<String> {
        let docker_id = record.docker_id.as_ref()?;
        match self.gateway.inspect(docker_id).await {
            Ok(snapshot) => Some(snapshot.state),
            Err(_) => None,
        }
    }
}

fn require_container(record: &server::Model) -> Result<String, AppError> {
    record
        .docker_id
        .clone()
        .ok_or_else(|| AppError::ContainerOpFailed("server has no container".to_string()))
}

/// The power gate: which actions are legal from which states.
pub fn ensure_transition(action: PowerAction, state: ServerState) -> Result<(), AppError> {
    let allowed = match action {
        PowerAction::Start => matches!(
            state,
            ServerState::Installed
                | ServerState::Stopped
                | ServerState::UpdateFailed
                | ServerState::Errored
        ),
        PowerAction::Stop => matches!(state, ServerState::Running | ServerState::Starting),
        PowerAction::Restart => matches!(state, ServerState::Running | ServerState::Stopped),
        PowerAction::Kill => matches!(
            state,
            ServerState::Running | ServerState::Starting | ServerState::Stopping
        ),
    };
    if allowed {
        Ok(())
    } else {
        Err(AppError::InvalidTransition {
            action: action.as_str().to_string(),
            state: state.as_str().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_illegal_while_running() {
        let err = ensure_transition(PowerAction::Start, ServerState::Running).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert!(ensure_transition(PowerAction::Start, ServerState::Stopped).is_ok());
        assert!(ensure_transition(PowerAction::Start, ServerState::Installed).is_ok());
    }

    #[test]
    fn test_stop_and_kill_illegal_when_stopped() {
        assert!(ensure_transition(PowerAction::Stop, ServerState::Stopped).is_err());
        assert!(ensure_transition(PowerAction::Kill, ServerState::Stopped).is_err());
        assert!(ensure_transition(PowerAction::Stop, ServerState::Running).is_ok());
        assert!(ensure_transition(PowerAction::Kill, ServerState::Running).is_ok());
    }

    #[test]
    fn test_restart_illegal_while_restarting() {
        assert!(ensure_transition(PowerAction::Restart, ServerState::Starting).is_err());
        assert!(ensure_transition(PowerAction::Restart, ServerState::Running).is_ok());
        assert!(ensure_transition(PowerAction::Restart, ServerState::Stopped).is_ok());
    }

    #[test]
    fn test_kill_allowed_during_stuck_stop() {
        assert!(ensure_transition(PowerAction::Kill, ServerState::Stopping).is_ok());
    }

    #[test]
    fn test_no_power_during_install_or_update() {
        for action in [
            PowerAction::Start,
            PowerAction::Stop,
            PowerAction::Restart,
            PowerAction::Kill,
        ] {
            assert!(ensure_transition(action, ServerState::Installing).is_err());
            assert!(ensure_transition(action, ServerState::Updating).is_err());
            assert!(ensure_transition(action, ServerState::Deleting).is_err());
        }
    }

    #[test]
    fn test_update_request_parses_panel_shape() {
        let request: UpdateServerRequest = serde_json::from_value(serde_json::json!({
            "serverId": "s1",
            "memoryLimit": 2147483648u64,
            "unitChanged": true,
            "dockerImage": "ghcr.io/argon/java:21"
        }))
        .unwrap();
        assert_eq!(request.server_id.as_deref(), Some("s1"));
        assert_eq!(request.memory_limit, Some(2_147_483_648));
        assert!(request.unit_changed);
        assert!(request.name.is_none());
    }
}
