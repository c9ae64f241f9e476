use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder,
};
use tracing::debug;

use crate::db::entities::server;
use crate::error::AppError;
use crate::models::{Allocation, ConfigFilesDoc, InstallSpec, ServerState, Variable};

/// Inserts a fresh record for a just-accepted create request. The unit
/// fields (image, variables, startup, install) are filled in once the panel
/// config arrives.
pub async fn create_server(
    db: &DatabaseConnection,
    id: &str,
    name: &str,
    memory_limit: i64,
    cpu_limit: f64,
    allocation: &Allocation,
) -> Result<server::Model, AppError> {
    let now = Utc::now();
    let record = server::ActiveModel {
        id: Set(id.to_string()),
        docker_id: Set(None),
        name: Set(name.to_string()),
        image: Set(String::new()),
        state: Set(ServerState::Installing.as_str().to_string()),
        memory_limit: Set(memory_limit),
        cpu_limit: Set(cpu_limit),
        variables: Set(serde_json::json!([])),
        startup_command: Set(String::new()),
        install_script: Set(serde_json::json!(null)),
        allocation: Set(serde_json::to_value(allocation)?),
        config_files: Set(serde_json::to_value(ConfigFilesDoc::default())?),
        sftp_enabled: Set(false),
        created_at: Set(now),
        updated_at: Set(now),
    };
    Ok(record.insert(db).await?)
}

pub async fn get_server(
    db: &DatabaseConnection,
    id: &str,
) -> Result<Option<server::Model>, AppError> {
    Ok(server::Entity::find_by_id(id).one(db).await?)
}

/// Like [`get_server`] but maps absence to `RecordNotFound`.
pub async fn require_server(
    db: &DatabaseConnection,
    id: &str,
) -> Result<server::Model, AppError> {
    get_server(db, id)
        .await?
        .ok_or_else(|| AppError::RecordNotFound(id.to_string()))
}

pub async fn list_servers(db: &DatabaseConnection) -> Result<Vec<server::Model>, AppError> {
    Ok(server::Entity::find()
        .order_by_asc(server::Column::CreatedAt)
        .all(db)
        .await?)
}

pub async fn set_state(
    db: &DatabaseConnection,
    id: &str,
    state: ServerState,
) -> Result<(), AppError> {
    debug!(server_id = %id, state = %state, "Updating server state.");
    let record = require_server(db, id).await?;
    let mut active: server::ActiveModel = record.into();
    active.state = Set(state.as_str().to_string());
    active.updated_at = Set(Utc::now());
    active.update(db).await?;
    Ok(())
}

pub async fn set_container(
    db: &DatabaseConnection,
    id: &str,
    docker_id: Option<String>,
    state: ServerState,
) -> Result<(), AppError> {
    let record = require_server(db, id).await?;
    let mut active: server::ActiveModel = record.into();
    active.docker_id = Set(docker_id);
    active.state = Set(state.as_str().to_string());
    active.updated_at = Set(Utc::now());
    active.update(db).await?;
    Ok(())
}

/// Applies the unit fields fetched from the panel.
pub async fn apply_unit_config(
    db: &DatabaseConnection,
    id: &str,
    name: Option<&str>,
    image: &str,
    startup_command: &str,
    variables: &[Variable],
    install: &InstallSpec,
    config_doc: &ConfigFilesDoc,
) -> Result<server::Model, AppError> {
    let record = require_server(db, id).await?;
    let mut active: server::ActiveModel = record.into();
    if let Some(name) = name {
        active.name = Set(name.to_string());
    }
    active.image = Set(image.to_string());
    active.startup_command = Set(startup_command.to_string());
    active.variables = Set(serde_json::to_value(variables)?);
    active.install_script = Set(serde_json::to_value(install)?);
    active.config_files = Set(serde_json::to_value(config_doc)?);
    active.updated_at = Set(Utc::now());
    Ok(active.update(db).await?)
}

/// The atomic tail of a successful update: container handle, state, and the
/// new resource envelope land together.
#[allow(clippy::too_many_arguments)]
pub async fn apply_update_result(
    db: &DatabaseConnection,
    id: &str,
    docker_id: &str,
    name: &str,
    image: &str,
    memory_limit: i64,
    cpu_limit: f64,
) -> Result<server::Model, AppError> {
    let record = require_server(db, id).await?;
    let mut active: server::ActiveModel = record.into();
    active.docker_id = Set(Some(docker_id.to_string()));
    active.state = Set(ServerState::Running.as_str().to_string());
    active.name = Set(name.to_string());
    active.image = Set(image.to_string());
    active.memory_limit = Set(memory_limit);
    active.cpu_limit = Set(cpu_limit);
    active.updated_at = Set(Utc::now());
    Ok(active.update(db).await?)
}

pub async fn update_config_doc(
    db: &DatabaseConnection,
    id: &str,
    config_doc: &ConfigFilesDoc,
) -> Result<(), AppError> {
    let record = require_server(db, id).await?;
    let mut active: server::ActiveModel = record.into();
    active.config_files = Set(serde_json::to_value(config_doc)?);
    active.updated_at = Set(Utc::now());
    active.update(db).await?;
    Ok(())
}

/// Deletes the row. Idempotent: deleting an absent record is not an error.
pub async fn delete_server(db: &DatabaseConnection, id: &str) -> Result<bool, AppError> {
    let result = server::Entity::delete_many()
        .filter(server::Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InstallSpec, Variable};

    async fn memory_db() -> DatabaseConnection {
        crate::db::connect("sqlite::memory:").await.unwrap()
    }

    fn allocation() -> Allocation {
        Allocation {
            bind_address: "0.0.0.0".to_string(),
            port: 25565,
        }
    }

    #[tokio::test]
    async fn test_create_and_fetch_round_trip() {
        let db = memory_db().await;
        let record = create_server(&db, "s1", "Lobby", 1_073_741_824, 1.0, &allocation())
            .await
            .unwrap();
        assert_eq!(record.state, "installing");
        assert!(record.docker_id.is_none());

        let fetched = require_server(&db, "s1").await.unwrap();
        assert_eq!(fetched.name, "Lobby");
        assert_eq!(fetched.memory_limit, 1_073_741_824);
        assert_eq!(fetched.allocation_spec().unwrap().port, 25565);
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let db = memory_db().await;
        let err = require_server(&db, "ghost").await.unwrap_err();
        assert!(matches!(err, AppError::RecordNotFound(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_state_and_container_updates() {
        let db = memory_db().await;
        create_server(&db, "s1", "Lobby", 1024, 1.0, &allocation())
            .await
            .unwrap();

        set_container(&db, "s1", Some("abc123".to_string()), ServerState::Running)
            .await
            .unwrap();
        let record = require_server(&db, "s1").await.unwrap();
        assert_eq!(record.docker_id.as_deref(), Some("abc123"));
        assert_eq!(record.server_state(), ServerState::Running);

        set_state(&db, "s1", ServerState::Stopped).await.unwrap();
        let record = require_server(&db, "s1").await.unwrap();
        assert_eq!(record.server_state(), ServerState::Stopped);
        // Container handle survives a pure state change.
        assert_eq!(record.docker_id.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_apply_unit_config_fills_unit_fields() {
        let db = memory_db().await;
        create_server(&db, "s1", "Lobby", 1024, 1.0, &allocation())
            .await
            .unwrap();

        let variables = vec![Variable {
            name: "Server Port".to_string(),
            default_value: "25565".to_string(),
            current_value: None,
            rules: "string|max:5".to_string(),
        }];
        let install = InstallSpec {
            image: "debian:bookworm".to_string(),
            entrypoint: "bash".to_string(),
            script: "echo hi".to_string(),
        };
        let record = apply_unit_config(
            &db,
            "s1",
            Some("Lobby EU"),
            "ghcr.io/argon/java:17",
            "java -jar server.jar",
            &variables,
            &install,
            &ConfigFilesDoc::default(),
        )
        .await
        .unwrap();

        assert_eq!(record.name, "Lobby EU");
        assert_eq!(record.image, "ghcr.io/argon/java:17");
        assert_eq!(record.variable_list()[0].name, "Server Port");
        assert_eq!(record.install_spec().unwrap().script, "echo hi");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let db = memory_db().await;
        create_server(&db, "s1", "Lobby", 1024, 1.0, &allocation())
            .await
            .unwrap();
        assert!(delete_server(&db, "s1").await.unwrap());
        assert!(!delete_server(&db, "s1").await.unwrap());
        assert!(get_server(&db, "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_update_result_is_atomic_shape() {
        let db = memory_db().await;
        create_server(&db, "s1", "Lobby", 1024, 1.0, &allocation())
            .await
            .unwrap();
        let record = apply_update_result(
            &db,
            "s1",
            "def456",
            "Lobby v2",
            "ghcr.io/argon/java:21",
            2048,
            2.0,
        )
        .await
        .unwrap();
        assert_eq!(record.docker_id.as_deref(), Some("def456"));
        assert_eq!(record.server_state(), ServerState::Running);
        assert_eq!(record.name, "Lobby v2");
        assert_eq!(record.memory_limit, 2048);
        assert_eq!(record.cpu_limit, 2.0);
    }
}
