pub mod entities;
pub mod services;

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Schema};
use tracing::info;

use crate::error::AppError;

/// Connects to the record store and bootstraps the schema. The store is a
/// single-table node-local database, so the schema is derived straight from
/// the entity instead of a migration crate.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, AppError> {
    let db = Database::connect(database_url).await?;

    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    let mut create_servers = schema.create_table_from_entity(entities::server::Entity);
    create_servers.if_not_exists();
    db.execute(backend.build(&create_servers)).await?;

    info!(url = %database_url, "Record store ready.");
    Ok(db)
}
