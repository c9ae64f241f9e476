use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::{Allocation, ConfigFilesDoc, InstallSpec, ServerState, Variable};

/// One row per managed server; the unit of persistence. Nested objects
/// (variables, install script, allocation, config files) live in JSON
/// columns.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "servers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub docker_id: Option<String>,
    pub name: String,
    pub image: String,
    pub state: String,
    pub memory_limit: i64,
    pub cpu_limit: f64,
    #[sea_orm(column_type = "Json")]
    pub variables: Json,
    pub startup_command: String,
    #[sea_orm(column_type = "Json")]
    pub install_script: Json,
    #[sea_orm(column_type = "Json")]
    pub allocation: Json,
    #[sea_orm(column_type = "Json")]
    pub config_files: Json,
    pub sftp_enabled: bool,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn server_state(&self) -> ServerState {
        self.state.parse().unwrap_or(ServerState::Errored)
    }

    pub fn variable_list(&self) -> Vec<Variable> {
        serde_json::from_value(self.variables.clone()).unwrap_or_default()
    }

    pub fn install_spec(&self) -> Option<InstallSpec> {
        serde_json::from_value(self.install_script.clone()).ok()
    }

    pub fn allocation_spec(&self) -> Option<Allocation> {
        serde_json::from_value(self.allocation.clone()).ok()
    }

    pub fn config_doc(&self) -> ConfigFilesDoc {
        serde_json::from_value(self.config_files.clone()).unwrap_or_default()
    }
}
