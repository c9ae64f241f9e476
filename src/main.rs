use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use krypton::config::DaemonConfig;
use krypton::db;
use krypton::docker::ContainerGateway;
use krypton::http_server;
use krypton::lifecycle::ServerManager;
use krypton::panel::PanelClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = DaemonConfig::from_env().map_err(std::io::Error::other)?;
    info!(bind = %config.bind, panel = %config.panel_url, "Krypton daemon starting.");

    tokio::fs::create_dir_all(&config.volumes_dir).await?;

    let db = db::connect(&config.database_url).await?;
    let gateway = ContainerGateway::connect()?;
    let panel = PanelClient::new(&config.panel_url);

    let bind = config.bind.clone();
    let manager = ServerManager::new(db, gateway, panel, config);
    manager.validation.spawn_sweeper();

    http_server::run_http_server(manager, &bind).await
}
