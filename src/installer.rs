//! One-shot install orchestration: workspace staging, generated shell
//! wrapper, run-to-completion with exit-code adjudication, and the
//! failure-time log dump.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::docker::{ContainerGateway, InstallContainerSpec};
use crate::error::AppError;
use crate::logs::{LogRegistry, LogType};
use crate::models::{sanitize_volume_id, InstallSpec, Variable};
use crate::template::normalize_name;
use crate::websocket_models::OutboundEvent;
use crate::ws::log_stream::{demultiplex, LineAssembler};
use crate::ws::registry::SessionRegistry;

const INSTALL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Single-quotes a value for safe embedding in the generated script.
/// Embedded quotes become `'\''`.
fn shell_escape(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Builds the wrapper script the install container runs. Output is teed to
/// the workspace log, failures are traced with their line number, and every
/// variable is exported ahead of the panel-supplied script.
pub fn generate_install_script(install: &InstallSpec, variables: &[Variable]) -> String {
    let mut script = String::new();
    script.push_str("#!/bin/bash\n");
    script.push_str("set -e\n");
    script.push_str("exec 1> >(tee -a /mnt/server/.installation/logs/install.log)\n");
    script.push_str("exec 2>&1\n");
    script.push_str(
        "trap 'echo \"Error on line $LINENO\" >> /mnt/server/.installation/logs/install.log' ERR\n",
    );
    for var in variables {
        script.push_str(&format!(
            "export {}={}\n",
            normalize_name(&var.name).to_uppercase(),
            shell_escape(var.effective_value())
        ));
    }
    script.push_str(&install.script.replace("\r\n", "\n"));
    script.push('\n');
    script.push_str("exit $?\n");
    script
}

/// Creates the volume's `.installation` workspace and writes the wrapper.
async fn stage_workspace(
    volume_dir: &Path,
    install: &InstallSpec,
    variables: &[Variable],
) -> Result<(), AppError> {
    let workspace = volume_dir.join(".installation");
    for sub in ["logs", "temp", "config"] {
        fs::create_dir_all(workspace.join(sub)).await?;
    }

    let script_path = workspace.join("install.sh");
    fs::write(&script_path, generate_install_script(install, variables)).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    debug!(path = %script_path.display(), "Install workspace staged.");
    Ok(())
}

/// Runs the full install for one server. On success the workspace is
/// removed; on a non-zero exit the buffered output is dumped to
/// `installation.log` at the volume root and the failure propagates.
#[allow(clippy::too_many_arguments)]
pub async fn run_install(
    gateway: &ContainerGateway,
    rings: Arc<LogRegistry>,
    sessions: &SessionRegistry,
    server_id: &str,
    volume_dir: &Path,
    memory_limit: i64,
    runtime_image: &str,
    install: &InstallSpec,
    variables: &[Variable],
) -> Result<(), AppError> {
    stage_workspace(volume_dir, install, variables).await?;

    // Both images must be present before anything runs; a missing runtime
    // image would otherwise only surface after a successful install.
    gateway.pull(&install.image).await?;
    gateway.pull(runtime_image).await?;

    let container_name = format!("{}_installer", sanitize_volume_id(server_id));
    gateway.remove(&container_name, false).await?;

    let spec = InstallContainerSpec {
        server_id: server_id.to_string(),
        image: install.image.clone(),
        entrypoint: install.entrypoint.clone(),
        volume_dir: volume_dir.to_string_lossy().into_owned(),
        memory_limit,
        variables: variables.to_vec(),
    };
    let container_id = gateway
        .create_container(&container_name, spec.to_config())
        .await?;
    info!(server_id = %server_id, container = %container_name, "Install container created.");

    let buffer: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let pump = spawn_log_pump(
        gateway.clone(),
        rings,
        sessions.clone(),
        server_id.to_string(),
        container_id.clone(),
        buffer.clone(),
    );

    gateway.start(&container_id).await?;
    let exit_code = gateway.wait(&container_id, INSTALL_TIMEOUT).await;
    // Give the pump a moment to drain trailing output, then stop it.
    tokio::time::sleep(Duration::from_millis(250)).await;
    pump.abort();

    let exit_code = exit_code?;
    if exit_code == 0 {
        info!(server_id = %server_id, "Install script completed.");
        if let Err(e) = fs::remove_dir_all(volume_dir.join(".installation")).await {
            warn!(server_id = %server_id, error = %e, "Failed to remove install workspace.");
        }
        return Ok(());
    }

    error!(server_id = %server_id, exit_code, "Install script failed.");
    dump_failure_log(volume_dir, server_id, exit_code, &buffer).await;
    Err(AppError::InstallScriptFailed(exit_code))
}

async fn dump_failure_log(
    volume_dir: &Path,
    server_id: &str,
    exit_code: i64,
    buffer: &Mutex<Vec<String>>,
) {
    let mut contents = buffer.lock().await.join("\n");
    contents.push_str(&format!(
        "\nInstallation process exited with exit code {exit_code}\n"
    ));
    if let Err(e) = fs::write(volume_dir.join("installation.log"), contents).await {
        error!(server_id = %server_id, error = %e, "Failed to write installation.log.");
    }
}

fn spawn_log_pump(
    gateway: ContainerGateway,
    rings: Arc<LogRegistry>,
    sessions: SessionRegistry,
    server_id: String,
    container_id: String,
    buffer: Arc<Mutex<Vec<String>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = gateway.logs_follow(&container_id, true);
        let mut assembler = LineAssembler::new();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(server_id = %server_id, error = %e, "Install log stream ended.");
                    break;
                }
            };
            for payload in demultiplex(&chunk) {
                for line in assembler.push(payload) {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    buffer.lock().await.push(line.clone());
                    rings.append(&server_id, &line);
                    sessions
                        .broadcast(
                            &server_id,
                            &OutboundEvent::ConsoleOutput {
                                message: LogType::Info.format(&line),
                            },
                        )
                        .await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_spec(script: &str) -> InstallSpec {
        InstallSpec {
            image: "debian:bookworm".to_string(),
            entrypoint: "bash".to_string(),
            script: script.to_string(),
        }
    }

    #[test]
    fn test_script_preamble_and_trailer() {
        let script = generate_install_script(&install_spec("echo hi"), &[]);
        assert!(script.starts_with("#!/bin/bash\nset -e\n"));
        assert!(script.contains("exec 1> >(tee -a /mnt/server/.installation/logs/install.log)"));
        assert!(script.contains("trap 'echo \"Error on line $LINENO\""));
        assert!(script.contains("\necho hi\n"));
        assert!(script.ends_with("exit $?\n"));
    }

    #[test]
    fn test_script_exports_variables_quoted() {
        let vars = [Variable {
            name: "Server Name".to_string(),
            default_value: "plain".to_string(),
            current_value: Some("it's; rm -rf /".to_string()),
            rules: String::new(),
        }];
        let script = generate_install_script(&install_spec("echo ok"), &vars);
        assert!(script.contains("export SERVER_NAME='it'\\''s; rm -rf /'\n"));
    }

    #[test]
    fn test_script_normalizes_crlf() {
        let script = generate_install_script(&install_spec("line1\r\nline2"), &[]);
        assert!(script.contains("line1\nline2"));
        assert!(!script.contains('\r'));
    }

    #[test]
    fn test_shell_escape_round_trips_simple_values() {
        assert_eq!(shell_escape("abc"), "'abc'");
        assert_eq!(shell_escape("a'b"), "'a'\\''b'");
    }

    #[tokio::test]
    async fn test_stage_workspace_layout() {
        let dir = tempfile::tempdir().unwrap();
        stage_workspace(dir.path(), &install_spec("echo hi"), &[])
            .await
            .unwrap();
        for sub in ["logs", "temp", "config"] {
            assert!(dir.path().join(".installation").join(sub).is_dir());
        }
        let script = std::fs::read_to_string(dir.path().join(".installation/install.sh")).unwrap();
        assert!(script.contains("echo hi"));
    }

    #[tokio::test]
    async fn test_failure_dump_contains_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Mutex::new(vec!["step one".to_string(), "boom".to_string()]);
        dump_failure_log(dir.path(), "s1", 2, &buffer).await;
        let dump = std::fs::read_to_string(dir.path().join("installation.log")).unwrap();
        assert!(dump.contains("step one"));
        assert!(dump.contains("exit code 2"));
    }
}
