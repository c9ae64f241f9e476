//! Thin typed gateway over the container engine.
//!
//! Every blocking engine call carries a deadline. The log-follow stream is
//! returned as raw multiplexed bytes; decoding is the session layer's job.

use std::collections::HashMap;
use std::time::Duration;

use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions, RestartContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::models::{Allocation, Variable};
use crate::template::normalize_name;

const ENGINE_OP_TIMEOUT: Duration = Duration::from_secs(30);
const PULL_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Extra slack on top of a graceful-stop window before the call is abandoned.
const STOP_MARGIN: Duration = Duration::from_secs(5);

/// What the lifecycle controller needs to know about a container.
#[derive(Debug, Clone, Default)]
pub struct InspectSnapshot {
    pub state: String,
    pub running: bool,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i64>,
}

/// Inputs for the long-lived gameplay container.
#[derive(Debug, Clone)]
pub struct RuntimeContainerSpec {
    pub server_id: String,
    pub server_name: String,
    pub image: String,
    pub volume_dir: String,
    pub memory_limit: i64,
    pub cpu_limit: f64,
    pub allocation: Allocation,
    /// Already-templated startup command, exported as `STARTUP`.
    pub startup_command: String,
    pub variables: Vec<Variable>,
}

/// Inputs for the one-shot install container.
#[derive(Debug, Clone)]
pub struct InstallContainerSpec {
    pub server_id: String,
    pub image: String,
    pub entrypoint: String,
    pub volume_dir: String,
    pub memory_limit: i64,
    pub variables: Vec<Variable>,
}

fn variable_env(variables: &[Variable]) -> impl Iterator<Item = String> + '_ {
    variables.iter().map(|var| {
        format!(
            "{}={}",
            normalize_name(&var.name).to_uppercase(),
            var.effective_value()
        )
    })
}

impl RuntimeContainerSpec {
    pub fn to_config(&self) -> Config<String> {
        let mut env = vec![
            "TERM=xterm".to_string(),
            "HOME=/home/container".to_string(),
            "USER=container".to_string(),
            format!("STARTUP={}", self.startup_command),
        ];
        env.extend(variable_env(&self.variables));

        let tcp = format!("{}/tcp", self.allocation.port);
        let udp = format!("{}/udp", self.allocation.port);
        let binding = vec![PortBinding {
            host_ip: Some(self.allocation.bind_address.clone()),
            host_port: Some(self.allocation.port.to_string()),
        }];
        let mut port_bindings = HashMap::new();
        port_bindings.insert(tcp.clone(), Some(binding.clone()));
        port_bindings.insert(udp.clone(), Some(binding));

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(tcp, HashMap::new());
        exposed_ports.insert(udp, HashMap::new());

        let mut labels = HashMap::new();
        labels.insert("pterodactyl.server.id".to_string(), self.server_id.clone());
        labels.insert(
            "pterodactyl.server.name".to_string(),
            self.server_name.clone(),
        );

        Config {
            image: Some(self.image.clone()),
            env: Some(env),
            user: Some("container".to_string()),
            working_dir: Some("/home/container".to_string()),
            labels: Some(labels),
            attach_stdin: Some(true),
            open_stdin: Some(true),
            tty: Some(true),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:/home/container", self.volume_dir)]),
                memory: Some(self.memory_limit),
                memory_swap: Some(self.memory_limit * 2),
                cpu_quota: Some((self.cpu_limit * 100_000.0) as i64),
                cpu_period: Some(100_000),
                network_mode: Some("bridge".to_string()),
                init: Some(true),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                readonly_paths: Some(
                    ["bus", "fs", "irq", "sys", "sysrq-trigger"]
                        .iter()
                        .map(|p| format!("/proc/{p}"))
                        .collect(),
                ),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: None,
                }),
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl InstallContainerSpec {
    pub fn to_config(&self) -> Config<String> {
        let mut env = vec!["DEBIAN_FRONTEND=noninteractive".to_string()];
        env.extend(variable_env(&self.variables));

        Config {
            image: Some(self.image.clone()),
            env: Some(env),
            working_dir: Some("/mnt/server".to_string()),
            tty: Some(true),
            cmd: Some(vec![
                self.entrypoint.clone(),
                "/mnt/server/.installation/install.sh".to_string(),
            ]),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:/mnt/server:rw", self.volume_dir)]),
                memory: Some(self.memory_limit),
                memory_swap: Some(self.memory_limit * 2),
                network_mode: Some("host".to_string()),
                privileged: Some(true),
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct ContainerGateway {
    docker: Docker,
}

impl ContainerGateway {
    pub fn connect() -> Result<Self, AppError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| AppError::ContainerOpFailed(format!("engine connect: {e}")))?;
        Ok(ContainerGateway { docker })
    }

    /// Pulls an image, draining the engine's progress stream to completion.
    /// Returning early would leave the image only partially present.
    pub async fn pull(&self, image: &str) -> Result<(), AppError> {
        debug!(image = %image, "Pulling image.");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None).boxed();

        let drain = async {
            while let Some(progress) = stream.next().await {
                progress.map_err(|e| AppError::ImagePullFailed {
                    image: image.to_string(),
                    reason: e.to_string(),
                })?;
            }
            Ok::<(), AppError>(())
        };

        timeout(PULL_TIMEOUT, drain)
            .await
            .map_err(|_| AppError::ImagePullFailed {
                image: image.to_string(),
                reason: "pull timed out".to_string(),
            })?
    }

    pub async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<String, AppError> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let response = timeout(
            ENGINE_OP_TIMEOUT,
            self.docker.create_container(Some(options), config),
        )
        .await
        .map_err(|_| AppError::ContainerOpFailed("create timed out".to_string()))??;
        for warning in &response.warnings {
            warn!(container = %name, warning = %warning, "Engine warning during create.");
        }
        Ok(response.id)
    }

    pub async fn start(&self, container_id: &str) -> Result<(), AppError> {
        timeout(
            ENGINE_OP_TIMEOUT,
            self.docker
                .start_container(container_id, None::<StartContainerOptions<String>>),
        )
        .await
        .map_err(|_| AppError::ContainerOpFailed("start timed out".to_string()))??;
        Ok(())
    }

    pub async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), AppError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        timeout(
            grace + STOP_MARGIN,
            self.docker.stop_container(container_id, Some(options)),
        )
        .await
        .map_err(|_| AppError::ContainerOpFailed("stop timed out".to_string()))??;
        Ok(())
    }

    pub async fn kill(&self, container_id: &str) -> Result<(), AppError> {
        timeout(
            ENGINE_OP_TIMEOUT,
            self.docker
                .kill_container(container_id, Some(KillContainerOptions { signal: "SIGKILL" })),
        )
        .await
        .map_err(|_| AppError::ContainerOpFailed("kill timed out".to_string()))??;
        Ok(())
    }

    pub async fn restart(&self, container_id: &str, grace: Duration) -> Result<(), AppError> {
        let options = RestartContainerOptions {
            t: grace.as_secs() as isize,
        };
        timeout(
            grace + STOP_MARGIN + ENGINE_OP_TIMEOUT,
            self.docker.restart_container(container_id, Some(options)),
        )
        .await
        .map_err(|_| AppError::ContainerOpFailed("restart timed out".to_string()))??;
        Ok(())
    }

    /// Force-removes a container. "Already gone" is success.
    pub async fn remove(
        &self,
        container_id: &str,
        remove_volumes: bool,
    ) -> Result<(), AppError> {
        let options = RemoveContainerOptions {
            force: true,
            v: remove_volumes,
            ..Default::default()
        };
        let result = timeout(
            ENGINE_OP_TIMEOUT,
            self.docker.remove_container(container_id, Some(options)),
        )
        .await
        .map_err(|_| AppError::ContainerOpFailed("remove timed out".to_string()))?;
        match result {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn inspect(&self, container_id: &str) -> Result<InspectSnapshot, AppError> {
        let response = timeout(
            ENGINE_OP_TIMEOUT,
            self.docker
                .inspect_container(container_id, None::<InspectContainerOptions>),
        )
        .await
        .map_err(|_| AppError::ContainerOpFailed("inspect timed out".to_string()))??;

        let state = response.state.unwrap_or_default();
        Ok(InspectSnapshot {
            state: state
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            running: state.running.unwrap_or(false),
            started_at: state.started_at,
            finished_at: state.finished_at,
            error: state.error.filter(|e| !e.is_empty()),
            exit_code: state.exit_code,
        })
    }

    /// Blocks until the container exits and yields its exit code.
    pub async fn wait(&self, container_id: &str, deadline: Duration) -> Result<i64, AppError> {
        let mut stream = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions<String>>)
            .boxed();
        let next = timeout(deadline, stream.next())
            .await
            .map_err(|_| AppError::ContainerOpFailed("wait timed out".to_string()))?;
        match next {
            Some(Ok(response)) => Ok(response.status_code),
            // The engine reports non-zero exits through the error channel.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(AppError::ContainerOpFailed(
                "wait stream ended without a status".to_string(),
            )),
        }
    }

    /// Follows the container's output as raw multiplexed bytes.
    ///
    /// bollard demultiplexes the engine stream client-side; the wire framing
    /// is restored here so the tail path handles multiplexed and TTY output
    /// through one parser.
    pub fn logs_follow(
        &self,
        container_id: &str,
        from_start: bool,
    ) -> BoxStream<'static, Result<Bytes, DockerError>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: if from_start {
                "all".to_string()
            } else {
                "0".to_string()
            },
            ..Default::default()
        };
        self.docker
            .logs(container_id, Some(options))
            .map(|item| item.map(reframe_log_output))
            .boxed()
    }

    /// One-shot resource statistics snapshot.
    pub async fn stats_once(&self, container_id: &str) -> Result<Option<Stats>, AppError> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(container_id, Some(options)).boxed();
        let next = timeout(ENGINE_OP_TIMEOUT, stream.next())
            .await
            .map_err(|_| AppError::ContainerOpFailed("stats timed out".to_string()))?;
        match next {
            Some(Ok(stats)) => Ok(Some(stats)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Writes one command line to the container's stdin via a
    /// non-signal-proxying attach. The writer is held open briefly so the
    /// engine flushes before the stream drops.
    pub async fn write_stdin(&self, container_id: &str, line: &str) -> Result<(), AppError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(false),
            stderr: Some(false),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };
        let mut attach = timeout(
            ENGINE_OP_TIMEOUT,
            self.docker.attach_container(container_id, Some(options)),
        )
        .await
        .map_err(|_| AppError::ContainerOpFailed("attach timed out".to_string()))??;

        attach
            .input
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| AppError::ContainerOpFailed(format!("stdin write: {e}")))?;
        attach
            .input
            .flush()
            .await
            .map_err(|e| AppError::ContainerOpFailed(format!("stdin flush: {e}")))?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}

fn reframe_log_output(output: LogOutput) -> Bytes {
    let (stream_type, payload) = match output {
        LogOutput::StdIn { message } => (0u8, message),
        LogOutput::StdOut { message } => (1u8, message),
        LogOutput::StdErr { message } => (2u8, message),
        // TTY mode delivers unframed bytes.
        LogOutput::Console { message } => return message,
    };
    let mut framed = BytesMut::with_capacity(payload.len() + 8);
    framed.put_u8(stream_type);
    framed.put_bytes(0, 3);
    framed.put_u32(payload.len() as u32);
    framed.extend_from_slice(&payload);
    framed.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_spec() -> RuntimeContainerSpec {
        RuntimeContainerSpec {
            server_id: "s1".to_string(),
            server_name: "Lobby".to_string(),
            image: "ghcr.io/argon/java:17".to_string(),
            volume_dir: "/var/lib/krypton/volumes/s1".to_string(),
            memory_limit: 1_073_741_824,
            cpu_limit: 1.5,
            allocation: Allocation {
                bind_address: "0.0.0.0".to_string(),
                port: 25565,
            },
            startup_command: "java -jar server.jar".to_string(),
            variables: vec![Variable {
                name: "Server Port".to_string(),
                default_value: "25565".to_string(),
                current_value: None,
                rules: "string".to_string(),
            }],
        }
    }

    #[test]
    fn test_runtime_config_resource_envelope() {
        let config = runtime_spec().to_config();
        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(1_073_741_824));
        assert_eq!(host.memory_swap, Some(2_147_483_648));
        assert_eq!(host.cpu_quota, Some(150_000));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(host.network_mode.as_deref(), Some("bridge"));
        assert_eq!(host.init, Some(true));
        assert_eq!(
            host.restart_policy.unwrap().name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
    }

    #[test]
    fn test_runtime_config_ports_and_labels() {
        let config = runtime_spec().to_config();
        let host = config.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();
        for key in ["25565/tcp", "25565/udp"] {
            let binding = &bindings[key].as_ref().unwrap()[0];
            assert_eq!(binding.host_ip.as_deref(), Some("0.0.0.0"));
            assert_eq!(binding.host_port.as_deref(), Some("25565"));
        }
        let labels = config.labels.unwrap();
        assert_eq!(labels["pterodactyl.server.id"], "s1");
        assert_eq!(labels["pterodactyl.server.name"], "Lobby");
    }

    #[test]
    fn test_runtime_config_env_and_identity() {
        let config = runtime_spec().to_config();
        assert_eq!(config.user.as_deref(), Some("container"));
        assert_eq!(config.working_dir.as_deref(), Some("/home/container"));
        let env = config.env.unwrap();
        assert!(env.contains(&"TERM=xterm".to_string()));
        assert!(env.contains(&"HOME=/home/container".to_string()));
        assert!(env.contains(&"STARTUP=java -jar server.jar".to_string()));
        assert!(env.contains(&"SERVER_PORT=25565".to_string()));
    }

    #[test]
    fn test_install_config_is_privileged_host_networked() {
        let spec = InstallContainerSpec {
            server_id: "s1".to_string(),
            image: "debian:bookworm".to_string(),
            entrypoint: "bash".to_string(),
            volume_dir: "/var/lib/krypton/volumes/s1".to_string(),
            memory_limit: 536_870_912,
            variables: vec![],
        };
        let config = spec.to_config();
        assert_eq!(
            config.cmd.unwrap(),
            vec!["bash", "/mnt/server/.installation/install.sh"]
        );
        assert_eq!(config.working_dir.as_deref(), Some("/mnt/server"));
        assert!(config.env.unwrap().contains(&"DEBIAN_FRONTEND=noninteractive".to_string()));
        let host = config.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("host"));
        assert_eq!(host.privileged, Some(true));
        assert_eq!(host.auto_remove, Some(true));
        assert_eq!(host.memory_swap, Some(1_073_741_824));
        assert_eq!(
            host.binds.unwrap(),
            vec!["/var/lib/krypton/volumes/s1:/mnt/server:rw"]
        );
    }

    #[test]
    fn test_reframe_restores_wire_format() {
        let framed = reframe_log_output(LogOutput::StdOut {
            message: Bytes::from_static(b"hello"),
        });
        assert_eq!(&framed[..], b"\x01\x00\x00\x00\x00\x00\x00\x05hello");

        let raw = reframe_log_output(LogOutput::Console {
            message: Bytes::from_static(b"tty bytes"),
        });
        assert_eq!(&raw[..], b"tty bytes");
    }
}
