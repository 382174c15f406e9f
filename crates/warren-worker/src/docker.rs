//! Docker-backed [`Runtime`] via bollard.
//!
//! The worker labels every container it creates with the orchestrator
//! container ID, which is how crashed-agent orphans are found again after
//! a restart.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use tracing::debug;

use crate::runtime::{CreateSpec, Runtime, RuntimeError, RuntimeStatus};

/// Label key carrying the orchestrator container ID.
pub const OWNER_LABEL: &str = "io.warren.container-id";

/// Docker engine driver.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the local daemon (unix socket or platform default).
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Permanent(format!("cannot reach docker daemon: {e}")))?;
        Ok(Self { docker })
    }
}

fn classify(err: bollard::errors::Error, handle: &str) -> RuntimeError {
    use bollard::errors::Error as E;
    match err {
        E::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(handle.to_string()),
        E::DockerResponseServerError {
            status_code: 400 | 409,
            message,
        } => RuntimeError::Permanent(message),
        other => RuntimeError::Transient(other.to_string()),
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    message,
                } => RuntimeError::Permanent(format!("no such image: {message}")),
                other => RuntimeError::Transient(other.to_string()),
            })?;
        }
        debug!(image, "image pulled");
        Ok(())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String, RuntimeError> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for (host, target, udp) in &spec.ports {
            let proto = if *udp { "udp" } else { "tcp" };
            let key = format!("{target}/{proto}");
            exposed.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host.to_string()),
                }]),
            );
        }

        let binds: Vec<String> = spec
            .binds
            .iter()
            .map(|(host, target, read_only)| {
                if *read_only {
                    format!("{host}:{target}:ro")
                } else {
                    format!("{host}:{target}")
                }
            })
            .collect();

        let host_config = HostConfig {
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            binds: (!binds.is_empty()).then_some(binds),
            memory: spec.memory_bytes.map(|b| b as i64),
            nano_cpus: spec.cpu_millis.map(|m| (m as i64) * 1_000_000),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: (!exposed.is_empty()).then_some(exposed),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| classify(e, &spec.name))?;
        Ok(created.id)
    }

    async fn start(&self, handle: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(handle, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify(e, handle))
    }

    async fn stop(&self, handle: &str, timeout_ms: u64) -> Result<(), RuntimeError> {
        // Docker sends the soft signal, waits `t` seconds, then SIGKILLs.
        let t = (timeout_ms / 1_000).max(1) as i64;
        match self
            .docker
            .stop_container(handle, Some(StopContainerOptions { t }))
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped is success for an idempotent stop.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, handle)),
        }
    }

    async fn remove(&self, handle: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, handle)),
        }
    }

    async fn inspect(&self, handle: &str) -> Result<RuntimeStatus, RuntimeError> {
        let inspection = match self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspection) => inspection,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(RuntimeStatus::Absent),
            Err(e) => return Err(classify(e, handle)),
        };

        let state = inspection.state.unwrap_or_default();
        if state.running.unwrap_or(false) {
            Ok(RuntimeStatus::Running)
        } else if state.exit_code.is_some() || state.finished_at.is_some() {
            Ok(RuntimeStatus::Exited(state.exit_code.unwrap_or(-1)))
        } else {
            Ok(RuntimeStatus::Created)
        }
    }

    async fn address(&self, handle: &str) -> Result<Option<String>, RuntimeError> {
        let inspection = self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(e, handle))?;
        let ip = inspection
            .network_settings
            .and_then(|n| n.ip_address)
            .filter(|ip| !ip.is_empty());
        Ok(ip)
    }

    async fn exec(&self, handle: &str, command: &[String]) -> Result<i64, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                handle,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify(e, handle))?;

        let started = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| classify(e, handle))?;
        if let StartExecResults::Attached { mut output, .. } = started {
            while output.next().await.is_some() {}
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| classify(e, handle))?;
        Ok(inspected.exit_code.unwrap_or(-1))
    }

    async fn list_labeled(&self, label_key: &str) -> Result<Vec<(String, String)>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label_key.to_string()]);
        let listed = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::Transient(e.to_string()))?;

        Ok(listed
            .into_iter()
            .filter_map(|c| {
                let handle = c.id?;
                let value = c.labels.as_ref()?.get(label_key)?.clone();
                Some((handle, value))
            })
            .collect())
    }
}
