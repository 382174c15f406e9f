//! The container-runtime seam.
//!
//! The worker drives containers through this trait; `DockerRuntime` is the
//! one concrete implementation, and tests use [`FakeRuntime`] to script
//! runtime behavior. The runtime is the source of truth for existence:
//! every lifecycle action re-inspects rather than trusting cached state.

use std::collections::BTreeMap;

use async_trait::async_trait;

/// What the runtime reports about a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    /// No such container.
    Absent,
    /// Created but not started.
    Created,
    Running,
    /// Exited with this code.
    Exited(i64),
}

/// Instructions for creating a runtime container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSpec {
    /// Runtime-visible name (unique per orchestrator container).
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// `(host_port, container_port, udp)` publications.
    pub ports: Vec<(u16, u16, bool)>,
    /// `(host_path, container_path, read_only)` bind mounts.
    pub binds: Vec<(String, String, bool)>,
    pub cpu_millis: Option<u64>,
    pub memory_bytes: Option<u64>,
    /// Labels identify containers owned by this orchestrator.
    pub labels: BTreeMap<String, String>,
}

/// Runtime failures, classified for retry policy.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    /// Worth retrying with backoff (daemon hiccup, registry timeout).
    #[error("transient runtime error: {0}")]
    Transient(String),

    /// The referenced container does not exist.
    #[error("no such container: {0}")]
    NotFound(String),

    /// Not going to get better by retrying (bad image name, bad config).
    #[error("runtime rejected the request: {0}")]
    Permanent(String),
}

impl RuntimeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Transient(_))
    }
}

/// Container lifecycle calls the worker issues. All idempotent.
#[async_trait]
pub trait Runtime: Send + Sync + 'static {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Creates the container and returns its runtime handle.
    async fn create(&self, spec: &CreateSpec) -> Result<String, RuntimeError>;

    async fn start(&self, handle: &str) -> Result<(), RuntimeError>;

    /// Soft signal, wait up to `timeout_ms`, then force-kill.
    async fn stop(&self, handle: &str, timeout_ms: u64) -> Result<(), RuntimeError>;

    async fn remove(&self, handle: &str) -> Result<(), RuntimeError>;

    async fn inspect(&self, handle: &str) -> Result<RuntimeStatus, RuntimeError>;

    /// Container's address for network probes, when it has one.
    async fn address(&self, handle: &str) -> Result<Option<String>, RuntimeError>;

    /// Runs a command in the container; returns its exit code.
    async fn exec(&self, handle: &str, command: &[String]) -> Result<i64, RuntimeError>;

    /// Handles of containers carrying the given label key=value.
    async fn list_labeled(
        &self,
        label_key: &str,
    ) -> Result<Vec<(String, String)>, RuntimeError>;
}

/// Scriptable in-memory runtime for tests.
#[cfg(any(test, feature = "fake-runtime"))]
pub use fake::FakeRuntime;

#[cfg(any(test, feature = "fake-runtime"))]
mod fake {
    use super::{CreateSpec, Runtime, RuntimeError, RuntimeStatus};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct FakeState {
        containers: BTreeMap<String, (CreateSpec, RuntimeStatus)>,
        next: u64,
        /// Images that fail to pull with a transient error.
        flaky_images: Vec<String>,
        pull_attempts: BTreeMap<String, u32>,
    }

    /// An in-memory runtime whose containers run until told otherwise.
    #[derive(Debug, Default)]
    pub struct FakeRuntime {
        state: Mutex<FakeState>,
    }

    impl FakeRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes `image` fail its first `attempts` pulls.
        pub fn fail_pulls(&self, image: &str, attempts: u32) {
            let mut state = self.state.lock().unwrap();
            state.flaky_images.push(image.to_string());
            state.pull_attempts.insert(image.to_string(), attempts);
        }

        /// Simulates the containerized process dying.
        pub fn crash(&self, handle: &str, code: i64) {
            let mut state = self.state.lock().unwrap();
            if let Some((_, status)) = state.containers.get_mut(handle) {
                *status = RuntimeStatus::Exited(code);
            }
        }

        pub fn status_of(&self, handle: &str) -> RuntimeStatus {
            self.state
                .lock()
                .unwrap()
                .containers
                .get(handle)
                .map_or(RuntimeStatus::Absent, |(_, s)| *s)
        }

        pub fn running_count(&self) -> usize {
            self.state
                .lock()
                .unwrap()
                .containers
                .values()
                .filter(|(_, s)| *s == RuntimeStatus::Running)
                .count()
        }
    }

    #[async_trait]
    impl Runtime for FakeRuntime {
        async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
            let mut state = self.state.lock().unwrap();
            if let Some(remaining) = state.pull_attempts.get_mut(image) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(RuntimeError::Transient(format!(
                        "registry timeout pulling {image}"
                    )));
                }
            }
            Ok(())
        }

        async fn create(&self, spec: &CreateSpec) -> Result<String, RuntimeError> {
            let mut state = self.state.lock().unwrap();
            state.next += 1;
            let handle = format!("fake-{}", state.next);
            state
                .containers
                .insert(handle.clone(), (spec.clone(), RuntimeStatus::Created));
            Ok(handle)
        }

        async fn start(&self, handle: &str) -> Result<(), RuntimeError> {
            let mut state = self.state.lock().unwrap();
            match state.containers.get_mut(handle) {
                Some((_, status)) => {
                    *status = RuntimeStatus::Running;
                    Ok(())
                }
                None => Err(RuntimeError::NotFound(handle.to_string())),
            }
        }

        async fn stop(&self, handle: &str, _timeout_ms: u64) -> Result<(), RuntimeError> {
            let mut state = self.state.lock().unwrap();
            if let Some((_, status)) = state.containers.get_mut(handle) {
                *status = RuntimeStatus::Exited(0);
            }
            Ok(())
        }

        async fn remove(&self, handle: &str) -> Result<(), RuntimeError> {
            self.state.lock().unwrap().containers.remove(handle);
            Ok(())
        }

        async fn inspect(&self, handle: &str) -> Result<RuntimeStatus, RuntimeError> {
            Ok(self.status_of(handle))
        }

        async fn address(&self, _handle: &str) -> Result<Option<String>, RuntimeError> {
            Ok(Some("127.0.0.1".to_string()))
        }

        async fn exec(&self, handle: &str, _command: &[String]) -> Result<i64, RuntimeError> {
            match self.status_of(handle) {
                RuntimeStatus::Running => Ok(0),
                _ => Err(RuntimeError::NotFound(handle.to_string())),
            }
        }

        async fn list_labeled(
            &self,
            label_key: &str,
        ) -> Result<Vec<(String, String)>, RuntimeError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .containers
                .iter()
                .filter_map(|(handle, (spec, _))| {
                    spec.labels
                        .get(label_key)
                        .map(|v| (handle.clone(), v.clone()))
                })
                .collect())
        }
    }
}
