//! The worker agent.
//!
//! One outer loop multiplexes heartbeat, assignment pulls, and status
//! pushes over a single manager connection; each assigned container gets
//! its own supervisor task that drives the runtime and reports through a
//! shared event channel (which serializes a container's reports).
//!
//! If every manager becomes unreachable the agent keeps running what is
//! already running and takes no lifecycle decisions; the next successful
//! sync reconciles.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use warren_client::WarrenClient;
use warren_config::WorkerConfig;
use warren_types::{
    ActualState, Container, ContainerHealth, ContainerId, DesiredState, NodeId, NodeResources,
    Timestamp,
};

use crate::backoff::Backoff;
use crate::docker::OWNER_LABEL;
use crate::probe::{run_probe, HealthTracker};
use crate::runtime::{CreateSpec, Runtime, RuntimeStatus};
use crate::{secrets, WorkerError};

/// Status reports flowing from supervisors to the agent loop.
#[derive(Debug)]
enum StatusEvent {
    Actual {
        container_id: ContainerId,
        actual: ActualState,
        runtime_handle: Option<String>,
    },
    Health {
        container_id: ContainerId,
        health: ContainerHealth,
    },
    /// The supervisor finished (container stopped and removed).
    Done { container_id: ContainerId },
}

struct Supervisor {
    desired_tx: watch::Sender<DesiredState>,
    task: tokio::task::JoinHandle<()>,
}

/// The long-lived worker agent.
pub struct WorkerAgent {
    node_id: NodeId,
    config: WorkerConfig,
    runtime: Arc<dyn Runtime>,
    client: WarrenClient,
    supervisors: HashMap<ContainerId, Supervisor>,
    events_tx: mpsc::Sender<StatusEvent>,
    /// Taken by `run`; the receiver must live outside `self` so the select
    /// arms can borrow the agent mutably.
    events_rx: Option<mpsc::Receiver<StatusEvent>>,
}

impl WorkerAgent {
    pub fn new(
        node_id: NodeId,
        config: WorkerConfig,
        runtime: Arc<dyn Runtime>,
        client: WarrenClient,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            node_id,
            config,
            runtime,
            client,
            supervisors: HashMap::new(),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Runs the agent until the process exits.
    pub async fn run(mut self) {
        let mut events_rx = self.events_rx.take().expect("run called once");
        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_ms));
        let mut sync = tokio::time::interval(Duration::from_millis(self.config.sync_ms));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(node = %self.node_id, "worker agent running");
        loop {
            tokio::select! {
                _ = heartbeat.tick() => self.heartbeat().await,
                _ = sync.tick() => self.sync().await,
                Some(event) = events_rx.recv() => self.push_status(event).await,
            }
        }
    }

    async fn heartbeat(&mut self) {
        let resources = advertised_resources();
        if let Err(err) = self
            .client
            .report_heartbeat(self.node_id, Some(resources))
            .await
        {
            debug!(error = %err, "heartbeat not delivered");
        }
    }

    /// Pulls this node's assignments and reconciles the supervisor set.
    async fn sync(&mut self) {
        let listed = match self.client.list_containers(None, Some(self.node_id)).await {
            Ok(listed) => listed,
            Err(err) => {
                // Cut off from the control plane: keep running containers
                // running, decide nothing.
                debug!(error = %err, "assignment pull failed; holding current state");
                return;
            }
        };

        let mut assigned: HashMap<ContainerId, Container> = HashMap::new();
        for wire in listed {
            match Container::try_from(wire) {
                Ok(container) => {
                    assigned.insert(container.id, container);
                }
                Err(err) => warn!(error = %err, "skipping malformed assignment"),
            }
        }

        // New and updated assignments.
        for (id, container) in &assigned {
            if let Some(supervisor) = self.supervisors.get(id) {
                supervisor.desired_tx.send_if_modified(|current| {
                    if *current == container.desired {
                        false
                    } else {
                        *current = container.desired;
                        true
                    }
                });
                continue;
            }
            // Terminal leftovers awaiting garbage collection need no task.
            if container.actual.is_terminal() && container.desired == DesiredState::Shutdown {
                continue;
            }
            if let Err(err) = self.adopt(container.clone()).await {
                warn!(container = %id, error = %err, "cannot start supervising");
            }
        }

        // Assignments that vanished were deleted from the store: drain
        // them. The supervisor stops and removes, then reports Done.
        for (id, supervisor) in &self.supervisors {
            if !assigned.contains_key(id) {
                supervisor.desired_tx.send_replace(DesiredState::Shutdown);
            }
        }

        self.reap_orphans(&assigned).await;
    }

    /// Spawns a supervisor, materializing secret mounts first.
    async fn adopt(&mut self, container: Container) -> Result<(), WorkerError> {
        let mut secret_files = Vec::new();
        if !container.spec.secrets.is_empty() {
            let fetched = self
                .client
                .fetch_container_secrets(&container.id.to_string())
                .await?;
            for secret_ref in &container.spec.secrets {
                let Some(file) = fetched.files.iter().find(|f| f.name == secret_ref.target)
                else {
                    return Err(WorkerError::MissingSecret(secret_ref.source.clone()));
                };
                secret_files.push((file.name.clone(), file.data.to_vec()));
            }
        }
        let secrets_mount = if secret_files.is_empty() {
            None
        } else {
            Some(secrets::prepare_mount(
                &self.config.secrets_dir,
                &container.id.to_string(),
                secret_files,
            )?)
        };

        let (desired_tx, desired_rx) = watch::channel(container.desired);
        let task = tokio::spawn(supervise(SuperviseCtx {
            container: container.clone(),
            runtime: self.runtime.clone(),
            desired: desired_rx,
            events: self.events_tx.clone(),
            secrets_mount,
            volumes_dir: self.config.volumes_dir.clone(),
            backoff_cap_ms: self.config.backoff_cap_ms,
            max_start_attempts: self.config.max_start_attempts,
            poll_ms: self.config.sync_ms,
        }));

        self.supervisors
            .insert(container.id, Supervisor { desired_tx, task });
        Ok(())
    }

    /// Removes runtime containers this agent no longer knows (left over
    /// from a crash) and that the store no longer assigns here.
    async fn reap_orphans(&mut self, assigned: &HashMap<ContainerId, Container>) {
        let labeled = match self.runtime.list_labeled(OWNER_LABEL).await {
            Ok(labeled) => labeled,
            Err(err) => {
                debug!(error = %err, "cannot list runtime containers");
                return;
            }
        };
        for (handle, label) in labeled {
            let known = label
                .parse::<ContainerId>()
                .ok()
                .map(|id| assigned.contains_key(&id) || self.supervisors.contains_key(&id))
                .unwrap_or(false);
            if known {
                continue;
            }
            info!(handle, "removing orphaned runtime container");
            let runtime = self.runtime.clone();
            tokio::spawn(async move {
                let _ = runtime.stop(&handle, 10_000).await;
                let _ = runtime.remove(&handle).await;
            });
        }
    }

    async fn push_status(&mut self, event: StatusEvent) {
        match event {
            StatusEvent::Actual {
                container_id,
                actual,
                runtime_handle,
            } => {
                if let Err(err) = self
                    .client
                    .update_container_status(&container_id.to_string(), actual, runtime_handle)
                    .await
                {
                    debug!(container = %container_id, error = %err, "status not delivered");
                }
            }
            StatusEvent::Health {
                container_id,
                health,
            } => {
                if let Err(err) = self
                    .client
                    .report_container_health(&container_id.to_string(), health)
                    .await
                {
                    debug!(container = %container_id, error = %err, "health not delivered");
                }
            }
            StatusEvent::Done { container_id } => {
                if let Some(supervisor) = self.supervisors.remove(&container_id) {
                    supervisor.task.abort();
                }
                secrets::wipe_mount(&self.config.secrets_dir, &container_id.to_string());
            }
        }
    }
}

/// What this host advertises at join and on every heartbeat.
pub fn advertised_resources() -> NodeResources {
    use sysinfo::System;
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();
    NodeResources {
        cpu_millis: (sys.cpus().len() as u64) * 1000,
        memory_bytes: sys.total_memory(),
    }
}

// ============================================================================
// Per-container supervision
// ============================================================================

struct SuperviseCtx {
    container: Container,
    runtime: Arc<dyn Runtime>,
    desired: watch::Receiver<DesiredState>,
    events: mpsc::Sender<StatusEvent>,
    secrets_mount: Option<PathBuf>,
    volumes_dir: PathBuf,
    backoff_cap_ms: u64,
    max_start_attempts: u32,
    poll_ms: u64,
}

/// Drives one container: desired state in, runtime actions out, status
/// transitions reported. The runtime is re-inspected on every pass; the
/// store's `actual` is never trusted locally.
async fn supervise(mut ctx: SuperviseCtx) {
    let id = ctx.container.id;
    let mut handle = ctx.container.runtime_handle.clone();
    let mut backoff = Backoff::new(500, ctx.backoff_cap_ms);
    let mut tracker: Option<HealthTracker> = None;
    let mut last_reported: Option<ActualState> = None;

    loop {
        let desired = *ctx.desired.borrow();
        match desired {
            DesiredState::Shutdown => {
                shutdown(&ctx, id, handle.as_deref(), &mut last_reported).await;
                let _ = ctx.events.send(StatusEvent::Done { container_id: id }).await;
                return;
            }
            DesiredState::Running => {
                let status = match &handle {
                    Some(h) => ctx.runtime.inspect(h).await.unwrap_or(RuntimeStatus::Absent),
                    None => RuntimeStatus::Absent,
                };

                match status {
                    RuntimeStatus::Absent | RuntimeStatus::Created => {
                        report(&ctx, id, ActualState::Starting, handle.clone(), &mut last_reported)
                            .await;
                        match bring_up(&ctx, status, handle.clone()).await {
                            Ok(new_handle) => {
                                handle = Some(new_handle.clone());
                                backoff.reset();
                                tracker = ctx
                                    .container
                                    .spec
                                    .healthcheck
                                    .as_ref()
                                    .map(|check| HealthTracker::new(check, Timestamp::now()));
                                report(
                                    &ctx,
                                    id,
                                    ActualState::Running,
                                    Some(new_handle),
                                    &mut last_reported,
                                )
                                .await;
                            }
                            Err(err) if err.is_transient()
                                && backoff.attempts() < ctx.max_start_attempts =>
                            {
                                let delay = backoff.next_delay();
                                debug!(container = %id, error = %err, ?delay, "retrying bring-up");
                                tokio::time::sleep(delay).await;
                            }
                            Err(err) => {
                                warn!(container = %id, error = %err, "bring-up failed");
                                report(&ctx, id, ActualState::Failed, handle.clone(), &mut last_reported)
                                    .await;
                                park_until_desired_changes(&mut ctx.desired).await;
                            }
                        }
                    }

                    RuntimeStatus::Running => {
                        report(&ctx, id, ActualState::Running, handle.clone(), &mut last_reported)
                            .await;
                        // Adopted after an agent restart: the container was
                        // already running, so the tracker starts here.
                        if tracker.is_none() {
                            tracker = ctx
                                .container
                                .spec
                                .healthcheck
                                .as_ref()
                                .map(|check| HealthTracker::new(check, Timestamp::now()));
                        }
                        monitor_once(&ctx, &mut tracker, handle.as_deref().unwrap_or("")).await;
                    }

                    RuntimeStatus::Exited(code) => {
                        // Workers never restart on their own; the
                        // reconciler decides replacement.
                        debug!(container = %id, code, "runtime container exited");
                        report(&ctx, id, ActualState::Failed, handle.clone(), &mut last_reported)
                            .await;
                        park_until_desired_changes(&mut ctx.desired).await;
                    }
                }
            }
        }
    }
}

/// Pull, create, start. Returns the runtime handle.
async fn bring_up(
    ctx: &SuperviseCtx,
    observed: RuntimeStatus,
    handle: Option<String>,
) -> Result<String, crate::runtime::RuntimeError> {
    // A created-but-not-started container just needs a start.
    if observed == RuntimeStatus::Created {
        if let Some(h) = handle {
            ctx.runtime.start(&h).await?;
            return Ok(h);
        }
    }

    ctx.runtime.pull_image(&ctx.container.spec.image).await?;

    let spec = create_spec(ctx);
    let new_handle = ctx.runtime.create(&spec).await?;
    ctx.runtime.start(&new_handle).await?;
    Ok(new_handle)
}

fn create_spec(ctx: &SuperviseCtx) -> CreateSpec {
    let container = &ctx.container;
    let mut binds = Vec::new();
    if let Some(mount) = &ctx.secrets_mount {
        binds.push((mount.display().to_string(), "/run/secrets".to_string(), true));
    }
    for volume_ref in &container.spec.volumes {
        let host = ctx.volumes_dir.join(&volume_ref.source);
        let _ = std::fs::create_dir_all(&host);
        binds.push((host.display().to_string(), volume_ref.target.clone(), false));
    }

    CreateSpec {
        name: format!("warren-{}", container.id),
        image: container.spec.image.clone(),
        env: container.spec.env.clone(),
        ports: container
            .spec
            .ports
            .iter()
            .map(|p| {
                (
                    p.published,
                    p.target,
                    p.protocol == warren_types::Protocol::Udp,
                )
            })
            .collect(),
        binds,
        cpu_millis: container.spec.limits.cpu_millis,
        memory_bytes: container.spec.limits.memory_bytes,
        labels: [(OWNER_LABEL.to_string(), container.id.to_string())]
            .into_iter()
            .collect(),
    }
}

/// One monitoring pass: run the probe (if any) and sleep an interval,
/// waking early if the desired state flips.
async fn monitor_once(ctx: &SuperviseCtx, tracker: &mut Option<HealthTracker>, handle: &str) {
    let mut sleep_ms = ctx.poll_ms;

    if let (Some(check), Some(tracker)) = (&ctx.container.spec.healthcheck, tracker.as_mut()) {
        let address = ctx.runtime.address(handle).await.ok().flatten();
        let passed = run_probe(
            &check.probe,
            address.as_deref(),
            ctx.runtime.as_ref(),
            handle,
            check.timeout_ms,
        )
        .await;
        if let Some(health) = tracker.observe(passed, Timestamp::now()) {
            let _ = ctx
                .events
                .send(StatusEvent::Health {
                    container_id: ctx.container.id,
                    health,
                })
                .await;
        }
        sleep_ms = check.interval_ms.max(1);
    }

    let mut desired = ctx.desired.clone();
    tokio::select! {
        () = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
        _ = desired.changed() => {}
    }
}

async fn shutdown(
    ctx: &SuperviseCtx,
    id: ContainerId,
    handle: Option<&str>,
    last_reported: &mut Option<ActualState>,
) {
    if let Some(h) = handle {
        match ctx.runtime.inspect(h).await {
            Ok(RuntimeStatus::Running | RuntimeStatus::Created) => {
                report(ctx, id, ActualState::Stopping, Some(h.to_string()), last_reported).await;
                if let Err(err) = ctx
                    .runtime
                    .stop(h, ctx.container.spec.stop_timeout_ms)
                    .await
                {
                    warn!(container = %id, error = %err, "stop failed; forcing removal");
                }
            }
            _ => {}
        }
        let _ = ctx.runtime.remove(h).await;
    }
    report(ctx, id, ActualState::Stopped, handle.map(str::to_string), last_reported).await;
}

async fn report(
    ctx: &SuperviseCtx,
    id: ContainerId,
    actual: ActualState,
    runtime_handle: Option<String>,
    last_reported: &mut Option<ActualState>,
) {
    if *last_reported == Some(actual) {
        return;
    }
    *last_reported = Some(actual);
    let _ = ctx
        .events
        .send(StatusEvent::Actual {
            container_id: id,
            actual,
            runtime_handle,
        })
        .await;
}

async fn park_until_desired_changes(desired: &mut watch::Receiver<DesiredState>) {
    let _ = desired.changed().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeRuntime;
    use std::collections::BTreeMap;
    use warren_types::{
        ContainerSpec, HealthCheck, HealthState, ProbeSpec, ResourceLimits, ServiceId,
    };

    fn test_container(healthcheck: Option<HealthCheck>) -> Container {
        Container {
            id: ContainerId::from_bytes([7; 16]),
            service_id: ServiceId::from_bytes([1; 16]),
            node_id: NodeId::from_bytes([2; 16]),
            replica: 1,
            version: 1,
            spec: ContainerSpec {
                image: "nginx:1.25".into(),
                env: BTreeMap::new(),
                ports: Vec::new(),
                secrets: Vec::new(),
                volumes: Vec::new(),
                healthcheck,
                limits: ResourceLimits::default(),
                stop_timeout_ms: 1_000,
            },
            desired: DesiredState::Running,
            actual: ActualState::Pending,
            health: ContainerHealth::default(),
            runtime_handle: None,
            created: Timestamp::ZERO,
            updated: Timestamp::ZERO,
        }
    }

    struct Harness {
        runtime: Arc<FakeRuntime>,
        desired_tx: watch::Sender<DesiredState>,
        events: mpsc::Receiver<StatusEvent>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn(container: Container, runtime: Arc<FakeRuntime>) -> Harness {
        let (desired_tx, desired) = watch::channel(container.desired);
        let (events_tx, events) = mpsc::channel(64);
        let runtime_dyn: Arc<dyn Runtime> = runtime.clone();
        let task = tokio::spawn(supervise(SuperviseCtx {
            container,
            runtime: runtime_dyn,
            desired,
            events: events_tx,
            secrets_mount: None,
            volumes_dir: std::env::temp_dir().join("warren-test-volumes"),
            backoff_cap_ms: 50,
            max_start_attempts: 3,
            poll_ms: 10,
        }));
        Harness {
            runtime,
            desired_tx,
            events,
            task,
        }
    }

    async fn next_actual(harness: &mut Harness) -> ActualState {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), harness.events.recv())
                .await
                .expect("timed out waiting for a status event")
                .expect("event channel closed")
            {
                StatusEvent::Actual { actual, .. } => return actual,
                StatusEvent::Health { .. } | StatusEvent::Done { .. } => {}
            }
        }
    }

    #[tokio::test]
    async fn brings_a_container_up_and_reports_transitions() {
        let mut harness = spawn(test_container(None), Arc::new(FakeRuntime::new()));

        assert_eq!(next_actual(&mut harness).await, ActualState::Starting);
        assert_eq!(next_actual(&mut harness).await, ActualState::Running);
        assert_eq!(harness.runtime.running_count(), 1);

        harness.task.abort();
    }

    #[tokio::test]
    async fn transient_pull_errors_are_retried() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_pulls("nginx:1.25", 2);
        let mut harness = spawn(test_container(None), runtime);

        assert_eq!(next_actual(&mut harness).await, ActualState::Starting);
        assert_eq!(next_actual(&mut harness).await, ActualState::Running);

        harness.task.abort();
    }

    #[tokio::test]
    async fn persistent_pull_errors_become_failed() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_pulls("nginx:1.25", 99);
        let mut harness = spawn(test_container(None), runtime);

        assert_eq!(next_actual(&mut harness).await, ActualState::Starting);
        assert_eq!(next_actual(&mut harness).await, ActualState::Failed);

        harness.task.abort();
    }

    #[tokio::test]
    async fn crash_is_reported_not_restarted() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut harness = spawn(test_container(None), runtime.clone());
        assert_eq!(next_actual(&mut harness).await, ActualState::Starting);
        assert_eq!(next_actual(&mut harness).await, ActualState::Running);

        runtime.crash("fake-1", 137);
        assert_eq!(next_actual(&mut harness).await, ActualState::Failed);
        // No second runtime container appears.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runtime.running_count(), 0);

        harness.task.abort();
    }

    #[tokio::test]
    async fn shutdown_stops_removes_and_finishes() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut harness = spawn(test_container(None), runtime.clone());
        assert_eq!(next_actual(&mut harness).await, ActualState::Starting);
        assert_eq!(next_actual(&mut harness).await, ActualState::Running);

        harness.desired_tx.send_replace(DesiredState::Shutdown);
        assert_eq!(next_actual(&mut harness).await, ActualState::Stopping);
        assert_eq!(next_actual(&mut harness).await, ActualState::Stopped);

        // Runtime container is gone and the task finished on its own.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.running_count(), 0);
        assert!(harness.task.is_finished());
    }

    #[tokio::test]
    async fn exec_probe_reports_health() {
        let check = HealthCheck {
            probe: ProbeSpec::Exec {
                command: vec!["true".into()],
            },
            interval_ms: 10,
            timeout_ms: 100,
            retries: 2,
            success_threshold: 1,
            start_period_ms: 0,
        };
        let runtime = Arc::new(FakeRuntime::new());
        let mut harness = spawn(test_container(Some(check)), runtime);

        let health = loop {
            match tokio::time::timeout(Duration::from_secs(5), harness.events.recv())
                .await
                .expect("timed out")
                .expect("closed")
            {
                StatusEvent::Health { health, .. } => break health,
                _ => {}
            }
        };
        assert_eq!(health.state, HealthState::Healthy);

        harness.task.abort();
    }
}
