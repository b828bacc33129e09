//! Facade tying registry, planner, config building, and supervision together.
//!
//! Callers start/stop modes here and observe everything else through watch
//! cells; no state is mutated from the outside.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::model_info::ModelInfo;
use crate::planner::plan_distribution;
use crate::registry::{WorkerDescriptor, WorkerFilter, WorkerRegistry};
use crate::server_config::{master_launch, worker_launch, AppPaths, WorkerOptions};
use crate::settings::ServerSettings;
use crate::supervisor::{RollingLog, ServerRole, ServerSession, ServerState};
use crate::{log_info, log_warn};

/// Which distributed role this device currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributedMode {
    None,
    Master,
    Worker,
}

/// One supervised role slot. The generation counter fences stale mirror
/// tasks: a task may only write through the coordinator cells while its
/// session is still the current one.
struct RoleSlot {
    session: Mutex<Option<Arc<ServerSession>>>,
    generation: AtomicU64,
    state_tx: Arc<watch::Sender<ServerState>>,
}

impl RoleSlot {
    fn new() -> Self {
        Self {
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            state_tx: Arc::new(watch::channel(ServerState::Stopped).0),
        }
    }
}

struct Inner {
    paths: AppPaths,
    registry: Arc<WorkerRegistry>,
    master: RoleSlot,
    worker: RoleSlot,
    mode_tx: Arc<watch::Sender<DistributedMode>>,
    running_tx: Arc<watch::Sender<bool>>,
    connection_tx: Arc<watch::Sender<u32>>,
    master_ram_tx: Arc<watch::Sender<u64>>,
    model_layers_tx: Arc<watch::Sender<u32>>,
    remote_layers_tx: Arc<watch::Sender<u32>>,
    model_size_tx: Arc<watch::Sender<u64>>,
    transfer_progress_tx: Arc<watch::Sender<u8>>,
}

impl Inner {
    fn slot(&self, role: ServerRole) -> &RoleSlot {
        match role {
            ServerRole::LocalServer => &self.master,
            ServerRole::RpcWorker => &self.worker,
        }
    }

    /// Recompute mode/running from the live slots. The most recently started
    /// role wins the mode cell, so this only runs on stop/exit paths.
    fn refresh_mode(&self) {
        let master_active = self.master.session.lock().expect("slot poisoned").is_some();
        let worker_active = self.worker.session.lock().expect("slot poisoned").is_some();
        let mode = if master_active {
            DistributedMode::Master
        } else if worker_active {
            DistributedMode::Worker
        } else {
            DistributedMode::None
        };
        self.mode_tx.send_replace(mode);
        self.running_tx.send_replace(master_active || worker_active);
    }

    fn after_session_end(&self, role: ServerRole) {
        if role == ServerRole::RpcWorker {
            self.connection_tx.send_replace(0);
        }
        self.transfer_progress_tx.send_replace(0);
        self.refresh_mode();
    }
}

/// Coordinator for distributed inference sessions.
pub struct MeshCoordinator {
    inner: Arc<Inner>,
    local_ip: Option<String>,
}

impl MeshCoordinator {
    pub fn new(paths: AppPaths, registry: Arc<WorkerRegistry>) -> Self {
        let inner = Inner {
            paths,
            registry,
            master: RoleSlot::new(),
            worker: RoleSlot::new(),
            mode_tx: Arc::new(watch::channel(DistributedMode::None).0),
            running_tx: Arc::new(watch::channel(false).0),
            connection_tx: Arc::new(watch::channel(0u32).0),
            master_ram_tx: Arc::new(watch::channel(default_master_ram_mb()).0),
            model_layers_tx: Arc::new(watch::channel(0u32).0),
            remote_layers_tx: Arc::new(watch::channel(0u32).0),
            model_size_tx: Arc::new(watch::channel(0u64).0),
            transfer_progress_tx: Arc::new(watch::channel(0u8).0),
        };
        Self {
            inner: Arc::new(inner),
            local_ip: local_ip(),
        }
    }

    /// Enter master mode: plan the distribution over the enabled workers,
    /// launch the local server, and supervise it. An already-active master
    /// session is stopped first.
    pub async fn start_master(
        &self,
        model: &ModelInfo,
        settings: &ServerSettings,
    ) -> Result<(), String> {
        self.stop(ServerRole::LocalServer).await;

        let inner = &self.inner;
        let participants: Vec<WorkerDescriptor> = inner
            .registry
            .list(WorkerFilter::EnabledOnly)
            .into_iter()
            .filter(|w| w.connected)
            .collect();
        let addresses: Vec<String> = participants.iter().map(WorkerDescriptor::address).collect();

        let master_ram = *inner.master_ram_tx.borrow();
        let plan = plan_distribution(
            model.total_layers,
            model.size_mb(),
            master_ram,
            &participants,
        );

        // Publish the numbers the visualization layer draws from.
        let total = plan
            .as_ref()
            .map(|p| p.total_layers)
            .or(model.total_layers)
            .unwrap_or(0);
        let remote = plan.as_ref().map_or(0, |p| p.remote_layers);
        inner.model_layers_tx.send_replace(total);
        inner.remote_layers_tx.send_replace(remote);
        inner.model_size_tx.send_replace(model.size_mb());
        log_info!(
            "Master plan: {total} layers, {remote} to workers ({} participants), {} MB",
            participants.len(),
            model.size_mb()
        );

        // Record per-worker layer ranges for display, remote pool first.
        if let Some(plan) = &plan {
            let mut next = plan.master_layers();
            for (worker, count) in participants.iter().zip(plan.per_worker_layers()) {
                let range = (count > 0).then(|| (next, next + count - 1));
                inner
                    .registry
                    .set_assigned_layers(&worker.host, worker.port, range);
                next += count;
            }
        }

        if let Err(e) = inner.paths.ensure_exist() {
            self.fail(ServerRole::LocalServer, &e);
            return Err(e);
        }
        let launch = match master_launch(
            &inner.paths,
            &model.path,
            settings,
            plan.as_ref(),
            &addresses,
        ) {
            Ok(launch) => launch,
            Err(e) => {
                self.fail(ServerRole::LocalServer, &e);
                return Err(e);
            }
        };

        let session = match ServerSession::spawn(ServerRole::LocalServer, &launch, settings.port) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                self.fail(ServerRole::LocalServer, &e);
                return Err(e);
            }
        };

        for worker in &participants {
            inner
                .registry
                .update_connection_state(&worker.host, worker.port, true);
        }

        self.install(ServerRole::LocalServer, session, DistributedMode::Master);
        Ok(())
    }

    /// Enter worker mode: launch the remote compute server on the given
    /// port. An already-active worker session is stopped first.
    pub async fn start_worker(&self, options: &WorkerOptions) -> Result<(), String> {
        self.stop(ServerRole::RpcWorker).await;

        let inner = &self.inner;
        if let Err(e) = inner.paths.ensure_exist() {
            self.fail(ServerRole::RpcWorker, &e);
            return Err(e);
        }
        let launch = match worker_launch(&inner.paths, options) {
            Ok(launch) => launch,
            Err(e) => {
                self.fail(ServerRole::RpcWorker, &e);
                return Err(e);
            }
        };

        let session = match ServerSession::spawn(ServerRole::RpcWorker, &launch, options.port) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                self.fail(ServerRole::RpcWorker, &e);
                return Err(e);
            }
        };

        inner.connection_tx.send_replace(0);
        self.install(ServerRole::RpcWorker, session, DistributedMode::Worker);
        Ok(())
    }

    /// Stop the given role. Idempotent: safe to call when nothing runs.
    pub async fn stop(&self, role: ServerRole) {
        let inner = &self.inner;
        let slot = inner.slot(role);
        let taken = {
            let mut guard = slot.session.lock().expect("slot poisoned");
            slot.generation.fetch_add(1, Ordering::SeqCst);
            slot.state_tx.send_replace(ServerState::Stopped);
            guard.take()
        };
        if let Some(session) = taken {
            session.stop();
        }
        inner.after_session_end(role);
    }

    pub async fn stop_all(&self) {
        self.stop(ServerRole::LocalServer).await;
        self.stop(ServerRole::RpcWorker).await;
    }

    // ---- observable state ----

    pub fn mode(&self) -> watch::Receiver<DistributedMode> {
        self.inner.mode_tx.subscribe()
    }

    pub fn current_mode(&self) -> DistributedMode {
        *self.inner.mode_tx.borrow()
    }

    pub fn running(&self) -> watch::Receiver<bool> {
        self.inner.running_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running_tx.borrow()
    }

    pub fn state(&self, role: ServerRole) -> watch::Receiver<ServerState> {
        self.inner.slot(role).state_tx.subscribe()
    }

    pub fn current_state(&self, role: ServerRole) -> ServerState {
        self.inner.slot(role).state_tx.borrow().clone()
    }

    /// Live connection count while in worker mode.
    pub fn connection_count(&self) -> watch::Receiver<u32> {
        self.inner.connection_tx.subscribe()
    }

    /// Rolling diagnostic log of the active worker session, if any.
    pub fn worker_logs(&self) -> Option<Arc<RollingLog>> {
        self.inner
            .worker
            .session
            .lock()
            .expect("slot poisoned")
            .as_ref()
            .map(|s| s.logs())
    }

    pub fn workers(&self) -> Vec<WorkerDescriptor> {
        self.inner.registry.list(WorkerFilter::All)
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.inner.registry
    }

    pub fn master_ram_mb(&self) -> u64 {
        *self.inner.master_ram_tx.borrow()
    }

    pub fn set_master_ram_mb(&self, ram_mb: u64) {
        self.inner.master_ram_tx.send_replace(ram_mb);
    }

    pub fn model_layer_count(&self) -> watch::Receiver<u32> {
        self.inner.model_layers_tx.subscribe()
    }

    pub fn remote_layer_count(&self) -> watch::Receiver<u32> {
        self.inner.remote_layers_tx.subscribe()
    }

    pub fn model_size_mb(&self) -> watch::Receiver<u64> {
        self.inner.model_size_tx.subscribe()
    }

    pub fn transfer_progress(&self) -> watch::Receiver<u8> {
        self.inner.transfer_progress_tx.subscribe()
    }

    pub fn set_transfer_progress(&self, progress: u8) {
        self.inner.transfer_progress_tx.send_replace(progress.min(100));
    }

    /// IPv4 address workers should dial, when one could be determined.
    pub fn local_ip(&self) -> Option<&str> {
        self.local_ip.as_deref()
    }

    // ---- internals ----

    fn install(&self, role: ServerRole, session: Arc<ServerSession>, mode: DistributedMode) {
        let inner = &self.inner;
        let generation = {
            let slot = inner.slot(role);
            let mut guard = slot.session.lock().expect("slot poisoned");
            let generation = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;
            slot.state_tx.send_replace(session.current_state());
            *guard = Some(session.clone());
            generation
        };
        inner.mode_tx.send_replace(mode);
        inner.running_tx.send_replace(true);
        mirror_session(inner.clone(), role, session, generation);
    }

    fn fail(&self, role: ServerRole, message: &str) {
        log_warn!("[{}] Launch failed: {message}", role.tag());
        let inner = &self.inner;
        let slot = inner.slot(role);
        {
            let mut guard = slot.session.lock().expect("slot poisoned");
            slot.generation.fetch_add(1, Ordering::SeqCst);
            slot.state_tx.send_replace(ServerState::Error {
                message: message.to_string(),
            });
            *guard = None;
        }
        inner.refresh_mode();
    }
}

/// Forward session state and connection count into the coordinator cells
/// until the session reaches a terminal state. Writes are fenced by the
/// slot generation so a replaced session cannot clobber its successor.
fn mirror_session(
    inner: Arc<Inner>,
    role: ServerRole,
    session: Arc<ServerSession>,
    generation: u64,
) {
    tokio::spawn(async move {
        let mut state_rx = session.state();
        let mut conn_rx = session.connections();
        loop {
            let state = state_rx.borrow_and_update().clone();
            let count = *conn_rx.borrow_and_update();
            {
                let slot = inner.slot(role);
                let _guard = slot.session.lock().expect("slot poisoned");
                if slot.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                slot.state_tx.send_replace(state.clone());
                if role == ServerRole::RpcWorker {
                    inner.connection_tx.send_replace(count);
                }
            }
            if state.is_terminal() {
                break;
            }
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = conn_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        // The session ended on its own. Clean up if it is still current.
        let still_current = {
            let slot = inner.slot(role);
            let mut guard = slot.session.lock().expect("slot poisoned");
            if slot.generation.load(Ordering::SeqCst) == generation {
                slot.generation.fetch_add(1, Ordering::SeqCst);
                *guard = None;
                true
            } else {
                false
            }
        };
        if still_current {
            if let Some(exit) = session.exit_info() {
                if !exit.intentional {
                    log_warn!(
                        "[{}] Session terminated unexpectedly (exit code {:?})",
                        role.tag(),
                        exit.code
                    );
                }
            }
            inner.after_session_end(role);
        }
    });
}

/// Best-effort local IPv4 discovery. Connecting a UDP socket sends no
/// packets; it only asks the OS which interface would route there.
pub fn local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

/// Default master RAM budget: the memory currently available on this device,
/// with a floor so a busy machine still plans something sensible.
fn default_master_ram_mb() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let available_mb = sys.available_memory() / (1024 * 1024);
    if available_mb == 0 {
        4096
    } else {
        available_mb.max(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_config::SERVER_BINARY_ENV;

    fn coordinator() -> MeshCoordinator {
        let base = std::env::temp_dir().join("llama_mesh_coord_test");
        MeshCoordinator::new(AppPaths::in_dir(&base), Arc::new(WorkerRegistry::new()))
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_when_nothing_runs() {
        let coordinator = coordinator();
        coordinator.stop(ServerRole::LocalServer).await;
        assert_eq!(
            coordinator.current_state(ServerRole::LocalServer),
            ServerState::Stopped
        );
        coordinator.stop(ServerRole::LocalServer).await;
        assert_eq!(
            coordinator.current_state(ServerRole::LocalServer),
            ServerState::Stopped
        );
        assert!(!coordinator.is_running());
        assert_eq!(coordinator.current_mode(), DistributedMode::None);
    }

    #[tokio::test]
    async fn test_missing_binary_surfaces_launch_error_and_resets_mode() {
        let coordinator = coordinator();
        std::env::set_var(SERVER_BINARY_ENV, "/definitely/not/llama-server");
        let model = ModelInfo {
            path: "/models/m.gguf".to_string(),
            architecture: "llama".to_string(),
            total_layers: Some(32),
            context_length: Some(8192),
            size_bytes: 4 * 1024 * 1024 * 1024,
        };
        let result = coordinator
            .start_master(&model, &ServerSettings::default())
            .await;
        std::env::remove_var(SERVER_BINARY_ENV);

        let err = result.unwrap_err();
        assert!(err.contains("does not exist"), "unexpected error: {err}");
        match coordinator.current_state(ServerRole::LocalServer) {
            ServerState::Error { message } => assert_eq!(message, err),
            other => panic!("expected Error state, got {other:?}"),
        }
        assert_eq!(coordinator.current_mode(), DistributedMode::None);
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn test_transfer_progress_is_clamped() {
        let coordinator = coordinator();
        coordinator.set_transfer_progress(250);
        assert_eq!(*coordinator.transfer_progress().borrow(), 100);
    }

    #[test]
    fn test_default_master_ram_has_floor() {
        assert!(default_master_ram_mb() >= 1024);
    }
}
