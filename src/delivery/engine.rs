use crate::delivery::backend::{InstallBackend, InstallListener, ListenerId};
use crate::delivery::config::{DeliveryConfig, ResetDelays};
use crate::delivery::model::*;
use crate::delivery::oracle::InstalledSetOracle;
use crate::delivery::registry::ModuleRegistry;
use crate::delivery::state::{StateChannel, StateSubscription};
use crate::delivery::unpack::ResourceUnpacker;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Everything that can change the download state, funnelled into one task.
#[derive(Debug)]
enum EngineInput {
    Request(ModuleId),
    Uninstall(ModuleId),
    Update(SessionUpdate),
    SubmitAccepted { module: ModuleId, session_id: SessionId },
    SubmitFailed { module: ModuleId, message: String },
    ResetElapsed { generation: u64 },
    Shutdown,
}

struct EngineListener {
    tx: mpsc::UnboundedSender<EngineInput>,
}

impl InstallListener for EngineListener {
    fn on_state_update(&self, update: SessionUpdate) {
        let _ = self.tx.send(EngineInput::Update(update));
    }
}

/// Drives module installs and publishes their progress as one `DownloadState`.
///
/// Must be created inside a tokio runtime. Call [`InstallEngine::dispose`]
/// when the owning surface goes away; the backend listener stays registered
/// until then.
#[derive(Clone)]
pub struct InstallEngine {
    tx: mpsc::UnboundedSender<EngineInput>,
    state: StateChannel,
    oracle: InstalledSetOracle,
    registry: Arc<ModuleRegistry>,
    backend: Arc<dyn InstallBackend>,
    listener_id: ListenerId,
    disposed: Arc<AtomicBool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl InstallEngine {
    pub fn new(
        backend: Arc<dyn InstallBackend>,
        registry: Arc<ModuleRegistry>,
        config: DeliveryConfig,
        unpacker: Option<Arc<ResourceUnpacker>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = StateChannel::default();
        let oracle = InstalledSetOracle::new(backend.clone(), config.mode);

        let listener_id = backend.register_listener(Arc::new(EngineListener { tx: tx.clone() }));
        tracing::info!(
            "[ENGINE] started backend={} mode={:?} installed={:?}",
            backend.name(),
            config.mode,
            oracle.installed_modules()
        );

        let core = EngineCore {
            delays: config.reset_delays,
            state: state.clone(),
            oracle: oracle.clone(),
            backend: backend.clone(),
            unpacker,
            tx: tx.downgrade(),
            active: HashSet::new(),
            generation: 0,
            reset_timer: None,
        };
        let task = tokio::spawn(core.run(rx));

        Self {
            tx,
            state,
            oracle,
            registry,
            backend,
            listener_id,
            disposed: Arc::new(AtomicBool::new(false)),
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    pub fn state(&self) -> DownloadState {
        self.state.current()
    }

    pub fn subscribe(&self) -> StateSubscription {
        self.state.subscribe()
    }

    pub fn oracle(&self) -> &InstalledSetOracle {
        &self.oracle
    }

    pub fn is_installed(&self, module: &str) -> bool {
        self.oracle.is_installed(module)
    }

    pub fn available_modules(&self) -> Vec<ModuleDescriptor> {
        self.registry.describe(&self.oracle)
    }

    /// Starts acquiring `module`. Returns immediately; watch [`Self::subscribe`].
    pub fn request(&self, module: &str) {
        tracing::debug!("[ENGINE] request {}", module);
        self.send(EngineInput::Request(module.to_string()));
    }

    pub fn uninstall(&self, module: &str) {
        tracing::debug!("[ENGINE] uninstall {}", module);
        self.send(EngineInput::Uninstall(module.to_string()));
    }

    /// Unregisters the backend listener and stops the engine task.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.backend.unregister_listener(self.listener_id);
        let _ = self.tx.send(EngineInput::Shutdown);
        tracing::info!("[ENGINE] disposed");
    }

    /// Disposes the engine and waits until inputs queued before the call
    /// have been handled.
    pub async fn shutdown(&self) {
        self.dispose();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn send(&self, input: EngineInput) {
        if self.disposed.load(Ordering::SeqCst) {
            tracing::warn!("[ENGINE] ignoring {:?} after dispose", input);
            return;
        }
        let _ = self.tx.send(input);
    }
}

/// Single writer of the state slot and the simulated install set.
struct EngineCore {
    delays: ResetDelays,
    state: StateChannel,
    oracle: InstalledSetOracle,
    backend: Arc<dyn InstallBackend>,
    unpacker: Option<Arc<ResourceUnpacker>>,
    tx: mpsc::WeakUnboundedSender<EngineInput>,
    active: HashSet<ModuleId>,
    generation: u64,
    reset_timer: Option<JoinHandle<()>>,
}

impl EngineCore {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineInput>) {
        while let Some(input) = rx.recv().await {
            match input {
                EngineInput::Request(module) => self.on_request(module),
                EngineInput::Uninstall(module) => self.on_uninstall(module).await,
                EngineInput::Update(update) => self.on_update(update),
                EngineInput::SubmitAccepted { module, session_id } => {
                    tracing::info!("[ENGINE] install request accepted for {} (session {})", module, session_id);
                }
                EngineInput::SubmitFailed { module, message } => self.on_submit_failed(module, message),
                EngineInput::ResetElapsed { generation } => {
                    if generation == self.generation {
                        self.reset_timer = None;
                        self.publish(DownloadState::Idle);
                    }
                }
                EngineInput::Shutdown => break,
            }
        }
        self.cancel_reset();
        tracing::debug!("[ENGINE] task stopped");
    }

    fn on_request(&mut self, module: ModuleId) {
        if self.oracle.is_installed(&module) {
            tracing::info!("[ENGINE] {} is already installed", module);
            self.publish(DownloadState::AlreadyInstalled);
            return;
        }
        if self.active.contains(&module) {
            tracing::debug!("[ENGINE] {} already has a session in flight, reusing it", module);
            return;
        }

        self.active.insert(module.clone());
        self.publish(DownloadState::Pending);

        let backend = self.backend.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let input = match backend.start_install(&module).await {
                Ok(session_id) => EngineInput::SubmitAccepted { module, session_id },
                Err(e) => EngineInput::SubmitFailed {
                    module,
                    message: format!("{} (code {})", e, e.error_code()),
                },
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(input);
            }
        });
    }

    fn on_submit_failed(&mut self, module: ModuleId, message: String) {
        tracing::error!("[ENGINE] install request for {} rejected: {}", module, message);
        if !self.active.remove(&module) {
            return;
        }
        self.publish(DownloadState::Failed(SUBMISSION_FAILED));
        self.schedule_reset(self.delays.failed);
    }

    async fn on_uninstall(&mut self, module: ModuleId) {
        // later updates from an in-flight session for this id are ignored
        if self.active.remove(&module) {
            tracing::info!("[ENGINE] uninstall of {} abandons its in-flight session", module);
        }
        let mut defer = true;
        if let Some(sim) = self.oracle.simulated() {
            sim.remove(&module);
            defer = self.oracle.in_platform_set(&module);
        }
        self.publish(DownloadState::Idle);

        if defer {
            match self.backend.deferred_uninstall(&[module.clone()]).await {
                Ok(()) => tracing::info!("[ENGINE] deferred uninstall scheduled for {}", module),
                Err(e) => tracing::error!("[ENGINE] deferred uninstall of {} failed: {}", module, e),
            }
        }
    }

    fn on_update(&mut self, update: SessionUpdate) {
        tracing::debug!(
            "[ENGINE] session {} status={:?}({}) modules={:?}",
            update.session_id,
            update.status,
            update.status.code(),
            update.module_names
        );

        let ours: Vec<ModuleId> = update
            .module_names
            .iter()
            .filter(|m| self.active.contains(*m))
            .cloned()
            .collect();
        if ours.is_empty() {
            tracing::debug!("[ENGINE] ignoring update for a session this engine did not start");
            return;
        }

        let current = self.state.current();
        match update.status {
            SessionStatus::Downloading => {
                let pct = update.progress_percent();
                match current {
                    DownloadState::Pending => self.publish(DownloadState::Downloading(pct)),
                    DownloadState::Downloading(prev) if pct > prev => {
                        self.publish(DownloadState::Downloading(pct))
                    }
                    DownloadState::Downloading(_) => {}
                    other => tracing::debug!("[ENGINE] late progress while {:?}, dropped", other),
                }
            }
            SessionStatus::Installing => match current {
                DownloadState::Pending | DownloadState::Downloading(_) => self.publish(DownloadState::Installing),
                other => tracing::debug!("[ENGINE] install phase while {:?}, dropped", other),
            },
            SessionStatus::Installed => self.on_installed(ours, current.is_active()),
            SessionStatus::Failed => {
                tracing::error!("[ENGINE] install failed with error code {}", update.error_code);
                self.finish(&ours);
                self.publish(DownloadState::Failed(update.error_code));
                self.schedule_reset(self.delays.failed);
            }
            SessionStatus::Canceled => {
                tracing::info!("[ENGINE] install cancelled for {:?}", ours);
                self.finish(&ours);
                self.publish(DownloadState::Cancelled);
                self.schedule_reset(self.delays.cancelled);
            }
            SessionStatus::RequiresUserConfirmation => {
                tracing::info!("[ENGINE] session {} requires user confirmation", update.session_id);
            }
            SessionStatus::Pending
            | SessionStatus::Downloaded
            | SessionStatus::Canceling
            | SessionStatus::Unknown => {
                tracing::debug!("[ENGINE] other status {:?}", update.status);
            }
        }
    }

    /// Records the install whatever is on display; only the published state
    /// depends on `show`.
    fn on_installed(&mut self, modules: Vec<ModuleId>, show: bool) {
        self.finish(&modules);

        // the oracle must already agree when observers see `Installed`
        if let Some(sim) = self.oracle.simulated() {
            for m in &modules {
                sim.insert(m);
            }
        }
        if let Some(unpacker) = &self.unpacker {
            for m in &modules {
                unpacker.unpack_in_background(m);
            }
        }

        let set: BTreeSet<ModuleId> = modules.into_iter().collect();
        tracing::info!("[ENGINE] installed {:?}", set);
        if show {
            self.publish(DownloadState::Installed(set));
            self.schedule_reset(self.delays.installed);
        } else {
            tracing::debug!("[ENGINE] {:?} installed while another state is on display", set);
        }
    }

    fn finish(&mut self, modules: &[ModuleId]) {
        for m in modules {
            self.active.remove(m);
        }
    }

    fn publish(&mut self, state: DownloadState) {
        self.cancel_reset();
        self.generation += 1;
        tracing::debug!("[ENGINE] -> {:?}", state);
        self.state.publish(state);
    }

    fn cancel_reset(&mut self) {
        if let Some(h) = self.reset_timer.take() {
            h.abort();
        }
    }

    fn schedule_reset(&mut self, delay: Duration) {
        let generation = self.generation;
        let tx = self.tx.clone();
        self.reset_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(EngineInput::ResetElapsed { generation });
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::backend::testing::ManualBackend;
    use crate::delivery::config::{DeliveryMode, SimulationScript};
    use crate::delivery::simulated::SimulatedBackend;
    use crate::delivery::unpack::write_archive;
    use std::collections::BTreeSet;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::time::{timeout, Instant};
    use uuid::Uuid;

    fn set(ids: &[&str]) -> BTreeSet<ModuleId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    async fn next(sub: &mut StateSubscription) -> DownloadState {
        timeout(Duration::from_secs(30), sub.next())
            .await
            .expect("state within timeout")
            .expect("channel open")
    }

    fn assert_elapsed(since: Instant, expected: Duration) {
        let elapsed = since.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(10),
            "elapsed {:?}, expected {:?}",
            elapsed,
            expected
        );
    }

    /// Lets the engine task drain its queue.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn manual_engine(backend: Arc<ManualBackend>, mode: DeliveryMode) -> InstallEngine {
        InstallEngine::new(backend, Arc::new(ModuleRegistry::with_defaults()), DeliveryConfig::new(mode), None)
    }

    fn simulated_engine() -> InstallEngine {
        simulated_engine_with(None)
    }

    fn simulated_engine_with(unpacker: Option<Arc<ResourceUnpacker>>) -> InstallEngine {
        let platform: Arc<dyn InstallBackend> = Arc::new(ManualBackend::default());
        let backend = Arc::new(SimulatedBackend::new(platform, SimulationScript::default()));
        InstallEngine::new(
            backend,
            Arc::new(ModuleRegistry::with_defaults()),
            DeliveryConfig::new(DeliveryMode::Simulated),
            unpacker,
        )
    }

    async fn until_installed(sub: &mut StateSubscription) -> Vec<DownloadState> {
        let mut seen = vec![];
        loop {
            let s = next(sub).await;
            let done = matches!(s, DownloadState::Installed(_));
            seen.push(s);
            if done {
                return seen;
            }
        }
    }

    /// Unpacking runs on a blocking worker outside the paused clock.
    async fn wait_for_contents(path: &Path, expected: &str) -> bool {
        for _ in 0..200 {
            if std::fs::read_to_string(path).ok().as_deref() == Some(expected) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
            tokio::task::yield_now().await;
        }
        false
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_install_walks_the_full_sequence() {
        let engine = simulated_engine();
        let mut sub = engine.subscribe();
        assert_eq!(next(&mut sub).await, DownloadState::Idle);

        engine.request("featurepremium");

        assert_eq!(next(&mut sub).await, DownloadState::Pending);
        assert_eq!(next(&mut sub).await, DownloadState::Downloading(30));
        assert_eq!(next(&mut sub).await, DownloadState::Downloading(60));
        assert_eq!(next(&mut sub).await, DownloadState::Downloading(90));
        assert_eq!(next(&mut sub).await, DownloadState::Installing);
        assert_eq!(next(&mut sub).await, DownloadState::Installed(set(&["featurepremium"])));
        assert!(engine.is_installed("featurepremium"));

        let installed_at = Instant::now();
        assert_eq!(next(&mut sub).await, DownloadState::Idle);
        assert_elapsed(installed_at, Duration::from_secs(2));
        assert!(engine.is_installed("featurepremium"));

        for other in ["featureanalytics", "featureadvancedsearch"] {
            assert!(!engine.is_installed(other));
        }
        engine.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn already_installed_skips_the_session() {
        let backend = Arc::new(ManualBackend::with_installed(&["featureanalytics"]));
        let engine = manual_engine(backend.clone(), DeliveryMode::Platform);
        let mut sub = engine.subscribe();
        assert_eq!(next(&mut sub).await, DownloadState::Idle);

        engine.request("featureanalytics");
        assert_eq!(next(&mut sub).await, DownloadState::AlreadyInstalled);

        settle().await;
        assert!(backend.submitted.lock().is_empty());
        assert_eq!(engine.state(), DownloadState::AlreadyInstalled);
    }

    #[tokio::test(start_paused = true)]
    async fn platform_events_map_one_to_one() {
        let backend = Arc::new(ManualBackend::default());
        let engine = manual_engine(backend.clone(), DeliveryMode::Platform);
        let mut sub = engine.subscribe();
        next(&mut sub).await;

        engine.request("featureadvancedsearch");
        assert_eq!(next(&mut sub).await, DownloadState::Pending);
        settle().await;
        assert_eq!(*backend.submitted.lock(), vec!["featureadvancedsearch".to_string()]);

        let sid = Uuid::new_v4();
        backend.emit(SessionUpdate::new(sid, SessionStatus::Pending, "featureadvancedsearch"));
        backend.emit(SessionUpdate::downloading(sid, "featureadvancedsearch", 256, 1024));
        backend.emit(SessionUpdate::downloading(sid, "featureadvancedsearch", 1024, 1024));
        backend.emit(SessionUpdate::new(sid, SessionStatus::Downloaded, "featureadvancedsearch"));
        backend.emit(SessionUpdate::new(sid, SessionStatus::Installing, "featureadvancedsearch"));
        backend.emit(SessionUpdate::new(sid, SessionStatus::Installed, "featureadvancedsearch"));

        assert_eq!(next(&mut sub).await, DownloadState::Downloading(25));
        assert_eq!(next(&mut sub).await, DownloadState::Downloading(100));
        assert_eq!(next(&mut sub).await, DownloadState::Installing);
        assert_eq!(
            next(&mut sub).await,
            DownloadState::Installed(set(&["featureadvancedsearch"]))
        );
        assert_eq!(next(&mut sub).await, DownloadState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_total_reports_zero_percent() {
        let backend = Arc::new(ManualBackend::default());
        let engine = manual_engine(backend.clone(), DeliveryMode::Platform);
        let mut sub = engine.subscribe();
        next(&mut sub).await;

        engine.request("featurepremium");
        assert_eq!(next(&mut sub).await, DownloadState::Pending);
        backend.emit(SessionUpdate::downloading(Uuid::nil(), "featurepremium", 4096, 0));
        assert_eq!(next(&mut sub).await, DownloadState::Downloading(0));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_never_goes_backwards() {
        let backend = Arc::new(ManualBackend::default());
        let engine = manual_engine(backend.clone(), DeliveryMode::Platform);
        let mut sub = engine.subscribe();
        next(&mut sub).await;

        engine.request("featurepremium");
        next(&mut sub).await;
        backend.emit(SessionUpdate::downloading(Uuid::nil(), "featurepremium", 50, 100));
        backend.emit(SessionUpdate::downloading(Uuid::nil(), "featurepremium", 40, 100));
        backend.emit(SessionUpdate::new(Uuid::nil(), SessionStatus::Installing, "featurepremium"));
        backend.emit(SessionUpdate::downloading(Uuid::nil(), "featurepremium", 70, 100));

        assert_eq!(next(&mut sub).await, DownloadState::Downloading(50));
        assert_eq!(next(&mut sub).await, DownloadState::Installing);
        settle().await;
        assert_eq!(engine.state(), DownloadState::Installing);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_resets_after_three_seconds() {
        let backend = Arc::new(ManualBackend::default());
        let engine = manual_engine(backend.clone(), DeliveryMode::Platform);
        let mut sub = engine.subscribe();
        next(&mut sub).await;

        engine.request("featureanalytics");
        next(&mut sub).await;
        backend.emit(SessionUpdate::downloading(Uuid::nil(), "featureanalytics", 10, 100));
        backend.emit(SessionUpdate::failed(Uuid::nil(), "featureanalytics", error_code::NETWORK_ERROR));

        assert_eq!(next(&mut sub).await, DownloadState::Downloading(10));
        assert_eq!(next(&mut sub).await, DownloadState::Failed(error_code::NETWORK_ERROR));
        let failed_at = Instant::now();
        assert_eq!(next(&mut sub).await, DownloadState::Idle);
        assert_elapsed(failed_at, Duration::from_secs(3));
        assert!(!engine.is_installed("featureanalytics"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_not_an_error() {
        let backend = Arc::new(ManualBackend::default());
        let engine = manual_engine(backend.clone(), DeliveryMode::Platform);
        let mut sub = engine.subscribe();
        next(&mut sub).await;

        engine.request("featurepremium");
        next(&mut sub).await;
        backend.emit_status("featurepremium", SessionStatus::RequiresUserConfirmation);
        backend.emit_status("featurepremium", SessionStatus::Canceled);

        assert_eq!(next(&mut sub).await, DownloadState::Cancelled);
        let cancelled_at = Instant::now();
        assert_eq!(next(&mut sub).await, DownloadState::Idle);
        assert_elapsed(cancelled_at, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_submission_fails_with_sentinel() {
        let backend = Arc::new(ManualBackend::default());
        backend.reject_submissions.store(true, Ordering::SeqCst);
        let engine = manual_engine(backend.clone(), DeliveryMode::Platform);
        let mut sub = engine.subscribe();
        next(&mut sub).await;

        engine.request("featurepremium");
        assert_eq!(next(&mut sub).await, DownloadState::Pending);
        assert_eq!(next(&mut sub).await, DownloadState::Failed(SUBMISSION_FAILED));
        assert_eq!(next(&mut sub).await, DownloadState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_transition_cancels_pending_reset() {
        let backend = Arc::new(ManualBackend::default());
        let engine = manual_engine(backend.clone(), DeliveryMode::Platform);
        let mut sub = engine.subscribe();
        next(&mut sub).await;

        engine.request("featurepremium");
        next(&mut sub).await;
        backend.emit_status("featurepremium", SessionStatus::Canceled);
        assert_eq!(next(&mut sub).await, DownloadState::Cancelled);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        engine.request("featurepremium");
        assert_eq!(next(&mut sub).await, DownloadState::Pending);

        // the stale 2s reset would have fired here
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(engine.state(), DownloadState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_request_reuses_active_session() {
        let backend = Arc::new(ManualBackend::default());
        let engine = manual_engine(backend.clone(), DeliveryMode::Platform);
        let mut sub = engine.subscribe();
        next(&mut sub).await;

        engine.request("featurepremium");
        engine.request("featurepremium");
        assert_eq!(next(&mut sub).await, DownloadState::Pending);
        settle().await;

        assert_eq!(backend.submitted.lock().len(), 1);
        assert_eq!(engine.state(), DownloadState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_module_still_goes_through_install_flow() {
        let backend = Arc::new(ManualBackend::default());
        let engine = manual_engine(backend.clone(), DeliveryMode::Platform);
        let mut sub = engine.subscribe();
        next(&mut sub).await;

        engine.request("featurenotinregistry");
        assert_eq!(next(&mut sub).await, DownloadState::Pending);
        settle().await;
        assert_eq!(*backend.submitted.lock(), vec!["featurenotinregistry".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn updates_for_foreign_sessions_are_ignored() {
        let backend = Arc::new(ManualBackend::default());
        let engine = manual_engine(backend.clone(), DeliveryMode::Platform);

        backend.emit(SessionUpdate::downloading(Uuid::nil(), "featurepremium", 50, 100));
        backend.emit_status("featurepremium", SessionStatus::Installed);
        settle().await;
        assert_eq!(engine.state(), DownloadState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_uninstall_clears_local_set_immediately() {
        let engine = simulated_engine();
        let mut sub = engine.subscribe();
        next(&mut sub).await;

        engine.request("featureanalytics");
        loop {
            if let DownloadState::Installed(_) = next(&mut sub).await {
                break;
            }
        }
        assert!(engine.is_installed("featureanalytics"));

        engine.uninstall("featureanalytics");
        assert_eq!(next(&mut sub).await, DownloadState::Idle);
        assert!(!engine.is_installed("featureanalytics"));
    }

    #[tokio::test(start_paused = true)]
    async fn platform_uninstall_is_deferred_to_backend() {
        let backend = Arc::new(ManualBackend::with_installed(&["featurepremium"]));
        let engine = manual_engine(backend.clone(), DeliveryMode::Platform);
        let mut sub = engine.subscribe();
        next(&mut sub).await;

        engine.uninstall("featurepremium");
        assert_eq!(next(&mut sub).await, DownloadState::Idle);
        settle().await;
        assert_eq!(*backend.uninstalled.lock(), vec!["featurepremium".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_unregisters_listener_once() {
        let backend = Arc::new(ManualBackend::default());
        let engine = manual_engine(backend.clone(), DeliveryMode::Platform);
        assert_eq!(backend.listeners.len(), 1);

        engine.dispose();
        engine.dispose();
        assert_eq!(backend.listeners.len(), 0);

        engine.request("featurepremium");
        settle().await;
        assert!(backend.submitted.lock().is_empty());
        assert_eq!(engine.state(), DownloadState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_queued_uninstall() {
        let backend = Arc::new(ManualBackend::with_installed(&["featureanalytics"]));
        let engine = manual_engine(backend.clone(), DeliveryMode::Platform);

        engine.uninstall("featureanalytics");
        engine.shutdown().await;

        assert_eq!(*backend.uninstalled.lock(), vec!["featureanalytics".to_string()]);
        assert_eq!(backend.listeners.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn install_finishing_under_another_modules_display_is_recorded() {
        let engine = simulated_engine();
        engine.request("featurepremium");
        engine.request("featureanalytics");

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert!(engine.is_installed("featurepremium"));
        assert!(engine.is_installed("featureanalytics"));
        assert_eq!(engine.state(), DownloadState::Idle);

        let mut sub = engine.subscribe();
        next(&mut sub).await;
        engine.request("featureanalytics");
        assert_eq!(next(&mut sub).await, DownloadState::AlreadyInstalled);
    }

    #[tokio::test(start_paused = true)]
    async fn uninstall_mid_session_leaves_module_requestable() {
        let engine = simulated_engine();
        let mut sub = engine.subscribe();
        next(&mut sub).await;

        engine.request("featurepremium");
        assert_eq!(next(&mut sub).await, DownloadState::Pending);
        tokio::time::sleep(Duration::from_millis(700)).await;
        engine.uninstall("featurepremium");
        loop {
            if next(&mut sub).await == DownloadState::Idle {
                break;
            }
        }

        // the abandoned session runs to completion without effect
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(engine.state(), DownloadState::Idle);
        assert!(!engine.is_installed("featurepremium"));

        engine.request("featurepremium");
        assert_eq!(next(&mut sub).await, DownloadState::Pending);
        let seen = until_installed(&mut sub).await;
        assert_eq!(seen.last(), Some(&DownloadState::Installed(set(&["featurepremium"]))));
        assert!(engine.is_installed("featurepremium"));
    }

    #[tokio::test(start_paused = true)]
    async fn installed_module_resources_are_unpacked() {
        let assets = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();
        let unpacker = Arc::new(ResourceUnpacker::new(
            assets.path().to_path_buf(),
            files.path().to_path_buf(),
        ));
        write_archive(
            &unpacker.archive_path("featurepremium"),
            &[("banner.txt", "vip"), ("img/card.txt", "card")],
        );

        let engine = simulated_engine_with(Some(unpacker.clone()));
        let mut sub = engine.subscribe();
        next(&mut sub).await;
        engine.request("featurepremium");
        until_installed(&mut sub).await;

        let dest = files.path().join("modules").join("featurepremium");
        assert!(wait_for_contents(&dest.join("banner.txt"), "vip").await);
        assert!(wait_for_contents(&dest.join("img/card.txt"), "card").await);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_resource_archive_leaves_state_untouched() {
        let assets = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();
        let unpacker = Arc::new(ResourceUnpacker::new(
            assets.path().to_path_buf(),
            files.path().to_path_buf(),
        ));

        let engine = simulated_engine_with(Some(unpacker));
        let mut sub = engine.subscribe();
        next(&mut sub).await;
        engine.request("featureanalytics");
        let seen = until_installed(&mut sub).await;
        assert_eq!(
            seen,
            vec![
                DownloadState::Pending,
                DownloadState::Downloading(30),
                DownloadState::Downloading(60),
                DownloadState::Downloading(90),
                DownloadState::Installing,
                DownloadState::Installed(set(&["featureanalytics"])),
            ]
        );

        let installed_at = Instant::now();
        assert_eq!(next(&mut sub).await, DownloadState::Idle);
        assert_elapsed(installed_at, Duration::from_secs(2));
        assert!(engine.is_installed("featureanalytics"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn updates_from_many_threads_publish_in_order() {
        let backend = Arc::new(ManualBackend::default());
        let engine = manual_engine(backend.clone(), DeliveryMode::Platform);
        let mut sub = engine.subscribe();
        next(&mut sub).await;

        engine.request("featurepremium");
        assert_eq!(next(&mut sub).await, DownloadState::Pending);

        let sid = Uuid::new_v4();
        let emitters: Vec<_> = (0..4u64)
            .map(|t| {
                let backend = backend.clone();
                std::thread::spawn(move || {
                    for i in 0..25u64 {
                        backend.emit(SessionUpdate::downloading(sid, "featurepremium", i * 4 + t + 1, 100));
                    }
                })
            })
            .collect();
        for h in emitters {
            h.join().unwrap();
        }
        backend.emit(SessionUpdate::new(sid, SessionStatus::Installing, "featurepremium"));
        backend.emit(SessionUpdate::new(sid, SessionStatus::Installed, "featurepremium"));

        let seen = until_installed(&mut sub).await;
        let (progress, tail) = seen.split_at(seen.len() - 2);
        assert_eq!(
            tail,
            &[DownloadState::Installing, DownloadState::Installed(set(&["featurepremium"]))]
        );

        let pcts: Vec<u8> = progress
            .iter()
            .map(|s| match s {
                DownloadState::Downloading(p) => *p,
                other => panic!("unexpected {:?} before install phase", other),
            })
            .collect();
        assert!(pcts.windows(2).all(|w| w[0] < w[1]), "{:?}", pcts);
        assert_eq!(pcts.last(), Some(&100));
    }
}
