use crate::delivery::backend::{BackendError, InstallBackend, InstallListener, ListenerId, ListenerSet};
use crate::delivery::config::SimulationScript;
use crate::delivery::model::{ModuleId, SessionId, SessionStatus, SessionUpdate};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Development substitute for the split-install service: plays a fixed,
/// timer-driven session script with no I/O. Installed-set queries and
/// uninstalls go to the wrapped platform backend.
pub struct SimulatedBackend {
    platform: Arc<dyn InstallBackend>,
    script: SimulationScript,
    listeners: Arc<ListenerSet>,
}

impl SimulatedBackend {
    pub fn new(platform: Arc<dyn InstallBackend>, script: SimulationScript) -> Self {
        Self {
            platform,
            script,
            listeners: Arc::new(ListenerSet::new()),
        }
    }

    async fn play(listeners: Arc<ListenerSet>, script: SimulationScript, session_id: SessionId, module: ModuleId) {
        for pct in &script.progress_steps {
            tokio::time::sleep(script.step).await;
            listeners.dispatch(&SessionUpdate::downloading(session_id, &module, *pct as u64, 100));
        }

        tokio::time::sleep(script.step).await;
        listeners.dispatch(&SessionUpdate::new(session_id, SessionStatus::Installing, &module));

        tokio::time::sleep(script.step).await;
        tracing::debug!("[SIM] session {} installed {}", session_id, module);
        listeners.dispatch(&SessionUpdate::new(session_id, SessionStatus::Installed, &module));
    }
}

#[async_trait]
impl InstallBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn start_install(&self, module: &str) -> Result<SessionId, BackendError> {
        if module.is_empty() {
            return Err(BackendError::InvalidRequest("empty module name".to_string()));
        }
        let session_id = Uuid::new_v4();
        tracing::info!("[SIM] simulating install of {} (session {})", module, session_id);

        tokio::spawn(Self::play(
            self.listeners.clone(),
            self.script.clone(),
            session_id,
            module.to_string(),
        ));
        Ok(session_id)
    }

    fn installed_modules(&self) -> HashSet<ModuleId> {
        self.platform.installed_modules()
    }

    fn contains_module(&self, module: &str) -> bool {
        self.platform.contains_module(module)
    }

    async fn deferred_uninstall(&self, modules: &[ModuleId]) -> Result<(), BackendError> {
        self.platform.deferred_uninstall(modules).await
    }

    fn register_listener(&self, listener: Arc<dyn InstallListener>) -> ListenerId {
        self.listeners.register(listener)
    }

    fn unregister_listener(&self, id: ListenerId) {
        self.listeners.unregister(id)
    }
}
