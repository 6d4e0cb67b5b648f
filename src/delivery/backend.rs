use crate::delivery::model::{error_code, ModuleId, SessionId, SessionUpdate, SUBMISSION_FAILED};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("invalid install request: {0}")]
    InvalidRequest(String),

    #[error("module {0} already has an active session")]
    ActiveSession(ModuleId),

    #[error("session not found or no longer cancellable: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    /// Code a platform service would attach to this rejection.
    pub fn error_code(&self) -> i32 {
        match self {
            Self::InvalidRequest(_) => error_code::INVALID_REQUEST,
            Self::ActiveSession(_) | Self::SessionNotFound(_) => SUBMISSION_FAILED,
            Self::Other(_) => error_code::INTERNAL_ERROR,
        }
    }
}

/// Receives session updates. May be invoked from any thread.
pub trait InstallListener: Send + Sync {
    fn on_state_update(&self, update: SessionUpdate);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Where module installs come from: the platform split-install service or
/// the simulated substitute.
#[async_trait]
pub trait InstallBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start_install(&self, module: &str) -> Result<SessionId, BackendError>;

    fn installed_modules(&self) -> HashSet<ModuleId>;

    fn contains_module(&self, module: &str) -> bool {
        self.installed_modules().contains(module)
    }

    async fn deferred_uninstall(&self, modules: &[ModuleId]) -> Result<(), BackendError>;

    fn register_listener(&self, listener: Arc<dyn InstallListener>) -> ListenerId;

    fn unregister_listener(&self, id: ListenerId);
}

/// Listener bookkeeping shared by backend implementations.
#[derive(Default)]
pub struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn InstallListener>)>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn InstallListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn unregister(&self, id: ListenerId) {
        self.listeners.write().retain(|(lid, _)| *lid != id);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn dispatch(&self, update: &SessionUpdate) {
        let snapshot: Vec<Arc<dyn InstallListener>> =
            self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for l in snapshot {
            l.on_state_update(update.clone());
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::model::SessionStatus;
    use parking_lot::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SessionStatus>>);

    impl InstallListener for Recorder {
        fn on_state_update(&self, update: SessionUpdate) {
            self.0.lock().push(update.status);
        }
    }

    #[test]
    fn unregistered_listener_stops_receiving() {
        let set = ListenerSet::new();
        let rec = Arc::new(Recorder::default());
        let id = set.register(rec.clone());

        set.dispatch(&SessionUpdate::new(Uuid::nil(), SessionStatus::Pending, "m"));
        set.unregister(id);
        set.dispatch(&SessionUpdate::new(Uuid::nil(), SessionStatus::Installed, "m"));

        assert_eq!(*rec.0.lock(), vec![SessionStatus::Pending]);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn rejection_codes() {
        assert_eq!(BackendError::InvalidRequest("x".into()).error_code(), -3);
        assert_eq!(BackendError::ActiveSession("m".into()).error_code(), SUBMISSION_FAILED);
        assert_eq!(BackendError::Other(anyhow::anyhow!("db")).error_code(), -100);
    }
}
