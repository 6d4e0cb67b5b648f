use crate::delivery::backend::{BackendError, InstallBackend, InstallListener, ListenerId, ListenerSet};
use crate::delivery::model::{error_code, progress_percent, ModuleId, SessionId, SessionStatus, SessionUpdate};
use crate::platform::fetch::{FetchContext, ModuleFetcher, ModuleSource};
use crate::platform::store::{ModuleRecordState, SqliteStore};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::AbortHandle;
use uuid::Uuid;

struct SessionSlot {
    module: ModuleId,
    status: SessionStatus,
    task: Option<AbortHandle>,
}

struct ServiceInner {
    fetcher: ModuleFetcher,
    splits_dir: PathBuf,
    store: SqliteStore,
    installed: RwLock<HashSet<ModuleId>>,
    listeners: ListenerSet,
    sessions: Mutex<HashMap<SessionId, SessionSlot>>,
}

/// Split-install service backed by a module repository and a local SQLite
/// record of what is installed.
///
/// Updates are dispatched while the session table is locked, so listeners
/// must not call back into the service synchronously.
pub struct RepositoryInstallService {
    inner: Arc<ServiceInner>,
}

impl RepositoryInstallService {
    pub async fn open(source: ModuleSource, data_dir: &Path, ctx: FetchContext) -> anyhow::Result<Self> {
        let splits_dir = data_dir.join("splits");
        tokio::fs::create_dir_all(&splits_dir).await?;

        let store = SqliteStore::open(&data_dir.join("split_install.sqlite")).await?;
        let mut installed = HashSet::new();

        for rec in store.load_modules().await? {
            match rec.state {
                ModuleRecordState::PendingUninstall => {
                    let _ = tokio::fs::remove_file(&rec.package_path).await;
                    store.delete_module(&rec.module_id).await?;
                    tracing::info!("[SPLIT] removed {} (deferred uninstall)", rec.module_id);
                }
                ModuleRecordState::Installed => {
                    if tokio::fs::metadata(&rec.package_path).await.is_ok() {
                        installed.insert(rec.module_id);
                    } else {
                        tracing::warn!(
                            "[SPLIT] package for {} missing at {}, forgetting it",
                            rec.module_id,
                            rec.package_path.display()
                        );
                        store.delete_module(&rec.module_id).await?;
                    }
                }
            }
        }

        tracing::info!(
            "[SPLIT] repository={} data_dir={} installed={:?}",
            source.describe(),
            data_dir.display(),
            installed
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                fetcher: ModuleFetcher::new(source, ctx)?,
                splits_dir,
                store,
                installed: RwLock::new(installed),
                listeners: ListenerSet::new(),
                sessions: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Cancels the session for `module` if it has not reached the install
    /// phase. Listeners see `Canceled`.
    pub async fn cancel_module(&self, module: &str) -> Result<(), BackendError> {
        let session_id = {
            let mut sessions = self.inner.sessions.lock();
            let found = sessions
                .iter()
                .find(|(_, s)| s.module == module)
                .map(|(id, s)| (*id, s.status));
            let session_id = match found {
                Some((id, SessionStatus::Pending | SessionStatus::Downloading)) => id,
                _ => return Err(BackendError::SessionNotFound(module.to_string())),
            };
            if let Some(slot) = sessions.remove(&session_id) {
                if let Some(task) = slot.task {
                    task.abort();
                }
            }
            self.inner
                .listeners
                .dispatch(&SessionUpdate::new(session_id, SessionStatus::Canceled, module));
            session_id
        };

        tracing::info!("[SPLIT] session {} for {} cancelled", session_id, module);
        let _ = tokio::fs::remove_file(self.inner.partial_path(module)).await;
        Ok(())
    }
}

fn validate_module_id(module: &str) -> Result<(), BackendError> {
    let ok = !module.is_empty()
        && module
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(BackendError::InvalidRequest(format!("bad module name {:?}", module)))
    }
}

impl ServiceInner {
    fn partial_path(&self, module: &str) -> PathBuf {
        self.splits_dir.join(format!("{}.partial", module))
    }

    fn package_path(&self, module: &str) -> PathBuf {
        self.splits_dir.join(ModuleSource::package_name(module))
    }

    /// Moves the session to `status` and emits `update`, unless it was
    /// cancelled in the meantime.
    fn advance(&self, session_id: SessionId, status: SessionStatus, update: SessionUpdate) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&session_id) {
            Some(slot) => {
                slot.status = status;
                if status == SessionStatus::Installing {
                    slot.task = None;
                }
                self.listeners.dispatch(&update);
                true
            }
            None => false,
        }
    }

    fn finish(&self, session_id: SessionId, update: SessionUpdate) {
        let mut sessions = self.sessions.lock();
        if sessions.remove(&session_id).is_some() {
            self.listeners.dispatch(&update);
        }
    }

    async fn run_session(self: Arc<Self>, session_id: SessionId, module: ModuleId) {
        let partial = self.partial_path(&module);
        let mut last_pct: Option<u8> = None;

        let fetched = self
            .fetcher
            .fetch_to_file(&module, &partial, |downloaded, total| {
                let pct = progress_percent(downloaded, total);
                if last_pct != Some(pct) {
                    last_pct = Some(pct);
                    self.advance(
                        session_id,
                        SessionStatus::Downloading,
                        SessionUpdate::downloading(session_id, &module, downloaded, total),
                    );
                }
            })
            .await;

        let size = match fetched {
            Ok(size) => size,
            Err(e) => {
                tracing::error!("[SPLIT] download of {} failed: {}", module, e);
                let _ = tokio::fs::remove_file(&partial).await;
                self.finish(session_id, SessionUpdate::failed(session_id, &module, e.error_code()));
                return;
            }
        };

        let downloaded = SessionUpdate::new(session_id, SessionStatus::Downloaded, &module);
        if !self.advance(session_id, SessionStatus::Downloaded, downloaded) {
            let _ = tokio::fs::remove_file(&partial).await;
            return;
        }
        let installing = SessionUpdate::new(session_id, SessionStatus::Installing, &module);
        if !self.advance(session_id, SessionStatus::Installing, installing) {
            let _ = tokio::fs::remove_file(&partial).await;
            return;
        }

        match self.install(&module, &partial, size).await {
            Ok(()) => {
                tracing::info!("[SPLIT] installed {} ({} bytes)", module, size);
                self.finish(session_id, SessionUpdate::new(session_id, SessionStatus::Installed, &module));
            }
            Err(e) => {
                tracing::error!("[SPLIT] install of {} failed: {:#}", module, e);
                let _ = tokio::fs::remove_file(&partial).await;
                self.finish(
                    session_id,
                    SessionUpdate::failed(session_id, &module, error_code::INTERNAL_ERROR),
                );
            }
        }
    }

    async fn install(&self, module: &str, partial: &Path, size: u64) -> anyhow::Result<()> {
        let package = self.package_path(module);
        if tokio::fs::metadata(&package).await.is_ok() {
            let _ = tokio::fs::remove_file(&package).await;
        }
        tokio::fs::rename(partial, &package).await?;
        self.store.record_installed(module, &package, size as i64).await?;
        self.installed.write().insert(module.to_string());
        Ok(())
    }
}

#[async_trait]
impl InstallBackend for RepositoryInstallService {
    fn name(&self) -> &'static str {
        "repository"
    }

    async fn start_install(&self, module: &str) -> Result<SessionId, BackendError> {
        validate_module_id(module)?;

        let session_id = Uuid::new_v4();
        {
            let mut sessions = self.inner.sessions.lock();
            if sessions.values().any(|s| s.module == module) {
                return Err(BackendError::ActiveSession(module.to_string()));
            }
            sessions.insert(
                session_id,
                SessionSlot {
                    module: module.to_string(),
                    status: SessionStatus::Pending,
                    task: None,
                },
            );
            self.inner
                .listeners
                .dispatch(&SessionUpdate::new(session_id, SessionStatus::Pending, module));
        }

        tracing::info!("[SPLIT] session {} started for {}", session_id, module);
        let handle = tokio::spawn(self.inner.clone().run_session(session_id, module.to_string()));
        if let Some(slot) = self.inner.sessions.lock().get_mut(&session_id) {
            if slot.status != SessionStatus::Installing {
                slot.task = Some(handle.abort_handle());
            }
        }
        Ok(session_id)
    }

    fn installed_modules(&self) -> HashSet<ModuleId> {
        self.inner.installed.read().clone()
    }

    fn contains_module(&self, module: &str) -> bool {
        self.inner.installed.read().contains(module)
    }

    async fn deferred_uninstall(&self, modules: &[ModuleId]) -> Result<(), BackendError> {
        let marked = self.inner.store.mark_pending_uninstall(modules).await?;
        tracing::info!("[SPLIT] {} of {:?} marked for removal on next start", marked, modules);
        Ok(())
    }

    fn register_listener(&self, listener: Arc<dyn InstallListener>) -> ListenerId {
        self.inner.listeners.register(listener)
    }

    fn unregister_listener(&self, id: ListenerId) {
        self.inner.listeners.unregister(id)
    }
}
