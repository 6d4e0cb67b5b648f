use anyhow::Context;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

/// Persistent record of installed split modules.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleRecordState {
    Installed,
    PendingUninstall,
}

#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub module_id: String,
    pub package_path: PathBuf,
    pub size_bytes: i64,
    pub state: ModuleRecordState,
}

impl SqliteStore {
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }

        let abs = if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            std::env::current_dir()
                .with_context(|| "current_dir")?
                .join(db_path)
        };

        let mut p = abs.to_string_lossy().to_string();
        if cfg!(windows) {
            p = p.replace('\\', "/");
        }

        // mode=rwc creates the file on first open
        let url = if p.starts_with('/') {
            format!("sqlite://{}?mode=rwc", p)
        } else {
            format!("sqlite:///{}?mode=rwc", p)
        };

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .with_context(|| format!("connect sqlite url={} (file={})", url, abs.display()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS split_modules (
              module_id TEXT PRIMARY KEY,
              package_path TEXT NOT NULL,
              size_bytes INTEGER NOT NULL,
              state INTEGER NOT NULL, -- 0 Installed, 1 PendingUninstall
              updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn now_epoch() -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    pub async fn record_installed(&self, module_id: &str, package_path: &Path, size_bytes: i64) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO split_modules (module_id, package_path, size_bytes, state, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(module_id) DO UPDATE SET
              package_path = excluded.package_path,
              size_bytes = excluded.size_bytes,
              state = excluded.state,
              updated_at = excluded.updated_at;
            "#,
        )
        .bind(module_id)
        .bind(package_path.to_string_lossy().to_string())
        .bind(size_bytes)
        .bind(state_to_int(ModuleRecordState::Installed))
        .bind(Self::now_epoch())
        .execute(&self.pool)
        .await
        .with_context(|| format!("record installed module {}", module_id))?;
        Ok(())
    }

    /// Returns how many of `module_ids` were marked.
    pub async fn mark_pending_uninstall(&self, module_ids: &[String]) -> anyhow::Result<u64> {
        let now = Self::now_epoch();
        let mut marked = 0;
        for id in module_ids {
            let r = sqlx::query(r#"UPDATE split_modules SET state = ?, updated_at = ? WHERE module_id = ?"#)
                .bind(state_to_int(ModuleRecordState::PendingUninstall))
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            marked += r.rows_affected();
        }
        Ok(marked)
    }

    pub async fn load_modules(&self) -> anyhow::Result<Vec<ModuleRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT module_id, package_path, size_bytes, state
            FROM split_modules
            ORDER BY module_id ASC;
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ModuleRecord {
                module_id: r.get::<String, _>("module_id"),
                package_path: PathBuf::from(r.get::<String, _>("package_path")),
                size_bytes: r.get::<i64, _>("size_bytes"),
                state: int_to_state(r.get::<i64, _>("state")),
            })
            .collect())
    }

    pub async fn delete_module(&self, module_id: &str) -> anyhow::Result<()> {
        sqlx::query(r#"DELETE FROM split_modules WHERE module_id = ?"#)
            .bind(module_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn state_to_int(s: ModuleRecordState) -> i64 {
    match s {
        ModuleRecordState::Installed => 0,
        ModuleRecordState::PendingUninstall => 1,
    }
}

fn int_to_state(v: i64) -> ModuleRecordState {
    match v {
        1 => ModuleRecordState::PendingUninstall,
        _ => ModuleRecordState::Installed,
    }
}
