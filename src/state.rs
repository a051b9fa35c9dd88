use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::db::MemberDb;
use crate::error::SyncError;
use crate::sync::cancel::CancellationToken;
use crate::types::Config;

/// The sync run currently holding the single-flight slot.
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub run_id: String,
    pub started_at: String,
    pub cancel: CancellationToken,
}

/// Application state shared by every request handler.
pub struct AppState {
    pub config: RwLock<Config>,
    pub db: Mutex<Option<MemberDb>>,
    active_run: Mutex<Option<ActiveRun>>,
    /// Where `create_or_update_config` persists. `None` keeps config in memory.
    config_path: Option<PathBuf>,
}

impl AppState {
    /// Load config from disk and the environment, then open the database.
    ///
    /// A database that fails to open leaves the service running with DB
    /// features reporting `DatabaseUnavailable`.
    pub fn new() -> Self {
        let path = config_path().ok();
        let mut config = match path.as_deref().map(load_config_from) {
            Some(Ok(config)) => config,
            Some(Err(e)) => {
                log::warn!("{e}. Using default configuration.");
                Config::default()
            }
            None => Config::default(),
        };
        apply_env_overrides(&mut config, |key| std::env::var(key).ok());

        let opened = match config.db_path.as_deref() {
            Some(p) => MemberDb::open_at(PathBuf::from(p)),
            None => MemberDb::open(),
        };
        let db = match opened {
            Ok(db) => {
                match db.fail_interrupted_sync_runs() {
                    Ok(0) => {}
                    Ok(n) => log::warn!("Marked {n} interrupted sync run(s) as failed"),
                    Err(e) => log::warn!("Failed to sweep interrupted sync runs: {e}"),
                }
                Some(db)
            }
            Err(e) => {
                log::warn!("Failed to open member database: {e}. DB features disabled.");
                None
            }
        };

        Self::with_parts(config, db, path)
    }

    pub fn with_parts(config: Config, db: Option<MemberDb>, config_path: Option<PathBuf>) -> Self {
        Self {
            config: RwLock::new(config),
            db: Mutex::new(db),
            active_run: Mutex::new(None),
            config_path,
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    /// Run `f` against the open database.
    pub fn with_db<T>(
        &self,
        f: impl FnOnce(&MemberDb) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let guard = self.db.lock();
        let db = guard.as_ref().ok_or(SyncError::DatabaseUnavailable)?;
        f(db)
    }

    /// Run `f` against the open database on the blocking pool.
    ///
    /// Async callers use this so a long-held DB lock never parks a runtime
    /// worker.
    pub async fn with_db_blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&MemberDb) -> Result<T, SyncError> + Send + 'static,
    {
        let state = Arc::clone(self);
        tokio::task::spawn_blocking(move || state.with_db(f))
            .await
            .map_err(|e| SyncError::DatabaseTask(e.to_string()))?
    }

    /// Claim the single-flight slot for a new run.
    ///
    /// The slot is released when the returned guard drops.
    pub fn begin_run(self: &Arc<Self>, cancel: &CancellationToken) -> Result<RunGuard, SyncError> {
        let mut slot = self.active_run.lock();
        if let Some(active) = slot.as_ref() {
            return Err(SyncError::AlreadyRunning(active.run_id.clone()));
        }

        let run = ActiveRun {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            cancel: cancel.clone(),
        };
        let guard = RunGuard {
            state: Arc::clone(self),
            run_id: run.run_id.clone(),
        };
        *slot = Some(run);
        Ok(guard)
    }

    pub fn active_run(&self) -> Option<ActiveRun> {
        self.active_run.lock().clone()
    }

    /// Cancel the in-flight run, if any. Returns its id.
    pub fn cancel_active_run(&self) -> Option<String> {
        let slot = self.active_run.lock();
        slot.as_ref().map(|run| {
            run.cancel.cancel();
            run.run_id.clone()
        })
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the single-flight slot for one run.
pub struct RunGuard {
    state: Arc<AppState>,
    run_id: String,
}

impl RunGuard {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut slot = self.state.active_run.lock();
        if slot.as_ref().is_some_and(|run| run.run_id == self.run_id) {
            *slot = None;
        }
    }
}

/// Get the canonical config file path (~/.memberdir/config.json)
pub fn config_path() -> Result<PathBuf, SyncError> {
    let home = dirs::home_dir()
        .ok_or_else(|| SyncError::Configuration("Could not find home directory".to_string()))?;
    Ok(home.join(".memberdir").join("config.json"))
}

/// Read a config file. A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config, SyncError> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path).map_err(|e| {
        SyncError::Configuration(format!("Failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        SyncError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
    })
}

/// Apply `MEMBERDIR_*` overrides on top of the file config.
pub fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());

    if let Some(key) = var("MEMBERDIR_CRM_API_KEY") {
        config.crm.api_key = Some(key);
    }
    if let Some(raw) = var("MEMBERDIR_CRM_LIST_ID") {
        match raw.trim().parse::<u64>() {
            Ok(id) => config.crm.list_id = Some(id),
            Err(_) => log::warn!("Ignoring MEMBERDIR_CRM_LIST_ID={raw:?}: not a list id"),
        }
    }
    if let Some(url) = var("MEMBERDIR_CRM_BASE_URL") {
        config.crm.base_url = url;
    }
    if let Some(addr) = var("MEMBERDIR_BIND_ADDR") {
        config.server.bind_addr = addr;
    }
    if let Some(path) = var("MEMBERDIR_DB_PATH") {
        config.db_path = Some(path);
    }
}

/// Apply `mutator` to the config and persist it.
///
/// The on-disk file and the in-memory copy are updated under the same lock.
/// The file is replaced by rename, so readers never see a partial write.
pub fn create_or_update_config(
    state: &AppState,
    mutator: impl FnOnce(&mut Config),
) -> Result<Config, SyncError> {
    let mut guard = state.config.write();
    let mut config = guard.clone();
    mutator(&mut config);

    if let Some(path) = &state.config_path {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    SyncError::Configuration(format!("Failed to create config dir: {}", e))
                })?;
            }
        }

        let content = serde_json::to_string_pretty(&config).map_err(|e| {
            SyncError::Configuration(format!("Failed to serialize config: {}", e))
        })?;
        write_atomic(path, &content)?;
    }

    *guard = config.clone();
    Ok(config)
}

fn write_atomic(path: &Path, content: &str) -> Result<(), SyncError> {
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, content).map_err(|e| {
        SyncError::Configuration(format!(
            "Failed to write temp file {}: {}",
            temp_path.display(),
            e
        ))
    })?;
    fs::rename(&temp_path, path).map_err(|e| {
        SyncError::Configuration(format!("Failed to replace {}: {}", path.display(), e))
    })
}
