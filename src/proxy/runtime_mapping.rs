use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tracing::info;

use crate::model_routing::{ModelMappingTable, load_model_mapping};

const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(800);

/// Current model mapping. Reloads swap in a new `Arc`; requests keep the snapshot they took.
pub struct RuntimeMapping {
    path: PathBuf,
    auto_reload: bool,
    current: AsyncRwLock<Arc<ModelMappingTable>>,
    reload: AsyncMutex<ReloadState>,
}

#[derive(Debug)]
struct ReloadState {
    last_check_at: Instant,
    last_mtime: Option<SystemTime>,
}

impl RuntimeMapping {
    pub fn new(path: impl Into<PathBuf>, auto_reload: bool, initial: ModelMappingTable) -> Self {
        Self {
            path: path.into(),
            auto_reload,
            current: AsyncRwLock::new(Arc::new(initial)),
            reload: AsyncMutex::new(ReloadState {
                last_check_at: Instant::now()
                    .checked_sub(Duration::from_secs(60))
                    .unwrap_or_else(Instant::now),
                last_mtime: None,
            }),
        }
    }

    pub async fn load(path: impl Into<PathBuf>, auto_reload: bool) -> Self {
        let path = path.into();
        let table = load_model_mapping(&path).await;
        let mapping = Self::new(path, auto_reload, table);
        mapping.reload.lock().await.last_mtime = file_mtime(&mapping.path).await;
        mapping
    }

    pub async fn snapshot(&self) -> Arc<ModelMappingTable> {
        self.current.read().await.clone()
    }

    /// Re-read the mapping file unconditionally; returns the number of mapped models.
    pub async fn force_reload(&self) -> usize {
        let mtime = file_mtime(&self.path).await;
        let table = load_model_mapping(&self.path).await;
        let count = table.len();
        *self.current.write().await = Arc::new(table);
        self.reload.lock().await.last_mtime = mtime;
        info!("model mapping reloaded ({count} models)");
        count
    }

    /// Reload when auto reload is on and the file's mtime moved since the last load.
    pub async fn maybe_reload_from_disk(&self) {
        if !self.auto_reload {
            return;
        }

        let last_mtime = {
            let mut st = self.reload.lock().await;
            if st.last_check_at.elapsed() < MIN_CHECK_INTERVAL {
                return;
            }
            st.last_check_at = Instant::now();
            st.last_mtime
        };

        let mtime = file_mtime(&self.path).await;
        if mtime == last_mtime {
            return;
        }

        let table = load_model_mapping(&self.path).await;
        info!(
            "model mapping file changed on disk; reloaded {} models",
            table.len()
        );
        *self.current.write().await = Arc::new(table);

        let mut st = self.reload.lock().await;
        st.last_mtime = mtime;
    }
}

async fn file_mtime(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
}
