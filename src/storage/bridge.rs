use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use super::blob::{BlobError, BlobProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Cold,
    Hydrating,
    Warm,
    Syncing,
}

/// Keeps a local embedded database file in step with a remote blob.
///
/// The file is downloaded once, before first use, and only when no local
/// copy exists. After each write the whole file is uploaded again. Uploads
/// are best effort: a failure is logged and the local file stays
/// authoritative until the next successful sync.
pub struct PersistenceBridge {
    provider: Arc<dyn BlobProvider>,
    local_path: PathBuf,
    inline: bool,
    state: Mutex<BridgeState>,
    hydrated: OnceCell<()>,
}

impl PersistenceBridge {
    pub fn new(provider: Arc<dyn BlobProvider>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            local_path: local_path.into(),
            inline: false,
            state: Mutex::new(BridgeState::Cold),
            hydrated: OnceCell::new(),
        }
    }

    /// Upload in the calling task instead of a detached one.
    pub fn inline(mut self, inline: bool) -> Self {
        self.inline = inline;
        self
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: BridgeState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Hydrates the local file on first call; later calls return immediately.
    pub async fn ensure_warm(&self) {
        self.hydrated.get_or_init(|| self.hydrate()).await;
    }

    #[instrument(skip(self), fields(
        provider = self.provider.name(),
        key = self.provider.key(),
        path = %self.local_path.display()
    ))]
    async fn hydrate(&self) {
        self.set_state(BridgeState::Hydrating);

        if tokio::fs::try_exists(&self.local_path).await.unwrap_or(false) {
            info!("Using existing local database file");
        } else {
            match self.download().await {
                Ok(true) => info!("Downloaded database from blob storage"),
                Ok(false) => info!("No remote database found, starting fresh"),
                Err(e) => warn!(error = %e, "Database download failed, starting fresh"),
            }
        }

        self.set_state(BridgeState::Warm);
    }

    async fn download(&self) -> Result<bool, BlobError> {
        let Some(bytes) = self.provider.fetch().await? else {
            return Ok(false);
        };

        if let Some(parent) = self.local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.local_path, bytes).await?;
        Ok(true)
    }

    /// Uploads the current local file.
    pub async fn sync(&self) -> Result<(), BlobError> {
        self.set_state(BridgeState::Syncing);
        let result = self.upload().await;
        self.set_state(BridgeState::Warm);
        result
    }

    async fn upload(&self) -> Result<(), BlobError> {
        let bytes = tokio::fs::read(&self.local_path).await?;
        self.provider.store(bytes).await
    }

    async fn sync_logged(&self) {
        match self.sync().await {
            Ok(()) => info!(provider = self.provider.name(), "Database synced to blob storage"),
            Err(e) => error!(provider = self.provider.name(), error = %e, "Database sync failed"),
        }
    }

    /// Schedules an upload after a write. Returns the handle of the detached
    /// task, or `None` when the upload already ran inline.
    pub async fn after_write(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.inline {
            self.sync_logged().await;
            return None;
        }

        let bridge = Arc::clone(self);
        Some(tokio::spawn(async move { bridge.sync_logged().await }))
    }
}
