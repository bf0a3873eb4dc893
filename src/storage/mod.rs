pub mod adapter;
pub mod backend;
pub mod blob;
pub mod bridge;
mod error;
pub mod mirror;
pub mod schema;
pub mod sql;
mod value;

use std::borrow::Cow;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{info, instrument, warn};

pub use backend::{Backend, select_backend};
pub use blob::{BlobProvider, BlobProviderKind};
pub use bridge::{BridgeState, PersistenceBridge};
pub use error::StorageError;
pub use mirror::{BackupReport, BackupStatus, MemoryBackup, MirrorError, SnapshotKind, SnapshotLocation};
pub use schema::Table;
pub use value::{FetchMode, Outcome, Row, SqlValue, Statement};

use crate::config::StorageConfig;

enum ConfigSource {
    /// Re-read on every call so the backend can change without a restart.
    Environment,
    Fixed(StorageConfig),
}

/// Entry point for all data access.
///
/// Every call selects the backend from the current configuration, runs its
/// statements in one transaction on a fresh connection and, when data
/// changed, triggers the blob sync and the JSON mirror.
pub struct Database {
    source: ConfigSource,
    memory: MemoryBackup,
    bridge: Mutex<Option<Arc<PersistenceBridge>>>,
    insert_lock: tokio::sync::Mutex<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    pub backend: Backend,
    pub blob_provider: Option<BlobProviderKind>,
    pub sync_state: Option<BridgeState>,
    pub database: String,
    pub json_backup_enabled: bool,
}

impl Database {
    pub fn from_env() -> Self {
        Self::with_source(ConfigSource::Environment)
    }

    pub fn new(config: StorageConfig) -> Self {
        Self::with_source(ConfigSource::Fixed(config))
    }

    fn with_source(source: ConfigSource) -> Self {
        Self {
            source,
            memory: MemoryBackup::new(),
            bridge: Mutex::new(None),
            insert_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn with_memory_backup(mut self, memory: MemoryBackup) -> Self {
        self.memory = memory;
        self
    }

    /// Uses `bridge` instead of building one from the blob configuration.
    #[cfg(test)]
    pub fn with_bridge(self, bridge: Arc<PersistenceBridge>) -> Self {
        *self.bridge.lock().unwrap_or_else(PoisonError::into_inner) = Some(bridge);
        self
    }

    pub fn config(&self) -> Cow<'_, StorageConfig> {
        match &self.source {
            ConfigSource::Environment => Cow::Owned(StorageConfig::from_env()),
            ConfigSource::Fixed(config) => Cow::Borrowed(config),
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend_for(&self.config())
    }

    fn backend_for(&self, config: &StorageConfig) -> Backend {
        select_backend(config)
    }

    /// The bridge for the synced backend, built on first use and kept for
    /// the life of the process.
    fn bridge_for(&self, config: &StorageConfig) -> Option<Arc<PersistenceBridge>> {
        let mut slot = self.bridge.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bridge) = slot.as_ref() {
            return Some(Arc::clone(bridge));
        }

        let provider: Arc<dyn BlobProvider> = blob::provider_from_config(&config.blob)?.into();
        let bridge = Arc::new(
            PersistenceBridge::new(provider, config.sync_path()).inline(config.blob.sync_inline),
        );
        info!(
            provider = bridge.provider_name(),
            path = %bridge.local_path().display(),
            "Blob sync enabled"
        );
        *slot = Some(Arc::clone(&bridge));
        Some(bridge)
    }

    /// Runs statements without any after-write work.
    async fn dispatch(
        &self,
        config: &StorageConfig,
        statements: &[Statement],
    ) -> Result<Vec<Outcome>, StorageError> {
        let backend = self.backend_for(config);

        if backend == Backend::EmbeddedWithSync {
            if let Some(bridge) = self.bridge_for(config) {
                bridge.ensure_warm().await;
            }
        }

        let handler = adapter::handler_for(backend, config)?;

        // Explicit-key inserts read MAX(id) first; two of them interleaving
        // would pick the same id.
        let _guard = if backend.is_embedded() && statements.iter().any(Statement::is_insert) {
            Some(self.insert_lock.lock().await)
        } else {
            None
        };

        handler.run_batch(statements).await
    }

    /// Blob sync and JSON snapshot after a write. `None` in `touched` means
    /// the table could not be determined and every snapshot is rewritten.
    async fn after_write(&self, config: &StorageConfig, touched: &[Option<Table>]) {
        if self.backend_for(config) == Backend::EmbeddedWithSync {
            if let Some(bridge) = self.bridge_for(config) {
                bridge.after_write().await;
            }
        }

        if !config.mirror.enabled {
            return;
        }

        let tables: Vec<Table> = if touched.iter().any(Option::is_none) {
            Table::ALL.to_vec()
        } else {
            touched.iter().flatten().copied().collect()
        };

        let report = self.snapshot_tables(config, &tables).await;
        if !report.is_complete() {
            warn!(failed = report.failed, "Some snapshots could not be written");
        }
    }

    async fn execute_statements(
        &self,
        statements: Vec<Statement>,
    ) -> Result<Vec<Outcome>, StorageError> {
        let config = self.config();
        let outcomes = self.dispatch(&config, &statements).await?;

        let touched: Vec<Option<Table>> = statements
            .iter()
            .filter(|statement| statement.changes_data())
            .map(Statement::touched_table)
            .collect();
        if !touched.is_empty() {
            self.after_write(&config, &touched).await;
        }

        Ok(outcomes)
    }

    #[instrument(skip(self, params), fields(params = params.len()))]
    pub async fn run(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
        fetch: FetchMode,
    ) -> Result<Vec<Row>, StorageError> {
        let statement = Statement::query(sql, params).with_fetch(fetch);
        Ok(self
            .execute_statements(vec![statement])
            .await?
            .into_iter()
            .next()
            .map(Outcome::into_rows)
            .unwrap_or_default())
    }

    pub async fn fetch_one(&self, sql: &str, params: Vec<SqlValue>) -> Result<Option<Row>, StorageError> {
        Ok(self.run(sql, params, FetchMode::One).await?.into_iter().next())
    }

    pub async fn fetch_all(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>, StorageError> {
        self.run(sql, params, FetchMode::All).await
    }

    pub async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<(), StorageError> {
        self.run(sql, params, FetchMode::None).await.map(|_| ())
    }

    /// Inserts one row and returns its generated id.
    #[instrument(skip(self, columns), fields(table = table.name()))]
    pub async fn insert(
        &self,
        table: Table,
        columns: Vec<(&'static str, SqlValue)>,
    ) -> Result<i64, StorageError> {
        self.execute_statements(vec![Statement::insert(table, columns)])
            .await?
            .first()
            .and_then(Outcome::inserted_id)
            .ok_or_else(|| StorageError::Decode("insert returned no id".to_string()))
    }

    /// Runs all statements in one transaction.
    #[instrument(skip(self, statements), fields(count = statements.len()))]
    pub async fn run_batch(&self, statements: Vec<Statement>) -> Result<Vec<Outcome>, StorageError> {
        self.execute_statements(statements).await
    }

    #[instrument(skip(self))]
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        let config = self.config();
        let backend = self.backend_for(&config);
        let statements: Vec<Statement> = schema::schema_for(backend)
            .iter()
            .map(|sql| Statement::query(*sql, Vec::new()))
            .collect();

        self.dispatch(&config, &statements).await?;
        info!(%backend, "Schema ready");
        Ok(())
    }

    pub async fn count_users(&self) -> Result<i64, StorageError> {
        let row = self
            .fetch_one("SELECT COUNT(*) AS count FROM users", Vec::new())
            .await?;
        Ok(row.and_then(|row| row.get_i64("count")).unwrap_or(0))
    }

    /// Creates the schema and, when the user table is empty, restores it
    /// from the JSON mirror. Returns the number of users restored.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<usize, StorageError> {
        self.ensure_schema().await?;

        if self.count_users().await? == 0 {
            return self.restore_users().await;
        }
        Ok(0)
    }

    pub async fn backup_now(&self) -> BackupReport {
        self.write_all_snapshots().await
    }

    pub async fn restore_now(&self) -> Result<usize, StorageError> {
        self.restore_users().await
    }

    pub fn storage_info(&self) -> StorageInfo {
        let config = self.config();
        let backend = self.backend_for(&config);

        let database = match backend {
            Backend::ExternalRelational => "external".to_string(),
            Backend::Embedded => config.embedded_path().display().to_string(),
            Backend::EmbeddedWithSync => config.sync_path().display().to_string(),
        };

        let sync_state = match backend {
            Backend::EmbeddedWithSync => self
                .bridge
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map(|bridge| bridge.state()),
            _ => None,
        };

        StorageInfo {
            backend,
            blob_provider: match backend {
                Backend::EmbeddedWithSync => BlobProviderKind::detect(&config.blob),
                _ => None,
            },
            sync_state,
            database,
            json_backup_enabled: config.mirror.enabled,
        }
    }
}
