//! Flat JSON snapshots of the relational tables.
//!
//! Snapshots are written after every mutating call and are never
//! authoritative. Each write tries the primary directory, then the fallback
//! directory, then an in-process [`MemoryBackup`]. The only thing ever read
//! back is the user credential snapshot, to repopulate an empty user table on
//! a cold start.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::backend::Backend;
use super::error::StorageError;
use super::schema::Table;
use super::value::{Row, Statement};
use super::Database;
use crate::config::{MirrorConfig, StorageConfig};

pub const BACKUP_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Users,
    UserCredentials,
    Courses,
    Assignments,
    Files,
}

impl SnapshotKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            SnapshotKind::Users => "users.json",
            SnapshotKind::UserCredentials => "users_credentials.json",
            SnapshotKind::Courses => "courses.json",
            SnapshotKind::Assignments => "assignments.json",
            SnapshotKind::Files => "files.json",
        }
    }

    /// Key holding the record array inside the document.
    pub fn collection(&self) -> &'static str {
        match self {
            SnapshotKind::Users | SnapshotKind::UserCredentials => "users",
            SnapshotKind::Courses => "courses",
            SnapshotKind::Assignments => "assignments",
            SnapshotKind::Files => "files",
        }
    }

    fn note(&self) -> Option<&'static str> {
        match self {
            SnapshotKind::Users => Some("Password hashes excluded for security"),
            SnapshotKind::UserCredentials => {
                Some("Contains password hashes for disaster recovery")
            }
            SnapshotKind::Files => Some("Contains file metadata only, not file contents"),
            SnapshotKind::Courses | SnapshotKind::Assignments => None,
        }
    }

    fn select_sql(&self) -> &'static str {
        match self {
            SnapshotKind::Users => "SELECT id, email, role, created_at FROM users ORDER BY id",
            SnapshotKind::UserCredentials => {
                "SELECT id, email, hashed_password, role, created_at FROM users ORDER BY id"
            }
            SnapshotKind::Courses => {
                "SELECT id, title, description, content_richtext, lyrics, audio, created_at \
                 FROM courses ORDER BY id"
            }
            SnapshotKind::Assignments => {
                "SELECT ac.id, ac.user_id, ac.course_id, ac.assigned_at, \
                 u.email AS user_email, c.title AS course_title \
                 FROM assigned_courses ac \
                 JOIN users u ON u.id = ac.user_id \
                 JOIN courses c ON c.id = ac.course_id \
                 ORDER BY ac.id"
            }
            SnapshotKind::Files => {
                "SELECT id, course_id, filename, file_path, uploaded_at FROM files ORDER BY id"
            }
        }
    }

    /// Snapshots that mirror `table`.
    pub fn for_table(table: Table, config: &MirrorConfig) -> Vec<SnapshotKind> {
        match table {
            Table::Users if config.export_credentials => {
                vec![SnapshotKind::Users, SnapshotKind::UserCredentials]
            }
            Table::Users => vec![SnapshotKind::Users],
            Table::Courses => vec![SnapshotKind::Courses],
            Table::Assignments => vec![SnapshotKind::Assignments],
            Table::Files => vec![SnapshotKind::Files],
        }
    }

    pub fn enabled_kinds(config: &MirrorConfig) -> Vec<SnapshotKind> {
        Table::ALL
            .into_iter()
            .flat_map(|table| SnapshotKind::for_table(table, config))
            .collect()
    }
}

/// Process-lifetime last-resort snapshot store. Cloning shares the same
/// underlying map, so a test can hold one handle and inspect what the
/// database wrote through another.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackup {
    inner: Arc<Mutex<HashMap<SnapshotKind, Value>>>,
}

impl MemoryBackup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, kind: SnapshotKind, document: Value) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, document);
    }

    pub fn get(&self, kind: SnapshotKind) -> Option<Value> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum SnapshotLocation {
    Primary(PathBuf),
    Fallback(PathBuf),
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    pub written: usize,
    pub failed: usize,
}

impl BackupReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    fn record(&mut self, result: &Result<SnapshotLocation, MirrorError>) {
        match result {
            Ok(_) => self.written += 1,
            Err(_) => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotStatus {
    pub file: &'static str,
    pub location: Option<SnapshotLocation>,
    pub exists: bool,
    pub size_bytes: u64,
    pub record_count: u64,
    pub last_backup: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupStatus {
    pub enabled: bool,
    pub backup_directory: PathBuf,
    pub backup_directory_exists: bool,
    pub fallback_directory: PathBuf,
    pub memory_snapshots: usize,
    pub snapshots: Vec<SnapshotStatus>,
}

/// File-level half of the mirror: document layout and the location chain.
pub struct JsonMirror<'a> {
    config: &'a MirrorConfig,
    memory: &'a MemoryBackup,
}

impl<'a> JsonMirror<'a> {
    pub fn new(config: &'a MirrorConfig, memory: &'a MemoryBackup) -> Self {
        Self { config, memory }
    }

    pub fn document(kind: SnapshotKind, records: Vec<Value>) -> Value {
        let mut doc = Map::new();
        let count = records.len();
        doc.insert(kind.collection().to_string(), Value::Array(records));
        doc.insert("total_count".to_string(), json!(count));
        doc.insert("last_backup".to_string(), json!(Utc::now().to_rfc3339()));
        doc.insert("backup_version".to_string(), json!(BACKUP_VERSION));
        if let Some(note) = kind.note() {
            doc.insert("note".to_string(), json!(note));
        }
        Value::Object(doc)
    }

    /// Writes `document`, falling through primary, fallback and memory.
    pub async fn persist(&self, kind: SnapshotKind, document: Value) -> SnapshotLocation {
        match write_file(&self.config.primary_dir, kind, &document).await {
            Ok(path) => return SnapshotLocation::Primary(path),
            Err(e) => warn!(
                file = kind.file_name(),
                dir = %self.config.primary_dir.display(),
                error = %e,
                "Primary snapshot location failed"
            ),
        }

        match write_file(&self.config.fallback_dir, kind, &document).await {
            Ok(path) => return SnapshotLocation::Fallback(path),
            Err(e) => warn!(
                file = kind.file_name(),
                dir = %self.config.fallback_dir.display(),
                error = %e,
                "Fallback snapshot location failed, keeping snapshot in memory"
            ),
        }

        self.memory.put(kind, document);
        SnapshotLocation::Memory
    }

    /// Every readable copy of `kind`, with where it came from.
    pub async fn load_all(&self, kind: SnapshotKind) -> Vec<(SnapshotLocation, Value)> {
        let mut found = Vec::new();

        let primary = self.config.primary_dir.join(kind.file_name());
        if let Some(doc) = read_file(&primary).await {
            found.push((SnapshotLocation::Primary(primary), doc));
        }

        let fallback = self.config.fallback_dir.join(kind.file_name());
        if let Some(doc) = read_file(&fallback).await {
            found.push((SnapshotLocation::Fallback(fallback), doc));
        }

        if let Some(doc) = self.memory.get(kind) {
            found.push((SnapshotLocation::Memory, doc));
        }

        found
    }

    /// The most recent user snapshot whose records carry password hashes.
    pub async fn latest_credentials(&self) -> Option<Value> {
        let mut candidates = self.load_all(SnapshotKind::UserCredentials).await;
        candidates.extend(self.load_all(SnapshotKind::Users).await);

        candidates
            .into_iter()
            .map(|(_, doc)| doc)
            .filter(|doc| {
                doc.get("users")
                    .and_then(Value::as_array)
                    .is_some_and(|users| {
                        users.iter().any(|user| {
                            user.get("hashed_password").and_then(Value::as_str).is_some()
                        })
                    })
            })
            .max_by(|a, b| last_backup(a).cmp(last_backup(b)))
    }

    pub async fn status(&self, kinds: &[SnapshotKind]) -> BackupStatus {
        let mut snapshots = Vec::with_capacity(kinds.len());

        for kind in kinds {
            let mut status = SnapshotStatus {
                file: kind.file_name(),
                location: None,
                exists: false,
                size_bytes: 0,
                record_count: 0,
                last_backup: None,
            };

            if let Some((location, doc)) = self.load_all(*kind).await.into_iter().next() {
                status.size_bytes = match &location {
                    SnapshotLocation::Primary(path) | SnapshotLocation::Fallback(path) => {
                        tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
                    }
                    SnapshotLocation::Memory => {
                        serde_json::to_vec(&doc).map(|b| b.len() as u64).unwrap_or(0)
                    }
                };
                status.exists = true;
                status.location = Some(location);
                status.record_count = doc.get("total_count").and_then(Value::as_u64).unwrap_or(0);
                status.last_backup = doc
                    .get("last_backup")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }

            snapshots.push(status);
        }

        BackupStatus {
            enabled: self.config.enabled,
            backup_directory: self.config.primary_dir.clone(),
            backup_directory_exists: tokio::fs::try_exists(&self.config.primary_dir)
                .await
                .unwrap_or(false),
            fallback_directory: self.config.fallback_dir.clone(),
            memory_snapshots: self.memory.len(),
            snapshots,
        }
    }
}

fn last_backup(doc: &Value) -> &str {
    doc.get("last_backup").and_then(Value::as_str).unwrap_or_default()
}

async fn write_file(dir: &Path, kind: SnapshotKind, document: &Value) -> Result<PathBuf, MirrorError> {
    let bytes = serde_json::to_vec_pretty(document)?;
    let dir = dir.to_path_buf();
    let path = dir.join(kind.file_name());

    // One temp file per write; concurrent writers of a snapshot must not share it.
    tokio::task::spawn_blocking(move || -> Result<PathBuf, MirrorError> {
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(kind.file_name())
            .suffix(".tmp")
            .tempfile_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(path)
    })
    .await
    .map_err(std::io::Error::other)?
}

async fn read_file(path: &Path) -> Option<Value> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(doc) => Some(doc),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable snapshot");
            None
        }
    }
}

async fn file_records(rows: Vec<Row>) -> Vec<Value> {
    let mut records = Vec::with_capacity(rows.len());

    for row in rows {
        let size = match row.get_str("file_path") {
            Some(path) => tokio::fs::metadata(path).await.ok().map(|m| m.len()),
            None => None,
        };

        let mut row = row;
        row.insert("file_exists", json!(size.is_some()));
        row.insert("file_size_bytes", json!(size.unwrap_or(0)));
        records.push(Value::Object(row.into_map()));
    }

    records
}

impl Database {
    fn mirror_for<'a>(&'a self, config: &'a StorageConfig) -> JsonMirror<'a> {
        JsonMirror::new(&config.mirror, &self.memory)
    }

    async fn snapshot_with(
        &self,
        config: &StorageConfig,
        kind: SnapshotKind,
    ) -> Result<SnapshotLocation, MirrorError> {
        let rows = self
            .dispatch(config, &[Statement::query(kind.select_sql(), Vec::new())])
            .await?
            .into_iter()
            .next()
            .map(|outcome| outcome.into_rows())
            .unwrap_or_default();

        let records = match kind {
            SnapshotKind::Files => file_records(rows).await,
            _ => rows
                .into_iter()
                .map(|row| Value::Object(row.into_map()))
                .collect(),
        };

        let count = records.len();
        let location = self
            .mirror_for(config)
            .persist(kind, JsonMirror::document(kind, records))
            .await;
        debug!(file = kind.file_name(), count, ?location, "Snapshot written");
        Ok(location)
    }

    /// Rewrites the snapshots mirroring `tables`. Failures are counted, not raised.
    pub(super) async fn snapshot_tables(
        &self,
        config: &StorageConfig,
        tables: &[Table],
    ) -> BackupReport {
        let mut report = BackupReport::default();
        let mut seen = HashSet::new();

        for table in tables {
            for kind in SnapshotKind::for_table(*table, &config.mirror) {
                if !seen.insert(kind) {
                    continue;
                }
                let result = self.snapshot_with(config, kind).await;
                if let Err(e) = &result {
                    warn!(file = kind.file_name(), error = %e, "Snapshot failed");
                }
                report.record(&result);
            }
        }

        report
    }

    #[instrument(skip(self))]
    pub async fn write_all_snapshots(&self) -> BackupReport {
        let config = self.config();
        let report = self.snapshot_tables(&config, &Table::ALL).await;
        info!(
            written = report.written,
            failed = report.failed,
            "JSON backup completed"
        );
        report
    }

    /// Re-inserts users missing from the table out of the most recent
    /// credential snapshot, keeping their original ids and hashes. Returns
    /// how many were inserted.
    #[instrument(skip(self))]
    pub async fn restore_users(&self) -> Result<usize, StorageError> {
        let config = self.config();
        let Some(doc) = self.mirror_for(&config).latest_credentials().await else {
            info!("No user snapshot with credentials found");
            return Ok(0);
        };

        let users = doc
            .get("users")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let existing: HashSet<String> = self
            .dispatch(&config, &[Statement::query("SELECT email FROM users", Vec::new())])
            .await?
            .into_iter()
            .flat_map(|outcome| outcome.into_rows())
            .filter_map(|row| row.get_str("email").map(str::to_string))
            .collect();

        let mut restored = 0;
        for user in &users {
            let (Some(id), Some(email), Some(hash), Some(role)) = (
                user.get("id").and_then(Value::as_i64),
                user.get("email").and_then(Value::as_str),
                user.get("hashed_password").and_then(Value::as_str),
                user.get("role").and_then(Value::as_str),
            ) else {
                continue;
            };

            if existing.contains(email) {
                debug!(email, "User already present, skipping");
                continue;
            }

            let insert = Statement::query(
                "INSERT INTO users (id, email, hashed_password, role) VALUES (?, ?, ?, ?)",
                crate::params![id, email, hash, role],
            );
            match self.dispatch(&config, &[insert]).await {
                Ok(_) => restored += 1,
                Err(e) => warn!(email, error = %e, "Failed to restore user"),
            }
        }

        if restored > 0 {
            if self.backend_for(&config) == Backend::ExternalRelational {
                let advance = Statement::query(
                    "SELECT setval(pg_get_serial_sequence('users', 'id'), \
                     (SELECT MAX(id) FROM users))",
                    Vec::new(),
                );
                if let Err(e) = self.dispatch(&config, &[advance]).await {
                    warn!(error = %e, "Failed to advance users id sequence");
                }
            }

            self.after_write(&config, &[Some(Table::Users)]).await;
        }

        info!(restored, "Users restored from JSON snapshot");
        Ok(restored)
    }

    pub async fn backup_status(&self) -> BackupStatus {
        let config = self.config();
        self.mirror_for(&config)
            .status(&SnapshotKind::enabled_kinds(&config.mirror))
            .await
    }
}
