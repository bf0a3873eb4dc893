use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::AppError;

pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "txt", "pdf", "doc", "docx", "png", "jpg", "jpeg", "gif", "zip", "mp3", "wav", "m4a",
];

/// Course attachments on the local filesystem.
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.upload_folder)
    }

    pub fn allowed_file(filename: &str) -> bool {
        filename
            .rsplit_once('.')
            .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }

    /// Reduces a client-supplied name to ASCII letters, digits, `.`, `-` and
    /// `_`, with no directory components or leading dots.
    pub fn secure_filename(filename: &str) -> String {
        let base = filename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default();

        let cleaned: String = base
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
            .collect();

        cleaned.trim_start_matches(['.', '_']).to_string()
    }

    /// Timestamp-prefixed name the bytes are stored under.
    pub fn storage_name(filename: &str) -> Option<String> {
        let secure = Self::secure_filename(filename);
        if secure.is_empty() {
            return None;
        }
        Some(format!("{}_{}", Utc::now().timestamp(), secure))
    }

    /// Validates `filename` and returns the path its bytes should be written to.
    pub async fn prepare(&self, filename: &str) -> Result<PathBuf, AppError> {
        if !Self::allowed_file(filename) {
            return Err(AppError::Validation("File type not allowed".to_string()));
        }

        let name = Self::storage_name(filename)
            .ok_or_else(|| AppError::Validation("No file selected".to_string()))?;

        tokio::fs::create_dir_all(&self.root).await?;
        Ok(self.root.join(name))
    }

    /// Removes stored bytes. Failure is logged and reported, never raised.
    pub async fn remove(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Removed stored file");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove stored file");
                false
            }
        }
    }
}
