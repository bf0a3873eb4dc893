use std::path::{Path, PathBuf};

pub const DEFAULT_DB_PATH: &str = "student_courses.db";
pub const DEFAULT_SYNC_DB_FILE: &str = "student_courses_sync.db";
pub const DEFAULT_REMOTE_KEY: &str = "student_courses.db";
pub const DEFAULT_BUCKET: &str = "student-course-db";
pub const DEFAULT_BLOB_API_URL: &str = "https://blob.vercel-storage.com";
pub const DEFAULT_UPLOAD_FOLDER: &str = "uploads";
pub const DEFAULT_BACKUP_DIR: &str = "json_backup";

/// Everything the storage core reads from the process environment.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub database_url: Option<String>,
    pub db_host: Option<String>,
    pub db_port: Option<u16>,
    pub db_name: Option<String>,
    pub db_user: Option<String>,
    pub db_password: Option<String>,
    /// Explicit `DB_PATH`, if any.
    pub db_path: Option<PathBuf>,
    pub upload_folder: PathBuf,
    pub blob: BlobConfig,
    pub mirror: MirrorConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlobConfig {
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub s3_bucket: String,
    pub s3_key: String,
    pub google_credentials: Option<String>,
    pub gcs_bucket: String,
    pub gcs_blob: String,
    pub blob_token: Option<String>,
    pub blob_url: Option<String>,
    pub blob_name: String,
    pub blob_api_url: String,
    pub sync_inline: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MirrorConfig {
    pub enabled: bool,
    pub primary_dir: PathBuf,
    pub fallback_dir: PathBuf,
    pub export_credentials: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalConnection {
    Url(String),
    Parts {
        host: String,
        port: u16,
        name: String,
        user: String,
        password: String,
    },
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            aws_access_key_id: None,
            aws_secret_access_key: None,
            s3_bucket: DEFAULT_BUCKET.to_string(),
            s3_key: DEFAULT_REMOTE_KEY.to_string(),
            google_credentials: None,
            gcs_bucket: DEFAULT_BUCKET.to_string(),
            gcs_blob: DEFAULT_REMOTE_KEY.to_string(),
            blob_token: None,
            blob_url: None,
            blob_name: DEFAULT_REMOTE_KEY.to_string(),
            blob_api_url: DEFAULT_BLOB_API_URL.to_string(),
            sync_inline: false,
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            primary_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            fallback_dir: std::env::temp_dir().join(DEFAULT_BACKUP_DIR),
            export_credentials: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_host: None,
            db_port: None,
            db_name: None,
            db_user: None,
            db_password: None,
            db_path: None,
            upload_folder: PathBuf::from(DEFAULT_UPLOAD_FOLDER),
            blob: BlobConfig::default(),
            mirror: MirrorConfig::default(),
        }
    }
}

fn var(key: &str) -> Option<String> {
    dotenvy::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn flag(key: &str, default: bool) -> bool {
    match var(key) {
        Some(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let defaults = StorageConfig::default();

        let blob = BlobConfig {
            aws_access_key_id: var("AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
            s3_bucket: var("S3_BUCKET").unwrap_or(defaults.blob.s3_bucket),
            s3_key: var("S3_KEY").unwrap_or(defaults.blob.s3_key),
            google_credentials: var("GOOGLE_APPLICATION_CREDENTIALS"),
            gcs_bucket: var("GCS_BUCKET").unwrap_or(defaults.blob.gcs_bucket),
            gcs_blob: var("GCS_BLOB").unwrap_or(defaults.blob.gcs_blob),
            blob_token: var("BLOB_READ_WRITE_TOKEN"),
            blob_url: var("BLOB_URL"),
            blob_name: var("BLOB_NAME").unwrap_or(defaults.blob.blob_name),
            blob_api_url: var("BLOB_API_URL").unwrap_or(defaults.blob.blob_api_url),
            sync_inline: flag("BLOB_SYNC_INLINE", false),
        };

        let mirror = MirrorConfig {
            enabled: flag("JSON_BACKUP_ENABLED", true),
            primary_dir: var("JSON_BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.mirror.primary_dir),
            fallback_dir: var("JSON_BACKUP_FALLBACK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.mirror.fallback_dir),
            export_credentials: flag("JSON_BACKUP_CREDENTIALS", true),
        };

        Self {
            database_url: var("DATABASE_URL"),
            db_host: var("DB_HOST"),
            db_port: var("DB_PORT").and_then(|port| port.trim().parse().ok()),
            db_name: var("DB_NAME"),
            db_user: var("DB_USER"),
            db_password: var("DB_PASSWORD"),
            db_path: var("DB_PATH").map(PathBuf::from),
            upload_folder: var("UPLOAD_FOLDER")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_folder),
            blob,
            mirror,
        }
    }

    /// Configuration for a plain embedded store at `path`, used by tests and tools.
    pub fn embedded(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn external_connection(&self) -> Option<ExternalConnection> {
        if let Some(url) = &self.database_url {
            return Some(ExternalConnection::Url(url.clone()));
        }

        match (&self.db_host, &self.db_name, &self.db_user, &self.db_password) {
            (Some(host), Some(name), Some(user), Some(password)) => {
                Some(ExternalConnection::Parts {
                    host: host.clone(),
                    port: self.db_port.unwrap_or(5432),
                    name: name.clone(),
                    user: user.clone(),
                    password: password.clone(),
                })
            }
            _ => None,
        }
    }

    pub fn embedded_path(&self) -> &Path {
        self.db_path
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_DB_PATH))
    }

    /// Local file the synced embedded store works on.
    pub fn sync_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_SYNC_DB_FILE))
    }
}

impl BlobConfig {
    pub fn has_s3_credentials(&self) -> bool {
        self.aws_access_key_id.is_some() && self.aws_secret_access_key.is_some()
    }

    pub fn has_gcs_credentials(&self) -> bool {
        self.google_credentials.is_some()
    }

    pub fn has_http_blob_credentials(&self) -> bool {
        self.blob_token.is_some()
    }

    pub fn has_credentials(&self) -> bool {
        self.has_s3_credentials() || self.has_gcs_credentials() || self.has_http_blob_credentials()
    }
}
