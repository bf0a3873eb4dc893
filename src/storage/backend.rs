use std::fmt;

use serde::Serialize;

use crate::config::StorageConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    ExternalRelational,
    Embedded,
    EmbeddedWithSync,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::ExternalRelational => "external-relational",
            Backend::Embedded => "embedded",
            Backend::EmbeddedWithSync => "embedded-with-sync",
        }
    }

    /// Whether the backend generates identity values itself.
    pub fn native_identity(&self) -> bool {
        matches!(self, Backend::ExternalRelational)
    }

    pub fn is_embedded(&self) -> bool {
        !self.native_identity()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks the active backend. First match wins: a complete external
/// connection, then any blob credential, then the plain embedded store.
pub fn select_backend(config: &StorageConfig) -> Backend {
    if config.external_connection().is_some() {
        Backend::ExternalRelational
    } else if config.blob.has_credentials() {
        Backend::EmbeddedWithSync
    } else {
        Backend::Embedded
    }
}
