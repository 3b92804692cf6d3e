use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::StorageError;

/// Default lock refresh interval, in seconds.
pub const DEFAULT_LOCK_REFRESH_SECS: u64 = 900;
/// Default timeout for storage host connections, in seconds.
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;
/// Default minimum free space required before writing a working copy.
pub const DEFAULT_MIN_FREE_DISK_BYTES: u64 = 16 * 1024 * 1024;

/// Process-wide storage settings.
///
/// Loaded once at startup and shared read-only by the factory and every
/// backend it creates. Every field has a default so a partial JSON document
/// is accepted:
/// ```json
/// {
///   "filesystem": { "allow": true },
///   "wopi": {
///     "allow": true,
///     "hosts": [{ "host": "wopi\\.example\\.com", "allow": true }],
///     "alias_groups": {
///       "mode": "groups",
///       "groups": [{ "host": "https://wopi.example.com:443", "allow": true,
///                    "aliases": ["https://files.example.com"] }]
///     }
///   }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub filesystem: FilesystemSettings,
    pub wopi: WopiSettings,
    pub ssl: SslSettings,
    pub net: NetSettings,
    pub anonymization: AnonymizationSettings,
    /// Overrides any watermark text sent by the storage host.
    pub watermark_text: Option<String>,
    /// Minimum free space on the jail filesystem before a download or copy.
    pub min_free_disk_bytes: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            filesystem: FilesystemSettings::default(),
            wopi: WopiSettings::default(),
            ssl: SslSettings::default(),
            net: NetSettings::default(),
            anonymization: AnonymizationSettings::default(),
            watermark_text: None,
            min_free_disk_bytes: DEFAULT_MIN_FREE_DISK_BYTES,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilesystemSettings {
    pub allow: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WopiSettings {
    pub allow: bool,
    pub hosts: Vec<HostEntry>,
    /// Absent means compat mode: no alias checks at all.
    pub alias_groups: Option<AliasGroupSettings>,
    pub locking_refresh_secs: u64,
}

impl Default for WopiSettings {
    fn default() -> Self {
        Self {
            allow: false,
            hosts: Vec::new(),
            alias_groups: None,
            locking_refresh_secs: DEFAULT_LOCK_REFRESH_SECS,
        }
    }
}

/// A host pattern, either allowed or denied.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostEntry {
    pub host: String,
    pub allow: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasMode {
    /// Only the first host ever seen is authorized.
    #[default]
    First,
    /// Hosts and aliases come from the configured groups.
    Groups,
    /// No alias checks; canonical URIs are bare paths.
    Compat,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AliasGroupSettings {
    pub mode: AliasMode,
    pub groups: Vec<AliasGroup>,
}

/// A canonical storage host and the alternate authorities addressing it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AliasGroup {
    /// Absolute URL of the canonical host, e.g. `https://wopi.example.com:443`.
    pub host: String,
    pub allow: bool,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SslSettings {
    /// Let the URL scheme decide whether to use TLS.
    pub as_scheme: bool,
    /// Force TLS when `as_scheme` is off.
    pub enable: bool,
    /// CA bundle (PEM) used to verify the storage host.
    pub ca_file_path: Option<PathBuf>,
}

impl Default for SslSettings {
    fn default() -> Self {
        Self {
            as_scheme: true,
            enable: false,
            ca_file_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetSettings {
    pub connection_timeout_secs: u64,
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnonymizationSettings {
    pub enabled: bool,
    pub salt: u64,
}

impl Default for AnonymizationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            salt: 82589933,
        }
    }
}

impl StorageSettings {
    /// Load settings from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, StorageError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            StorageError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, StorageError> {
        serde_json::from_str(raw)
            .map_err(|e| StorageError::Config(format!("Invalid storage settings: {}", e)))
    }

    pub fn lock_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.wopi.locking_refresh_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.net.connection_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_takes_defaults() {
        let settings = StorageSettings::from_json("{}").unwrap();
        assert!(!settings.filesystem.allow);
        assert!(!settings.wopi.allow);
        assert!(settings.wopi.alias_groups.is_none());
        assert_eq!(settings.wopi.locking_refresh_secs, DEFAULT_LOCK_REFRESH_SECS);
        assert!(settings.ssl.as_scheme);
        assert_eq!(settings.connection_timeout(), Duration::from_secs(30));
        assert_eq!(settings.min_free_disk_bytes, DEFAULT_MIN_FREE_DISK_BYTES);
    }

    #[test]
    fn test_alias_groups_parse() {
        let settings = StorageSettings::from_json(
            r#"{
                "wopi": {
                    "allow": true,
                    "hosts": [{"host": "wopi\\.example\\.com", "allow": true}],
                    "alias_groups": {
                        "mode": "groups",
                        "groups": [{"host": "https://wopi.example.com", "allow": true,
                                    "aliases": ["https://alias.example.com:8443"]}]
                    }
                },
                "min_free_disk_bytes": 0
            }"#,
        )
        .unwrap();

        let groups = settings.wopi.alias_groups.unwrap();
        assert_eq!(groups.mode, AliasMode::Groups);
        assert_eq!(groups.groups.len(), 1);
        assert_eq!(groups.groups[0].aliases, vec!["https://alias.example.com:8443"]);
        assert_eq!(settings.min_free_disk_bytes, 0);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = StorageSettings::from_json("{not json").unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
