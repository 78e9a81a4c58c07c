use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::Result;
use dirs::config_dir;
use phivault_storage::key_custodian::{DEFAULT_KEY_ALIAS, DEFAULT_UNLOCK_WINDOW};
use serde::{Deserialize, Serialize};

const DEFAULT_KEYRING_SERVICE: &str = "phivault";
const DEFAULT_RETENTION_DAYS: u32 = 30;
const DEFAULT_EXPORT_TTL_SECS: u64 = 300;
const DEFAULT_TRANSCRIPTION_TIMEOUT_SECS: u64 = 120;

/// User-level configuration loaded from `~/.config/phivault/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Override for data directory (encrypted stores).
    pub data_dir: Option<PathBuf>,
    pub security: Option<SecurityConfig>,
    pub audit: Option<AuditConfig>,
    pub capture: Option<CaptureConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyBackendKind {
    /// OS credential store.
    #[default]
    Keyring,
    /// Master key wrapped under a passphrase-derived key in the data dir.
    Passphrase,
    /// Process-lifetime key; nothing written survives a restart.
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SecurityConfig {
    pub key_backend: Option<KeyBackendKind>,
    pub key_alias: Option<String>,
    pub unlock_window_secs: Option<u64>,
    pub keyring_service: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct AuditConfig {
    pub retention_days: Option<u32>,
    pub export_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CaptureConfig {
    pub transcription_timeout_secs: Option<u64>,
}

impl Config {
    pub fn key_backend(&self) -> KeyBackendKind {
        self.security
            .as_ref()
            .and_then(|s| s.key_backend)
            .unwrap_or_default()
    }

    pub fn key_alias(&self) -> String {
        self.security
            .as_ref()
            .and_then(|s| s.key_alias.clone())
            .unwrap_or_else(|| DEFAULT_KEY_ALIAS.to_string())
    }

    pub fn unlock_window(&self) -> Duration {
        self.security
            .as_ref()
            .and_then(|s| s.unlock_window_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_UNLOCK_WINDOW)
    }

    pub fn keyring_service(&self) -> String {
        self.security
            .as_ref()
            .and_then(|s| s.keyring_service.clone())
            .unwrap_or_else(|| DEFAULT_KEYRING_SERVICE.to_string())
    }

    pub fn retention_days(&self) -> u32 {
        self.audit
            .as_ref()
            .and_then(|a| a.retention_days)
            .unwrap_or(DEFAULT_RETENTION_DAYS)
    }

    pub fn export_ttl(&self) -> Duration {
        Duration::from_secs(
            self.audit
                .as_ref()
                .and_then(|a| a.export_ttl_secs)
                .unwrap_or(DEFAULT_EXPORT_TTL_SECS),
        )
    }

    pub fn transcription_timeout(&self) -> Duration {
        Duration::from_secs(
            self.capture
                .as_ref()
                .and_then(|c| c.transcription_timeout_secs)
                .unwrap_or(DEFAULT_TRANSCRIPTION_TIMEOUT_SECS),
        )
    }

    /// Same config with every default spelled out, for writing a starter file.
    pub fn resolved(&self) -> Config {
        Config {
            data_dir: self.data_dir.clone(),
            security: Some(SecurityConfig {
                key_backend: Some(self.key_backend()),
                key_alias: Some(self.key_alias()),
                unlock_window_secs: Some(self.unlock_window().as_secs()),
                keyring_service: Some(self.keyring_service()),
            }),
            audit: Some(AuditConfig {
                retention_days: Some(self.retention_days()),
                export_ttl_secs: Some(self.export_ttl().as_secs()),
            }),
            capture: Some(CaptureConfig {
                transcription_timeout_secs: Some(self.transcription_timeout().as_secs()),
            }),
        }
    }
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("phivault").join("config.toml"))
}

/// Write the config with defaults filled in, unless a file already exists.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    let path = default_path()?;
    write_to_path_if_missing(config, &path)?;
    Ok(path)
}

fn write_to_path_if_missing(config: &Config, path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(&config.resolved())?;
    fs::write(path, body)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_default_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_from_path(dir.path().join("config.toml")).expect("load");
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.key_backend(), KeyBackendKind::Keyring);
        assert_eq!(cfg.unlock_window(), Duration::from_secs(12 * 60 * 60));
        assert_eq!(cfg.retention_days(), 30);
        assert_eq!(cfg.export_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn parses_custom_config() {
        let contents = r#"
            data_dir = "/tmp/phivault-data"
            [security]
            key_backend = "passphrase"
            unlock_window_secs = 3600
            [audit]
            retention_days = 7
            [capture]
            transcription_timeout_secs = 30
        "#;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("write temp config");

        let cfg = load_from_path(&path).expect("load");
        assert_eq!(cfg.data_dir, Some(PathBuf::from("/tmp/phivault-data")));
        assert_eq!(cfg.key_backend(), KeyBackendKind::Passphrase);
        assert_eq!(cfg.unlock_window(), Duration::from_secs(3600));
        assert_eq!(cfg.key_alias(), DEFAULT_KEY_ALIAS);
        assert_eq!(cfg.retention_days(), 7);
        assert_eq!(cfg.transcription_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_unknown_backend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[security]\nkey_backend = \"tpm\"\n").expect("write");
        assert!(load_from_path(&path).is_err());
    }

    #[test]
    fn write_default_creates_file_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let cfg = Config {
            data_dir: Some(PathBuf::from("/tmp/phivault-data")),
            ..Config::default()
        };

        assert!(write_to_path_if_missing(&cfg, &path).expect("write should succeed"));
        assert!(!write_to_path_if_missing(&Config::default(), &path).expect("second write ok"));

        let loaded = load_from_path(&path).expect("load");
        assert_eq!(loaded, cfg.resolved());
    }
}
