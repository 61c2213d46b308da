//! # Configuration
//!
//! Centralizes all settings with a clear override hierarchy:
//! defaults → config file → env vars → CLI flags.
//!
//! Config lives at `~/.flownav/config.toml`. If missing on first run, a
//! commented-out default is generated so users can discover all options.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Config Structs (all fields Option<T> for sparse TOML)
// ============================================================================

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    pub hook_timeout_ms: Option<u64>,
    pub root_switch_grace_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct HistoryConfig {
    pub max_entries: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    pub backend: Option<StorageBackend>,
    pub dir: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
}

impl StorageBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(StorageBackend::Memory),
            "file" => Some(StorageBackend::File),
            _ => None,
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_HOOK_TIMEOUT_MS: u64 = 8_000;
pub const DEFAULT_ROOT_SWITCH_GRACE_MS: u64 = 1_000;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

// ============================================================================
// Resolved Config (concrete values, no Options)
// ============================================================================

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub hook_timeout: Duration,
    pub root_switch_grace: Duration,
    pub history_limit: usize,
    pub storage: StorageBackend,
    pub storage_dir: Option<PathBuf>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            hook_timeout: Duration::from_millis(DEFAULT_HOOK_TIMEOUT_MS),
            root_switch_grace: Duration::from_millis(DEFAULT_ROOT_SWITCH_GRACE_MS),
            history_limit: DEFAULT_HISTORY_LIMIT,
            storage: StorageBackend::default(),
            storage_dir: None,
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "config parse error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Loading
// ============================================================================

/// Returns the path to `~/.flownav/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".flownav").join("config.toml"))
}

/// Load config from `~/.flownav/config.toml`.
///
/// If the file doesn't exist, generates a commented-out default and
/// returns `FlowConfig::default()`. If it exists but is malformed,
/// returns `ConfigError::Parse`.
pub fn load_config() -> Result<FlowConfig, ConfigError> {
    let path = match config_path() {
        Some(p) => p,
        None => {
            warn!("Could not determine home directory, using default config");
            return Ok(FlowConfig::default());
        }
    };

    if !path.exists() {
        info!("No config file found, generating default at {}", path.display());
        generate_default_config(&path);
        return Ok(FlowConfig::default());
    }

    load_config_from(&path)
}

/// Load config from an explicit path. Missing file is an I/O error here.
pub fn load_config_from(path: &PathBuf) -> Result<FlowConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(ConfigError::Io)?;
    let config: FlowConfig = toml::from_str(&contents).map_err(ConfigError::Parse)?;
    info!("Loaded config from {}", path.display());
    debug!("Config: {:?}", config);
    Ok(config)
}

/// Generates a commented-out default config file at the given path.
fn generate_default_config(path: &PathBuf) {
    let default_content = r#"# flownav configuration
# All settings are optional; defaults are used for anything not specified.
# Override hierarchy: defaults → this file → env vars → CLI flags.

# [runtime]
# hook_timeout_ms = 8000          # FLOWNAV_HOOK_TIMEOUT_MS
# root_switch_grace_ms = 1000     # FLOWNAV_ROOT_SWITCH_GRACE_MS

# [history]
# max_entries = 50                # FLOWNAV_HISTORY_LIMIT

# [storage]
# backend = "memory"              # "memory" or "file"; FLOWNAV_STORAGE
# dir = "/path/to/storage"        # FLOWNAV_STORAGE_DIR, default ~/.flownav/storage
"#;

    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!("Failed to create config directory: {}", e);
            return;
        }
    }
    if let Err(e) = fs::write(path, default_content) {
        warn!("Failed to write default config: {}", e);
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolve the final config by collapsing: defaults → config file → env vars → CLI.
///
/// `cli_storage` is the `--storage` flag (None = not specified).
pub fn resolve(config: &FlowConfig, cli_storage: Option<StorageBackend>) -> ResolvedConfig {
    resolve_with_env(config, cli_storage, |name| std::env::var(name).ok())
}

/// Same as [`resolve`] with an injectable environment lookup.
pub fn resolve_with_env<F>(
    config: &FlowConfig,
    cli_storage: Option<StorageBackend>,
    env: F,
) -> ResolvedConfig
where
    F: Fn(&str) -> Option<String>,
{
    let env_u64 = |name: &str| -> Option<u64> {
        let raw = env(name)?;
        match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring {}={:?}: not a number", name, raw);
                None
            }
        }
    };

    // Hook timeout: env → config → default
    let hook_timeout_ms = env_u64("FLOWNAV_HOOK_TIMEOUT_MS")
        .or(config.runtime.hook_timeout_ms)
        .unwrap_or(DEFAULT_HOOK_TIMEOUT_MS);

    let grace_ms = env_u64("FLOWNAV_ROOT_SWITCH_GRACE_MS")
        .or(config.runtime.root_switch_grace_ms)
        .unwrap_or(DEFAULT_ROOT_SWITCH_GRACE_MS);

    let history_limit = env_u64("FLOWNAV_HISTORY_LIMIT")
        .map(|v| v as usize)
        .or(config.history.max_entries)
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .max(1);

    // Storage backend: CLI → env → config → default
    let storage = cli_storage
        .or_else(|| env("FLOWNAV_STORAGE").and_then(|s| StorageBackend::parse(&s)))
        .or(config.storage.backend)
        .unwrap_or_default();

    let storage_dir = env("FLOWNAV_STORAGE_DIR")
        .or_else(|| config.storage.dir.clone())
        .map(PathBuf::from);

    ResolvedConfig {
        hook_timeout: Duration::from_millis(hook_timeout_ms),
        root_switch_grace: Duration::from_millis(grace_ms),
        history_limit,
        storage,
        storage_dir,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_default_config_parses() {
        let config = FlowConfig::default();
        assert!(config.runtime.hook_timeout_ms.is_none());
        assert!(config.storage.backend.is_none());
    }

    #[test]
    fn test_resolve_uses_defaults_when_empty() {
        let resolved = resolve_with_env(&FlowConfig::default(), None, no_env);
        assert_eq!(resolved.hook_timeout, Duration::from_millis(DEFAULT_HOOK_TIMEOUT_MS));
        assert_eq!(
            resolved.root_switch_grace,
            Duration::from_millis(DEFAULT_ROOT_SWITCH_GRACE_MS)
        );
        assert_eq!(resolved.history_limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(resolved.storage, StorageBackend::Memory);
        assert!(resolved.storage_dir.is_none());
    }

    #[test]
    fn test_resolve_config_values_override_defaults() {
        let config = FlowConfig {
            runtime: RuntimeConfig {
                hook_timeout_ms: Some(250),
                root_switch_grace_ms: Some(10),
            },
            history: HistoryConfig { max_entries: Some(5) },
            storage: StorageConfig {
                backend: Some(StorageBackend::File),
                dir: Some("/tmp/flow".to_string()),
            },
        };
        let resolved = resolve_with_env(&config, None, no_env);
        assert_eq!(resolved.hook_timeout, Duration::from_millis(250));
        assert_eq!(resolved.root_switch_grace, Duration::from_millis(10));
        assert_eq!(resolved.history_limit, 5);
        assert_eq!(resolved.storage, StorageBackend::File);
        assert_eq!(resolved.storage_dir, Some(PathBuf::from("/tmp/flow")));
    }

    #[test]
    fn test_env_beats_file_and_cli_beats_env() {
        let config = FlowConfig {
            runtime: RuntimeConfig {
                hook_timeout_ms: Some(250),
                ..Default::default()
            },
            ..Default::default()
        };
        let env: HashMap<&str, &str> = HashMap::from([
            ("FLOWNAV_HOOK_TIMEOUT_MS", "900"),
            ("FLOWNAV_STORAGE", "file"),
        ]);
        let lookup = |name: &str| env.get(name).map(|v| v.to_string());

        let resolved = resolve_with_env(&config, None, lookup);
        assert_eq!(resolved.hook_timeout, Duration::from_millis(900));
        assert_eq!(resolved.storage, StorageBackend::File);

        let resolved = resolve_with_env(&config, Some(StorageBackend::Memory), lookup);
        assert_eq!(resolved.storage, StorageBackend::Memory);
    }

    #[test]
    fn test_bad_env_number_is_ignored() {
        let resolved = resolve_with_env(&FlowConfig::default(), None, |name| {
            (name == "FLOWNAV_HISTORY_LIMIT").then(|| "lots".to_string())
        });
        assert_eq!(resolved.history_limit, DEFAULT_HISTORY_LIMIT);
    }

    #[test]
    fn test_sparse_toml_parses() {
        // Only override one thing; everything else stays default
        let toml_str = r#"
[storage]
backend = "file"
"#;
        let config: FlowConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.storage.backend, Some(StorageBackend::File));
        assert!(config.storage.dir.is_none());
        assert!(config.runtime.hook_timeout_ms.is_none());
        assert!(config.history.max_entries.is_none());
    }

    #[test]
    fn test_load_config_from_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[runtime]\nhook_timeout_ms = \"soon\"\n").unwrap();
        assert!(matches!(load_config_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_storage_backend_parse() {
        assert_eq!(StorageBackend::parse("FILE"), Some(StorageBackend::File));
        assert_eq!(StorageBackend::parse(" memory "), Some(StorageBackend::Memory));
        assert_eq!(StorageBackend::parse("redis"), None);
    }
}
