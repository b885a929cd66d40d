//! # PMOVideo Configuration Module
//!
//! This module provides configuration management for PMOVideo, including:
//! - Loading configuration from YAML files
//! - Merging with embedded default configuration
//! - Environment variable overrides
//! - Type-safe getters and setters for configuration values
//!
//! There is no process-wide instance: the application loads a [`Config`]
//! once and hands an `Arc<Config>` to whatever needs it.
//!
//! ## Usage
//!
//! ```no_run
//! use pmoconfig::Config;
//!
//! let config = Config::load_config("")?;
//!
//! let service = config.get_discovery_service_type()?;
//! let attempts = config.get_asset_max_attempts()?;
//!
//! config.set_asset_max_attempts(10)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Context, Result};
use dirs::home_dir;
use serde_yaml::{Mapping, Number, Value};
use std::{
    env, fs,
    path::Path,
    sync::{Mutex, MutexGuard},
};
use tracing::info;

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("pmovideo.yaml");

const ENV_CONFIG_DIR: &str = "PMOVIDEO_CONFIG";
const ENV_PREFIX: &str = "PMOVIDEO_CONFIG__";
const CONFIG_DIR_NAME: &str = ".pmovideo";

// Default values for configuration
const DEFAULT_SERVICE_TYPE: &str = "_myvideoserver._tcp.local";
const DEFAULT_RESOLVE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_DISCOVERY_WINDOW_SECS: u64 = 5;
const DEFAULT_QUERY_INTERVAL_SECS: u64 = 15;
const DEFAULT_CATALOGUE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_THUMBNAIL_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MEDIA_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_ATTEMPTS: u64 = 30;
const DEFAULT_GENERATION_BACKOFF_MS: u64 = 2000;
const DEFAULT_ERROR_BACKOFF_MS: u64 = 3000;
const DEFAULT_PLAYER_COMMAND: &str = "mpv";
const DEFAULT_STORAGE_DIR: &str = "library";
const DEFAULT_LOG_MIN_LEVEL: &str = "INFO";

/// Macro to generate getter/setter for u64 values with default
macro_rules! impl_u64_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<u64> {
            match self.get_value($path) {
                Ok(Value::Number(n)) => Ok(n.as_u64().unwrap_or($default)),
                Ok(Value::String(s)) => Ok(s.trim().parse::<u64>().unwrap_or_else(|_| {
                    tracing::warn!(path = %$path.join("."), value = %s, "Invalid number, using default");
                    $default
                })),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: u64) -> Result<()> {
            self.set_value($path, Value::Number(Number::from(value)))
        }
    };
}

/// Macro to generate getter/setter for string values with default
macro_rules! impl_string_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<String> {
            match self.get_value($path) {
                Ok(Value::String(s)) if !s.trim().is_empty() => Ok(s),
                _ => Ok($default.to_string()),
            }
        }

        pub fn $setter(&self, value: String) -> Result<()> {
            self.set_value($path, Value::String(value))
        }
    };
}

/// Configuration manager for PMOVideo
///
/// This structure manages the application configuration, including:
/// - Loading configuration from YAML files
/// - Merging with default configuration
/// - Handling environment variable overrides
/// - Providing typed getters/setters for configuration values
#[derive(Debug)]
pub struct Config {
    config_dir: String,
    path: String,
    data: Mutex<Value>,
}

impl Config {
    /// Finds a config directory by trying different locations in order
    fn find_config_dir(directory: &str) -> String {
        // 1. Try provided directory
        if !directory.is_empty() {
            return directory.to_string();
        }

        // 2. Try environment variable
        if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
            info!(env_var=ENV_CONFIG_DIR, path=%env_path, "Trying to load config from env");
            return env_path;
        }

        // 3. Try current directory
        if Path::new(CONFIG_DIR_NAME).exists() {
            return CONFIG_DIR_NAME.to_string();
        }

        // 4. Try home directory
        if let Some(home) = home_dir() {
            let home_config = home.join(CONFIG_DIR_NAME);
            if home_config.exists() {
                return home_config.to_string_lossy().to_string();
            }
        }

        // Default fallback
        CONFIG_DIR_NAME.to_string()
    }

    /// Validates and prepares a config directory
    fn validate_config_dir(path: &Path) -> Result<()> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }

        if !path.is_dir() {
            return Err(anyhow!("{} is not a directory", path.display()));
        }

        // Test write permission
        let test_file = path.join(".write_test");
        fs::write(&test_file, b"test")?;
        fs::remove_file(&test_file)?;

        fs::read_dir(path)?;

        Ok(())
    }

    /// Determines and validates the configuration directory
    ///
    /// The directory is searched in the following order:
    /// 1. The provided `directory` parameter if not empty
    /// 2. The `PMOVIDEO_CONFIG` environment variable
    /// 3. `.pmovideo` in the current directory
    /// 4. `.pmovideo` in the user's home directory
    ///
    /// The directory is created if it doesn't exist, and validated for read/write permissions.
    pub fn config_dir(directory: &str) -> Result<String> {
        let dir_path = Self::find_config_dir(directory);
        let path = Path::new(&dir_path);

        Self::validate_config_dir(path)
            .with_context(|| format!("Cannot use configuration directory {}", dir_path))?;

        Ok(dir_path)
    }

    /// Loads the configuration from the specified directory
    ///
    /// This method:
    /// 1. Determines the configuration directory
    /// 2. Loads the default embedded configuration
    /// 3. Merges it with the external config.yaml file if present
    /// 4. Applies environment variable overrides
    /// 5. Saves the merged configuration
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::config_dir(directory)?;
        info!(config_dir=%config_dir, "Using config directory");

        let config_file_path = Path::new(&config_dir).join("config.yaml");
        let path = config_file_path.to_string_lossy().to_string();

        let mut config_value = Self::lower_keys_value(serde_yaml::from_str(DEFAULT_CONFIG)?);

        let yaml_data = if let Ok(data) = fs::read(&path) {
            info!(config_file=%path, "Loaded config file");
            data
        } else {
            info!(config_file=%path, "Config file not found, using default embedded config");
            DEFAULT_CONFIG.as_bytes().to_vec()
        };

        let external_value: Value = serde_yaml::from_slice(&yaml_data)
            .with_context(|| format!("Invalid YAML in {}", path))?;
        merge_yaml(&mut config_value, &Self::lower_keys_value(external_value));

        Self::apply_env_overrides(&mut config_value);

        let config = Config {
            config_dir,
            path,
            data: Mutex::new(config_value),
        };

        config.save()?;
        Ok(config)
    }

    fn lock_data(&self) -> Result<MutexGuard<'_, Value>> {
        self.data
            .lock()
            .map_err(|_| anyhow!("Configuration mutex poisoned"))
    }

    /// Directory holding `config.yaml`
    pub fn directory(&self) -> &str {
        &self.config_dir
    }

    /// Saves the current configuration to the config.yaml file
    pub fn save(&self) -> Result<()> {
        let yaml = {
            let data = self.lock_data()?;
            serde_yaml::to_string(&*data)?
        };
        fs::write(&self.path, yaml).with_context(|| format!("Cannot write {}", self.path))?;
        Ok(())
    }

    /// Sets a configuration value at the specified path and saves it
    ///
    /// # Arguments
    ///
    /// * `path` - Array of keys representing the path (e.g., `&["assets", "max_attempts"]`)
    /// * `value` - The YAML value to set
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        {
            let mut data = self.lock_data()?;
            Self::set_value_internal(&mut data, path, value)?;
        }
        self.save()
    }

    fn set_value_internal(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
        if path.is_empty() {
            *data = value;
            return Ok(());
        }
        if let Value::Mapping(map) = data {
            let key_value = Value::String(path[0].to_lowercase());
            if path.len() == 1 {
                map.insert(key_value, value);
            } else {
                let entry = map
                    .entry(key_value)
                    .or_insert(Value::Mapping(Mapping::new()));
                Self::set_value_internal(entry, &path[1..], value)?;
            }
            Ok(())
        } else {
            Err(anyhow!("Current node is not a map"))
        }
    }

    /// Gets a configuration value at the specified path
    ///
    /// Returns an error if the path doesn't exist.
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.lock_data()?;
        Self::get_value_internal(&data, path)
    }

    fn get_value_internal(data: &Value, path: &[&str]) -> Result<Value> {
        let mut current = data;
        for (i, key) in path.iter().enumerate() {
            if let Value::Mapping(map) = current {
                let key = key.to_lowercase();

                if let Some(next) = map.get(&Value::String(key)) {
                    current = next;
                } else {
                    return Err(anyhow!("Path {} does not exist", path[..=i].join(".")));
                }
            } else {
                return Err(anyhow!("Path {} is not a Config", path[..i].join(".")));
            }
        }
        Ok(current.clone())
    }

    fn apply_env_overrides(config: &mut Value) {
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                let key_path = stripped.split("__").collect::<Vec<_>>();
                let yaml_value = Self::convert_env_value(&value);
                if let Err(err) = Self::set_value_internal(config, &key_path, yaml_value) {
                    tracing::warn!(env_var=%key, error=%err, "Ignoring environment override");
                }
            }
        }
    }

    fn convert_env_value(value: &str) -> Value {
        if let Ok(parsed) = serde_yaml::from_str::<Value>(value) {
            return parsed;
        }
        Value::String(value.to_string())
    }

    fn lower_keys_value(value: Value) -> Value {
        match value {
            Value::Mapping(map) => {
                let mut new_map = Mapping::new();
                for (k, v) in map {
                    if let Value::String(s) = k {
                        new_map.insert(Value::String(s.to_lowercase()), Self::lower_keys_value(v));
                    } else {
                        new_map.insert(k, Self::lower_keys_value(v));
                    }
                }
                Value::Mapping(new_map)
            }
            Value::Sequence(seq) => {
                Value::Sequence(seq.into_iter().map(Self::lower_keys_value).collect())
            }
            _ => value,
        }
    }

    /// Résout un chemin relatif ou absolu et crée le répertoire si nécessaire
    fn resolve_and_create_dir(&self, dir_path: &str) -> Result<String> {
        let path = Path::new(dir_path);

        let absolute_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.config_dir).join(path)
        };

        if !absolute_path.exists() {
            fs::create_dir_all(&absolute_path)?;
            info!(directory=%absolute_path.display(), "Created managed directory");
        }

        Ok(absolute_path.to_string_lossy().to_string())
    }

    /// Returns a directory managed by the configuration
    ///
    /// The directory may be absolute or relative to the configuration
    /// directory. It is created if it does not exist; when the key is unset
    /// `default` is stored and used.
    pub fn get_managed_dir(&self, path: &[&str], default: &str) -> Result<String> {
        let dir_path = match self.get_value(path) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            _ => {
                self.set_managed_dir(path, default.to_string())?;
                default.to_string()
            }
        };
        self.resolve_and_create_dir(&dir_path)
    }

    /// Sets a directory managed by the configuration
    pub fn set_managed_dir(&self, path: &[&str], directory: String) -> Result<()> {
        self.set_value(path, Value::String(directory))
    }

    impl_string_config!(
        get_discovery_service_type,
        set_discovery_service_type,
        &["discovery", "service_type"],
        DEFAULT_SERVICE_TYPE
    );

    impl_u64_config!(
        get_discovery_resolve_timeout_secs,
        set_discovery_resolve_timeout_secs,
        &["discovery", "resolve_timeout_secs"],
        DEFAULT_RESOLVE_TIMEOUT_SECS
    );

    impl_u64_config!(
        get_discovery_window_secs,
        set_discovery_window_secs,
        &["discovery", "window_secs"],
        DEFAULT_DISCOVERY_WINDOW_SECS
    );

    impl_u64_config!(
        get_discovery_query_interval_secs,
        set_discovery_query_interval_secs,
        &["discovery", "query_interval_secs"],
        DEFAULT_QUERY_INTERVAL_SECS
    );

    impl_u64_config!(
        get_catalogue_request_timeout_secs,
        set_catalogue_request_timeout_secs,
        &["catalogue", "request_timeout_secs"],
        DEFAULT_CATALOGUE_TIMEOUT_SECS
    );

    impl_u64_config!(
        get_asset_thumbnail_timeout_secs,
        set_asset_thumbnail_timeout_secs,
        &["assets", "thumbnail_timeout_secs"],
        DEFAULT_THUMBNAIL_TIMEOUT_SECS
    );

    impl_u64_config!(
        get_asset_media_timeout_secs,
        set_asset_media_timeout_secs,
        &["assets", "media_timeout_secs"],
        DEFAULT_MEDIA_TIMEOUT_SECS
    );

    impl_u64_config!(
        get_asset_max_attempts,
        set_asset_max_attempts,
        &["assets", "max_attempts"],
        DEFAULT_MAX_ATTEMPTS
    );

    impl_u64_config!(
        get_asset_generation_backoff_ms,
        set_asset_generation_backoff_ms,
        &["assets", "generation_backoff_ms"],
        DEFAULT_GENERATION_BACKOFF_MS
    );

    impl_u64_config!(
        get_asset_error_backoff_ms,
        set_asset_error_backoff_ms,
        &["assets", "error_backoff_ms"],
        DEFAULT_ERROR_BACKOFF_MS
    );

    impl_string_config!(
        get_player_command,
        set_player_command,
        &["player", "command"],
        DEFAULT_PLAYER_COMMAND
    );

    impl_string_config!(
        get_log_min_level,
        set_log_min_level,
        &["host", "logger", "min_level"],
        DEFAULT_LOG_MIN_LEVEL
    );

    /// Local library directory used by downloads (created on demand)
    pub fn get_storage_dir(&self) -> Result<String> {
        self.get_managed_dir(&["storage", "directory"], DEFAULT_STORAGE_DIR)
    }
}

/// Merges external YAML configuration into default configuration
///
/// - For mappings (objects), it merges keys from external into default
/// - For scalars and sequences, external values replace default values
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, e) => *d = e.clone(), // pour les scalaires ou séquences, on remplace
    }
}
