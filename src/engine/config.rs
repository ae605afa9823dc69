//! Client configuration
//!
//! Stored as pretty-printed JSON. Environment variables override file values
//! so a single binary can be pointed at another server without editing files.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use super::error::ConfigError;

/// Environment variable overriding [`ClientConfig::endpoint`]
pub const ENDPOINT_ENV: &str = "CHATSYNC_ENDPOINT";

/// Environment variable overriding [`ClientConfig::user_id`]
pub const USER_ID_ENV: &str = "CHATSYNC_USER_ID";

/// Default server address
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:4780";

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// `host:port` of the conversation server
    pub endpoint: String,
    /// User to subscribe as
    pub user_id: Option<String>,
    /// Verbose logging
    pub debug: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            user_id: None,
            debug: false,
        }
    }
}

impl ClientConfig {
    /// Load a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(io_error(path))?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, falling back to defaults when it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the config atomically
    ///
    /// The content goes to a sibling temp file that is synced and then
    /// renamed over `path`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let data = serde_json::to_vec_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path).map_err(io_error(&temp_path))?;
        file.write_all(&data).map_err(io_error(&temp_path))?;
        file.sync_all().map_err(io_error(&temp_path))?;
        drop(file);

        fs::rename(&temp_path, path).map_err(io_error(path))?;
        Ok(())
    }

    /// Apply `CHATSYNC_ENDPOINT` and `CHATSYNC_USER_ID`
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(endpoint) = lookup(ENDPOINT_ENV).filter(|value| !value.trim().is_empty()) {
            self.endpoint = endpoint;
        }
        if let Some(user_id) = lookup(USER_ID_ENV).filter(|value| !value.trim().is_empty()) {
            self.user_id = Some(user_id);
        }
        self
    }

    /// Reject values the client cannot use
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "endpoint",
                detail: "must not be empty".to_string(),
            });
        }
        if self
            .user_id
            .as_deref()
            .is_some_and(|user_id| user_id.trim().is_empty())
        {
            return Err(ConfigError::InvalidValue {
                field: "userId",
                detail: "must not be blank".to_string(),
            });
        }
        Ok(())
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}
