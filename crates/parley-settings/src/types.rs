//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file may be partial: missing fields keep their compiled default.

use std::path::PathBuf;
use std::time::Duration;

use parley_core::ids::OwnerId;
use parley_core::security::ApiKey;
use serde::{Deserialize, Serialize};

/// Fixed system instruction placed before every conversation.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an assistant for kindergarten teachers. You help with \
lesson planning, classroom management, and parent communication. Answer in a professional and \
practical way that fits early-childhood education. If the request is vague, ask a clarifying \
question or offer an example.";

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    pub server: ServerSettings,
    pub llm: LlmSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

/// HTTP server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Owner identity assigned to every caller until authentication exists.
    pub default_owner_id: i64,
    pub cors_permissive: bool,
    /// Hard wall-clock budget for one streaming request, from acceptance.
    pub stream_timeout_secs: u64,
    /// Outbound event buffer per streaming request.
    pub stream_channel_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            default_owner_id: 1,
            cors_permissive: true,
            stream_timeout_secs: 90,
            stream_channel_capacity: 32,
        }
    }
}

impl ServerSettings {
    pub fn default_owner(&self) -> OwnerId {
        OwnerId::from_raw(self.default_owner_id)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}

/// Upstream completion API settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    /// Only ever read from the environment.
    #[serde(skip)]
    pub api_key: Option<ApiKey>,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub system_prompt: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".to_string(),
            model: "deepseek-chat".to_string(),
            api_key: None,
            request_timeout_secs: 90,
            connect_timeout_secs: 30,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl LlmSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub database_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: crate::loader::parley_home().join("database").join("parley.db"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}
