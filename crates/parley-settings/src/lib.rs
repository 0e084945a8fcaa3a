//! # parley-settings
//!
//! Layered configuration: compiled defaults, then `~/.parley/settings.json`
//! (deep-merged), then `PARLEY_*` environment variables. The upstream API key
//! is only ever taken from the environment.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    deep_merge, load_settings, load_settings_from_path, load_settings_with_report, require_api_key,
    settings_path, validate, IgnoredEnvVar, LoadedSettings,
};
pub use types::*;
