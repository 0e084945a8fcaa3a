//! Settings error types.

use thiserror::Error;

/// Errors that can occur when loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the settings file.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was invalid (e.g., out of range).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
    /// No upstream API key was provided.
    #[error("LLM API key is not configured; set PARLEY_LLM_API_KEY (never put it in the settings file)")]
    MissingApiKey,
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_value_display() {
        let err = SettingsError::InvalidValue("port out of range".to_string());
        assert_eq!(err.to_string(), "invalid settings value: port out of range");
    }

    #[test]
    fn missing_key_points_at_env_var() {
        assert!(SettingsError::MissingApiKey
            .to_string()
            .contains("PARLEY_LLM_API_KEY"));
    }

    #[test]
    fn json_error_from_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err: SettingsError = json_err.into();
        assert!(matches!(err, SettingsError::Json(_)));
    }
}
