use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use log::info;

use crate::capture::extract::MAX_CONTENT_CHARS;
use crate::capture::filter::NoiseRules;
use crate::capture::origin::DEFAULT_ALLOWED_HOSTS;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Capture config IO error: {}", e),
            ConfigError::Json(e) => write!(f, "Capture config JSON parsing error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid capture config: {}", msg),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Json(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err)
    }
}

/// Capture rules: which origins are trusted and what counts as noise.
/// Every field is optional in the JSON file; missing ones keep the defaults.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub allowed_hosts: Vec<String>,
    pub max_content_chars: usize,
    pub noise: NoiseRules,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: DEFAULT_ALLOWED_HOSTS.iter()
                .map(|h| h.to_string())
                .collect(),
            max_content_chars: MAX_CONTENT_CHARS,
            noise: NoiseRules::default(),
        }
    }
}

impl CaptureConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.allowed_hosts.iter().all(|h| h.trim().is_empty()) {
            return Err(ConfigError::Invalid("allowed_hosts must not be empty".to_string()));
        }
        if self.max_content_chars == 0 {
            return Err(ConfigError::Invalid("max_content_chars must be positive".to_string()));
        }
        Ok(())
    }
}

pub fn load_capture_config_from_str(json: &str) -> Result<CaptureConfig, ConfigError> {
    let config: CaptureConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}

/// Loads the rules file when a path is given, otherwise falls back to the built-in rules.
pub fn load_capture_config(path: Option<&str>) -> Result<Arc<CaptureConfig>, ConfigError> {
    let Some(path) = path.filter(|p| !p.trim().is_empty()) else {
        info!("No capture config file given, using built-in capture rules.");
        return Ok(Arc::new(CaptureConfig::default()));
    };
    if !Path::new(path).exists() {
        return Err(ConfigError::Invalid(format!("capture config '{}' does not exist", path)));
    }
    let json_str = fs::read_to_string(path)?;
    let config = load_capture_config_from_str(&json_str)?;
    info!(
        "Loaded capture config from {} ({} allowed hosts, {} noise markers)",
        path,
        config.allowed_hosts.len(),
        config.noise.foreign_widget_markers.len()
    );
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = load_capture_config_from_str(r#"{"max_content_chars": 500}"#).unwrap();
        assert_eq!(config.max_content_chars, 500);
        assert_eq!(config.allowed_hosts, CaptureConfig::default().allowed_hosts);
        assert_eq!(config.noise, NoiseRules::default());
    }

    #[test]
    fn empty_allow_list_is_rejected() {
        let err = load_capture_config_from_str(r#"{"allowed_hosts": []}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_json_is_reported() {
        let err = load_capture_config_from_str("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn missing_path_uses_defaults() {
        let config = load_capture_config(None).unwrap();
        assert_eq!(*config, CaptureConfig::default());
        assert!(load_capture_config(Some("/nonexistent/capture.json")).is_err());
    }
}
