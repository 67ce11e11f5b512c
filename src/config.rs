use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub ui: UiConfig,
    pub proxy: ProxyConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub auto_start: bool,
    pub start_minimized: bool,
    pub close_action: CloseAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub language: String,
    pub theme: String,
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub mode: ProxyMode,
    pub port: u16,
    pub cert_installed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: bool,
    pub console: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseAction {
    Ask,
    Minimize,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Http,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            auto_start: false,
            start_minimized: false,
            close_action: CloseAction::Ask,
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            language: "en-US".to_string(),
            theme: "light".to_string(),
            width: 1200,
            height: 800,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Http,
            port: 9527,
            cert_installed: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file: true,
            console: true,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            ui: UiConfig::default(),
            proxy: ProxyConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load config.toml from the data directory, falling back to defaults
    /// when the file does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self, AppError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| AppError::ConfigMalformed(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, AppError> {
        if !path.exists() {
            return Err(AppError::ConfigMissing(path.display().to_string()));
        }
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| AppError::ConfigMalformed(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|e| AppError::ConfigMalformed(e.to_string()))?;
        fs::write(path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.proxy.mode, ProxyMode::Http);
        assert_eq!(config.proxy.port, 9527);
        assert_eq!(config.general.close_action, CloseAction::Ask);
    }

    #[test]
    fn load_missing_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = AppConfig::load(&dir.path().join("config.toml")).unwrap_err();
        assert!(matches!(err, AppError::ConfigMissing(_)));
    }

    #[test]
    fn round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.proxy.mode = ProxyMode::Host;
        config.proxy.port = 8443;
        config.log.level = LogLevel::Debug;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.proxy.mode, ProxyMode::Host);
        assert_eq!(loaded.proxy.port, 8443);
        assert_eq!(loaded.log.level, LogLevel::Debug);
    }

    #[test]
    fn malformed_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[proxy]\nport = \"not a number\"").unwrap();
        let err = AppConfig::load(&path).unwrap_err();
        assert!(matches!(err, AppError::ConfigMalformed(_)));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[proxy]\nmode = \"host\"\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.proxy.mode, ProxyMode::Host);
        assert_eq!(config.proxy.port, 9527);
        assert!(config.log.console);
    }
}
