//! Applet configuration management

use anyhow::{Context, Result, anyhow};
use common::Endpoint;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coordinator::{CoordinatorOptions, ReassignStrategy};
use crate::registry::DEFAULT_NAME_MAX_LEN;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppletConfig {
    #[serde(default)]
    pub applet: AppletSettings,
    #[serde(default)]
    pub control: ControlSettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub devices: DeviceSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppletSettings {
    pub log_level: String,
}

impl Default for AppletSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlSettings {
    /// Control socket, e.g. "vsock:2:2000", "unix:/run/usb.sock", "tcp:127.0.0.1:2000"
    #[serde(default)]
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// Start the push subscriber in watch mode
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Endpoint,
    /// Fixed delay between reconnect attempts
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: Endpoint::default(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

impl NotificationSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Display names are cut to this many characters
    #[serde(default = "default_name_max_len")]
    pub name_max_len: usize,
    #[serde(default)]
    pub reassign: ReassignStrategy,
    /// Refresh the device list whenever a selection prompt arrives
    #[serde(default = "default_true")]
    pub refresh_on_notification: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            name_max_len: default_name_max_len(),
            reassign: ReassignStrategy::default(),
            refresh_on_notification: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_reconnect_delay_secs() -> u64 {
    3
}

fn default_name_max_len() -> usize {
    DEFAULT_NAME_MAX_LEN
}

impl AppletConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-applet/applet.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: AppletConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!(
            "Config: control={}, notifications={} (enabled={})",
            config.control.endpoint,
            config.notifications.endpoint,
            config.notifications.enabled
        );
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Logging is not up yet
                eprintln!("Config: {:#}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-applet").join("applet.toml")
        } else {
            PathBuf::from(".config/usb-applet/applet.toml")
        }
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            name_max_len: self.devices.name_max_len,
            reassign: self.devices.reassign,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.applet.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.applet.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.devices.name_max_len == 0 {
            return Err(anyhow!("devices.name_max_len must be at least 1"));
        }

        if self.notifications.reconnect_delay_secs == 0 {
            return Err(anyhow!(
                "notifications.reconnect_delay_secs must be at least 1"
            ));
        }

        Ok(())
    }
}
