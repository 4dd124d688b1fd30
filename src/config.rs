//! Configuration loading and persistence.
//!
//! Handles reading and writing the nicohub settings file, including the
//! plugin roster loaded at startup. Settings live in a JSON file under the
//! platform config directory; `NICOHUB_CONFIG_DIR` overrides the location
//! for tests and scripted runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::PathBuf};

/// How a plugin process is attached to the bus.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PluginMethod {
    /// The plugin connects back over TCP and identifies itself with the
    /// slot handshake.
    Tcp,
    /// The plugin is a child process wired to the bus via stdin/stdout.
    Std,
}

/// A plugin registered at startup.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PluginDef {
    /// Display name; also used in log lines.
    pub name: String,
    /// Short description shown to the user.
    #[serde(default)]
    pub description: String,
    /// Plugin version string (informational).
    #[serde(default)]
    pub version: String,
    /// Command line to launch the plugin process. Empty for plugins that
    /// are started externally and attach over TCP.
    #[serde(default)]
    pub exec: Vec<String>,
    /// Transport attachment method.
    pub method: PluginMethod,
    /// Domains the plugin subscribes to.
    #[serde(default)]
    pub subscribe: Vec<String>,
}

/// User-facing settings for the nicohub process.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Settings {
    /// Post comments through the owner API when the account owns the
    /// broadcast.
    pub owner_comment: bool,
    /// Automatically reconnect to the next broadcast in the same community
    /// when a notification for it arrives.
    pub auto_follow_next: bool,
    /// Resolve user names for incoming comments via the profile API.
    pub user_name_get: bool,
    /// TCP port the plugin bus listens on for `method = "tcp"` plugins.
    pub plugin_port: u16,
    /// Plugins attached at startup. Slot 0 is the main plugin.
    #[serde(default)]
    pub plugins: Vec<PluginDef>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            owner_comment: false,
            auto_follow_next: false,
            user_name_get: true,
            plugin_port: 8025,
            plugins: Vec::new(),
        }
    }
}

impl Settings {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `NICOHUB_CONFIG_DIR` env var: explicit override
    /// 2. Default: platform config dir (e.g. `~/.config/nicohub`)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(over) = std::env::var("NICOHUB_CONFIG_DIR") {
            PathBuf::from(over)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("nicohub")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn settings_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("settings.json"))
    }

    /// Loads settings from file, with environment variable overrides.
    ///
    /// A missing or unreadable file yields defaults rather than an error,
    /// so a fresh install starts without ceremony.
    pub fn load() -> Result<Self> {
        let mut settings = Self::load_from_file().unwrap_or_default();
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::settings_path()?;
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("Settings file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("NICOHUB_PLUGIN_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.plugin_port = port;
            }
        }
        if let Ok(v) = std::env::var("NICOHUB_OWNER_COMMENT") {
            self.owner_comment = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    /// Persists the current settings to disk with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        let path = Self::settings_path()?;
        fs::write(&path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Settings fields exposed to plugins over `Settings.Get`.
    ///
    /// The plugin roster is startup-only state and not included.
    pub fn as_public_json(&self) -> serde_json::Value {
        serde_json::json!({
            "owner_comment": self.owner_comment,
            "auto_follow_next": self.auto_follow_next,
            "user_name_get": self.user_name_get,
        })
    }

    /// Applies a partial update received from `Settings.Set`.
    pub fn apply_public_json(&mut self, v: &serde_json::Value) {
        if let Some(b) = v.get("owner_comment").and_then(|b| b.as_bool()) {
            self.owner_comment = b;
        }
        if let Some(b) = v.get("auto_follow_next").and_then(|b| b.as_bool()) {
            self.auto_follow_next = b;
        }
        if let Some(b) = v.get("user_name_get").and_then(|b| b.as_bool()) {
            self.user_name_get = b;
        }
    }
}
