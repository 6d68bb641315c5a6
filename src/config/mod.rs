//! Configuration management for the backend layer
//!
//! Loads, validates and saves the TOML file describing which backends to
//! bring up and how. Every section is optional and falls back to its
//! `Default`.

use crate::backend::BackendKind;
use crate::input::InputDeviceType;
use crate::session::is_drm_path;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for the global destroy grace period.
pub const MAX_DESTROY_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BackendConfig {
    /// Which backends `autocreate` brings up
    #[serde(default)]
    pub backends: BackendsConfig,

    #[serde(default)]
    pub headless: HeadlessConfig,

    #[serde(default)]
    pub drm: DrmConfig,

    #[serde(default)]
    pub libinput: LibinputConfig,

    /// Global advertisement settings
    #[serde(default)]
    pub globals: GlobalsConfig,

    #[serde(default)]
    pub general: GeneralConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendsConfig {
    pub enabled: Vec<BackendKind>,
}

/// Virtual outputs and devices of the headless backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeadlessConfig {
    /// Number of outputs created up front
    pub outputs: u32,
    pub width: u32,
    pub height: u32,
    /// Refresh rate in mHz
    pub refresh_mhz: i32,
    #[serde(default)]
    pub input_devices: Vec<InputDeviceType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DrmConfig {
    /// Device nodes to drive, e.g. `/dev/dri/card0`
    #[serde(default)]
    pub devices: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibinputConfig {
    pub seat: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalsConfig {
    /// Grace period between revoking a global and freeing it
    pub destroy_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GeneralConfig {
    pub debug: bool,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            enabled: vec![BackendKind::Headless],
        }
    }
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            outputs: 1,
            width: 1920,
            height: 1080,
            refresh_mhz: 60_000,
            input_devices: Vec::new(),
        }
    }
}

impl Default for LibinputConfig {
    fn default() -> Self {
        Self {
            seat: "seat0".to_string(),
        }
    }
}

impl Default for GlobalsConfig {
    fn default() -> Self {
        Self { destroy_delay_ms: 5000 }
    }
}

impl GlobalsConfig {
    pub fn destroy_delay(&self) -> Duration {
        Duration::from_millis(self.destroy_delay_ms)
    }
}

impl BackendConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Path::new(&home).join(path.strip_prefix("~").unwrap_or(path))
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: BackendConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backends.enabled.is_empty() {
            anyhow::bail!("No backend enabled: [backends] enabled must list at least one");
        }

        let mut seen = Vec::new();
        for kind in &self.backends.enabled {
            if seen.contains(kind) {
                anyhow::bail!("Backend '{}' listed more than once", kind);
            }
            seen.push(*kind);
        }

        if self.headless.width == 0 || self.headless.height == 0 {
            anyhow::bail!(
                "Invalid headless output size {}x{}",
                self.headless.width,
                self.headless.height
            );
        }
        if self.headless.refresh_mhz <= 0 {
            anyhow::bail!("Invalid headless refresh rate: must be positive (mHz)");
        }

        for device in &self.drm.devices {
            if !is_drm_path(device) {
                anyhow::bail!("{} is not a DRM device node", device.display());
            }
        }

        if self.libinput.seat.trim().is_empty() {
            anyhow::bail!("Invalid libinput seat: must not be empty");
        }

        if self.globals.destroy_delay_ms > MAX_DESTROY_DELAY_MS {
            anyhow::bail!(
                "Invalid destroy_delay_ms: must be at most {}",
                MAX_DESTROY_DELAY_MS
            );
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests;
