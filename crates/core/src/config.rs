//! Configuration loaded from a TOML file.
//!
//! Every section and field has a default, so an empty file (or no file at all)
//! yields a working configuration.
//!
//! ```toml
//! [renderer]
//! fence_timeout_ms = 1000
//! max_objects = 10000
//!
//! [assets]
//! cooked_dir = "assets/cooked"
//!
//! [vars]
//! "render.sort_objects" = 1
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::vars::VarRegistry;

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub renderer: RendererConfig,
    pub assets: AssetConfig,
    /// Overrides for variables registered in a [`VarRegistry`].
    pub vars: toml::Table,
}

/// Renderer timing and capacity settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Upper bound on a frame slot's fence wait.
    pub fence_timeout_ms: u64,
    /// Upper bound on acquiring a swapchain image.
    pub acquire_timeout_ms: u64,
    /// Upper bound on a blocking upload.
    pub upload_timeout_ms: u64,
    /// Capacity of each frame slot's object storage buffer.
    pub max_objects: u32,
    pub clear_color: [f32; 4],
    /// Initial surface size in pixels.
    pub extent: [u32; 2],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            fence_timeout_ms: 1000,
            acquire_timeout_ms: 1000,
            upload_timeout_ms: 5000,
            max_objects: 10_000,
            clear_color: [0.0, 0.0, 0.2, 1.0],
            extent: [1700, 900],
        }
    }
}

impl RendererConfig {
    #[inline]
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    #[inline]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    #[inline]
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }
}

/// Asset locations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// Directory holding cooked `.msh`, `.tex` and `.mat` containers.
    pub cooked_dir: PathBuf,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            cooked_dir: PathBuf::from("assets/cooked"),
        }
    }
}

impl Config {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// contains out-of-range values.
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", path);
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise returns the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            info!("No config at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Parses and validates configuration text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Checks values the renderer cannot work with.
    pub fn validate(&self) -> Result<()> {
        let r = &self.renderer;
        if r.fence_timeout_ms == 0 || r.acquire_timeout_ms == 0 || r.upload_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".to_owned()));
        }
        if r.max_objects == 0 {
            return Err(Error::Config("max_objects must be at least 1".to_owned()));
        }
        if r.extent[0] == 0 || r.extent[1] == 0 {
            return Err(Error::Config(format!(
                "extent must be non-zero, got {}x{}",
                r.extent[0], r.extent[1]
            )));
        }
        Ok(())
    }

    /// Applies the `[vars]` table to an already populated registry.
    pub fn apply_vars(&self, registry: &mut VarRegistry) -> Result<usize> {
        registry.apply_overrides(&self.vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::VarFlags;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.renderer.fence_timeout(), Duration::from_secs(1));
        assert_eq!(config.renderer.max_objects, 10_000);
    }

    #[test]
    fn test_partial_section() {
        let config = Config::from_toml_str(
            r#"
            [renderer]
            max_objects = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.renderer.max_objects, 64);
        assert_eq!(config.renderer.upload_timeout_ms, 5000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_toml_str("[renderer]\nmax_objects = 0").is_err());
        assert!(Config::from_toml_str("[renderer]\nfence_timeout_ms = 0").is_err());
        assert!(Config::from_toml_str("[renderer]\nextent = [0, 10]").is_err());
        assert!(Config::from_toml_str("[renderer\n").is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.renderer.max_objects = 12;
        config
            .vars
            .insert("render.sort_objects".to_owned(), toml::Value::Integer(0));

        let text = config.to_toml_string().unwrap();
        let parsed = Config::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_apply_vars() {
        let config = Config::from_toml_str("[vars]\n\"render.sort_objects\" = 0").unwrap();
        let mut registry = VarRegistry::new();
        registry
            .create_int_ranged("render.sort_objects", "", 1, 0, 1, VarFlags::empty())
            .unwrap();
        assert_eq!(config.apply_vars(&mut registry).unwrap(), 1);
        assert_eq!(registry.get_int("render.sort_objects"), Some(0));
    }
}
