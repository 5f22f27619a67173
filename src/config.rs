// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH: &str = "config.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub shaders: ShaderConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan Minecraft".to_string(),
            width: 1200,
            height: 800,
        }
    }
}

/// Precompiled SPIR-V blobs, relative to the working directory
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/vert.spv"),
            fragment: PathBuf::from("shaders/frag.spv"),
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Request VK_LAYER_KHRONOS_validation (debug builds only)
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "vulkan_minecraft.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load config.toml, falling back to defaults if it is missing or broken.
    ///
    /// Runs before logging exists, so a load error is handed back to be
    /// reported once the logger is up.
    pub fn load() -> (Self, Option<anyhow::Error>) {
        Self::load_or_default(CONFIG_PATH)
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Validation is a compile-time toggle: release builds never request layers.
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_describe_a_1200x800_window() {
        let config = Config::default();
        assert_eq!(config.window.title, "Vulkan Minecraft");
        assert_eq!((config.window.width, config.window.height), (1200, 800));
        assert_eq!(config.shaders.vertex, PathBuf::from("shaders/vert.spv"));
        assert_eq!(config.shaders.fragment, PathBuf::from("shaders/frag.spv"));
        assert!(!config.debug.log_to_file);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.window.width, 1200);
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[window]\nwidth = 640\n\n[shaders]\nfragment = \"custom/frag.spv\"\n\n[debug]\nshow_fps = false"
        )
        .unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.height, 800);
        assert_eq!(config.window.title, "Vulkan Minecraft");
        assert_eq!(config.shaders.vertex, PathBuf::from("shaders/vert.spv"));
        assert_eq!(config.shaders.fragment, PathBuf::from("custom/frag.spv"));
        assert!(!config.debug.show_fps);
        assert!(config.debug.validation_layers);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[window\nwidth = ").unwrap();

        let err = Config::load_from_path(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }

    #[test]
    fn malformed_file_falls_back_to_defaults_and_keeps_the_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[window]\nwidth = \"wide\"").unwrap();

        let (config, error) = Config::load_or_default(file.path());
        assert_eq!(config.window.width, 1200);

        let error = error.expect("malformed config must be reported");
        assert!(format!("{error:#}").contains("Failed to parse config file"));
    }

    #[test]
    fn missing_file_is_not_reported_as_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_, error) = Config::load_or_default(dir.path().join("config.toml"));
        assert!(error.is_none());
    }

    #[test]
    fn validation_follows_build_profile() {
        let mut config = Config::default();
        assert_eq!(config.validation_enabled(), cfg!(debug_assertions));
        config.debug.validation_layers = false;
        assert!(!config.validation_enabled());
    }
}
