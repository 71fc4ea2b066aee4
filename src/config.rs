// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every table falls back to its defaults field by field, so a partial file
// only overrides what it names. A missing file means all defaults.

use crate::context::FrameSettings;
use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
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
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Core Demo".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
    pub descriptor_sets_per_pool: u32,
    pub fence_timeout_ms: u64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo_relaxed".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            frames_in_flight: 3,
            descriptor_sets_per_pool: 1000,
            fence_timeout_ms: 5000,
        }
    }
}

impl GraphicsConfig {
    /// Present mode as Vulkan enum; unknown names fall back to FIFO_RELAXED
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO_RELAXED",
                    self.present_mode
                );
                vk::PresentModeKHR::FIFO_RELAXED
            }
        }
    }

    pub fn frame_settings(&self) -> FrameSettings {
        if self.frames_in_flight == 0 {
            log::warn!("frames_in_flight = 0 is not usable, using 1");
        }
        if self.fence_timeout_ms == 0 {
            log::warn!("fence_timeout_ms = 0 would fail every pending frame, using 1 ms");
        }
        FrameSettings {
            frames_in_flight: self.frames_in_flight.max(1),
            present_mode: self.present_mode(),
            descriptor_sets_per_pool: self.descriptor_sets_per_pool.max(1),
            fence_timeout: Duration::from_millis(self.fence_timeout_ms.max(1)),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_level: "info".to_string(),
            show_fps: true,
        }
    }
}

impl DebugConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
