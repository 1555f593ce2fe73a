//! Viewer configuration, loaded from JSON. Every field has a default so a
//! config file only needs to name what it changes.

use std::{fs, path::{Path, PathBuf}};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How `largest_face_axis` is derived from a box size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceAxisRule {
    /// Argmax of the three face areas.
    #[default]
    Corrected,
    /// Compares against the yz area only, reusing the longest-axis running
    /// maximum. Kept for sessions recorded with the older tool.
    Legacy,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub speed: f32,
    pub repeat: bool,
    pub paused: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            repeat: true,
            paused: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// flexi_logger spec string, e.g. `"info, vis_core::staging=debug"`.
    pub log_spec: String,
    pub playback: PlaybackConfig,
    pub face_axis_rule: FaceAxisRule,
    /// Lower bound for the length of a projected drag axis.
    pub min_axis_denominator: f32,
    /// Smallest spawn-box edge, in world units.
    pub min_box_extent: f32,
    pub max_particles: u32,
    /// Upper bound on particle probes, and separately on slices, per scene.
    pub max_artifacts: u32,
    /// Frames reporting more elapsed seconds than this are skipped.
    pub max_frame_elapsed: f32,
    pub debug_dump_interval_ms: u64,
    /// Seed for particle seeding and noise textures.
    pub rng_seed: u64,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            log_spec: "info".to_owned(),
            playback: PlaybackConfig::default(),
            face_axis_rule: FaceAxisRule::Corrected,
            min_axis_denominator: 0.001,
            min_box_extent: 0.02,
            max_particles: 1 << 20,
            max_artifacts: 64,
            max_frame_elapsed: 4.0,
            debug_dump_interval_ms: 1_000,
            rng_seed: 0x5eed,
        }
    }
}

impl ViewerConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
