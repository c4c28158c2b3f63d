//! Studio Configuration
//!
//! Persistent settings for the VR360 studio.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::pipeline::{
    EncoderConfig, ScaleFactor, SrQuality, StitchConfig, SuperResConfig, VirtualCamConfig,
};

/// Studio settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // === Video ===
    /// Render resolution (e.g. "3840x1920" for a 2:1 equirect canvas)
    pub resolution: String,

    /// Target tick rate
    pub fps: u32,

    // === Encoding ===
    /// Requested codec family ("h264", "h265", "av1")
    pub codec: String,

    /// Encoder bitrate in kbps
    pub bitrate_kbps: u32,

    /// Prefer hardware encoders (NVENC/VA-API/QSV) over software
    pub hardware_acceleration: bool,

    /// Directory for recorded bitstreams; `None` disables the file encoder
    pub output_dir: Option<PathBuf>,

    // === Stitching ===
    /// Remap fisheye captures to equirectangular
    pub stitch_enabled: bool,

    /// Calibration map path; `None` generates an equisolid default
    pub calibration_map: Option<PathBuf>,

    // === Super resolution ===
    pub superres_enabled: bool,

    pub superres_scale: ScaleFactor,

    pub superres_quality: SrQuality,

    /// Enhancement strength in `[0, 1]`
    pub superres_sharpness: f32,

    /// Directory containing the vendor model files
    pub superres_model_dir: PathBuf,

    // === Virtual cameras ===
    pub virtual_cams: Vec<VirtualCamConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            // Video
            resolution: "3840x1920".to_string(),
            fps: 30,

            // Encoding
            codec: "h264".to_string(),
            bitrate_kbps: 40_000,
            hardware_acceleration: true,
            output_dir: None,

            // Stitching
            stitch_enabled: false,
            calibration_map: None,

            // Super resolution
            superres_enabled: false,
            superres_scale: ScaleFactor::X2,
            superres_quality: SrQuality::HighQuality,
            superres_sharpness: 0.4,
            superres_model_dir: PathBuf::from("/usr/local/VideoFX/lib/models"),

            // Virtual cameras
            virtual_cams: Vec::new(),
        }
    }
}

impl Settings {
    /// Get settings file path
    fn file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("vr360-studio").join("settings.json"))
    }

    /// Load settings from disk, falling back to defaults
    pub fn load() -> Result<Self> {
        let path = Self::file_path().ok_or_else(|| anyhow::anyhow!("No config directory"))?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from an explicit path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save settings to disk
    pub fn save(&self) -> Result<()> {
        let path = Self::file_path().ok_or_else(|| anyhow::anyhow!("No config directory"))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        Ok(())
    }

    /// Get resolution as (width, height)
    pub fn resolution_tuple(&self) -> (u32, u32) {
        let parts: Vec<&str> = self.resolution.split('x').collect();
        if parts.len() == 2 {
            let width = parts[0].parse().unwrap_or(3840);
            let height = parts[1].parse().unwrap_or(1920);
            (width, height)
        } else {
            (3840, 1920)
        }
    }

    /// Encoder configuration derived from these settings
    pub fn encoder_config(&self) -> EncoderConfig {
        let (width, height) = self.post_transform_resolution();
        EncoderConfig {
            codec: self.codec.clone(),
            width,
            height,
            fps_num: self.fps.max(1),
            fps_den: 1,
            bitrate_kbps: self.bitrate_kbps,
            hardware_acceleration: self.hardware_acceleration,
        }
    }

    /// Stitch stage configuration derived from these settings
    pub fn stitch_config(&self) -> StitchConfig {
        StitchConfig {
            calibration_map: self.calibration_map.clone(),
            enable: self.stitch_enabled,
        }
    }

    /// Super-resolution configuration derived from these settings
    pub fn superres_config(&self) -> SuperResConfig {
        SuperResConfig {
            sharpness: self.superres_sharpness.clamp(0.0, 1.0),
            quality: self.superres_quality,
            model_dir: self.superres_model_dir.clone(),
            scale: self.superres_scale,
        }
    }

    /// Resolution the fan-out sinks will see: the render resolution, scaled
    /// when super-resolution is enabled
    pub fn post_transform_resolution(&self) -> (u32, u32) {
        let (width, height) = self.resolution_tuple();
        if self.superres_enabled {
            (
                self.superres_scale.apply(width),
                self.superres_scale.apply(height),
            )
        } else {
            (width, height)
        }
    }
}

/// Common equirect canvas sizes
pub const RESOLUTIONS: &[(&str, &str)] = &[
    ("1920x960", "2K equirect"),
    ("3840x1920", "4K equirect"),
    ("4096x2048", "4K DCI equirect"),
    ("5760x2880", "6K equirect"),
    ("7680x3840", "8K equirect"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.resolution_tuple(), (3840, 1920));
        assert_eq!(settings.codec, "h264");
        assert!(settings.hardware_acceleration);
        assert!(!settings.superres_enabled);
    }

    #[test]
    fn test_json_round_trip() {
        let mut settings = Settings::default();
        settings.superres_enabled = true;
        settings.superres_scale = ScaleFactor::X4;
        settings.virtual_cams.push(VirtualCamConfig::default());

        let json = serde_json::to_string_pretty(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();

        assert_eq!(back.superres_scale, ScaleFactor::X4);
        assert_eq!(back.virtual_cams.len(), 1);
        assert_eq!(back.resolution, settings.resolution);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let back: Settings = serde_json::from_str(r#"{"fps": 60}"#).unwrap();
        assert_eq!(back.fps, 60);
        assert_eq!(back.resolution, "3840x1920");
    }

    #[test]
    fn test_malformed_resolution_falls_back() {
        let mut settings = Settings::default();
        settings.resolution = "garbage".to_string();
        assert_eq!(settings.resolution_tuple(), (3840, 1920));
    }

    #[test]
    fn test_post_transform_resolution_tracks_superres() {
        let mut settings = Settings::default();
        settings.resolution = "1920x960".to_string();
        assert_eq!(settings.post_transform_resolution(), (1920, 960));

        settings.superres_enabled = true;
        settings.superres_scale = ScaleFactor::X2;
        assert_eq!(settings.post_transform_resolution(), (3840, 1920));
        // The encoder must be sized for the frames it will actually see.
        let encoder = settings.encoder_config();
        assert_eq!((encoder.width, encoder.height), (3840, 1920));
    }
}
