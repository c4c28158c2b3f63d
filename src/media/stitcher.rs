//! Fisheye Stitcher
//!
//! Remaps a fisheye capture into an equirectangular projection using a
//! per-calibration UV map: for every output pixel the map stores the
//! normalized source coordinate to sample. The remap is logically in-place -
//! dimensions are unchanged, content is rewritten.
//!
//! Stitching always runs on non-upscaled input so the calibration map is
//! sized for the capture resolution.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context as _, Result};
use log::{debug, info};

use crate::media::{FrameError, GpuFrameView, PixelFormat};
use crate::pipeline::{StitchConfig, Stitcher};

const MAP_MAGIC: &[u8; 4] = b"VRUV";

/// Normalized source coordinate for a pixel outside the lens coverage
const UNMAPPED: (f32, f32) = (-1.0, -1.0);

/// Per-calibration UV map: one normalized `(u, v)` source coordinate per
/// output pixel. Coordinates outside `[0, 1]` mark pixels with no source
/// (outside the lens circle); those render black.
#[derive(Debug, Clone)]
pub struct CalibrationMap {
    pub width: u32,
    pub height: u32,
    uv: Vec<(f32, f32)>,
}

impl CalibrationMap {
    /// Pass-through map: every output pixel samples itself
    pub fn identity(width: u32, height: u32) -> Self {
        let mut uv = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                uv.push((
                    x as f32 / (width.max(2) - 1) as f32,
                    y as f32 / (height.max(2) - 1) as f32,
                ));
            }
        }
        Self { width, height, uv }
    }

    /// Map for an equisolid fisheye lens centered in the source image.
    ///
    /// Output is treated as a full equirectangular panorama; directions
    /// beyond `fov_deg / 2` from the lens axis have no source and render
    /// black.
    pub fn fisheye_equisolid(width: u32, height: u32, fov_deg: f32) -> Self {
        let half_fov = (fov_deg.clamp(1.0, 360.0) / 2.0).to_radians();
        // Normalized focal length: theta = half_fov lands on radius 0.5.
        let focal = 0.5 / (2.0 * (half_fov / 2.0).sin());

        let mut uv = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                let lon = (x as f32 / width as f32 - 0.5) * std::f32::consts::TAU;
                let lat = (0.5 - y as f32 / height as f32) * std::f32::consts::PI;

                // Direction for this equirect pixel; lens looks down +Z.
                let dx = lat.cos() * lon.sin();
                let dy = lat.sin();
                let dz = lat.cos() * lon.cos();

                let theta = dz.clamp(-1.0, 1.0).acos();
                if theta > half_fov {
                    uv.push(UNMAPPED);
                    continue;
                }

                let radius = 2.0 * focal * (theta / 2.0).sin();
                let phi = dy.atan2(dx);
                uv.push((0.5 + radius * phi.cos(), 0.5 - radius * phi.sin()));
            }
        }
        Self { width, height, uv }
    }

    /// Load a map from the `VRUV` binary format: magic, LE u32 dimensions,
    /// then one LE f32 `(u, v)` pair per pixel
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("failed to open calibration map {}", path.display()))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MAP_MAGIC {
            bail!("{} is not a calibration map (bad magic)", path.display());
        }

        let mut dims = [0u8; 8];
        file.read_exact(&mut dims)?;
        let width = u32::from_le_bytes([dims[0], dims[1], dims[2], dims[3]]);
        let height = u32::from_le_bytes([dims[4], dims[5], dims[6], dims[7]]);

        let count = width as usize * height as usize;
        let mut payload = vec![0u8; count * 8];
        file.read_exact(&mut payload)
            .with_context(|| format!("calibration map {} is truncated", path.display()))?;

        let uv = payload
            .chunks_exact(8)
            .map(|c| {
                (
                    f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                    f32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                )
            })
            .collect();

        info!(
            "loaded calibration map {} ({width}x{height})",
            path.display()
        );
        Ok(Self { width, height, uv })
    }

    /// Write the map in the `VRUV` binary format
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("failed to create calibration map {}", path.display()))?;
        file.write_all(MAP_MAGIC)?;
        file.write_all(&self.width.to_le_bytes())?;
        file.write_all(&self.height.to_le_bytes())?;
        for (u, v) in &self.uv {
            file.write_all(&u.to_le_bytes())?;
            file.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    #[inline]
    fn sample(&self, x: u32, y: u32) -> (f32, f32) {
        self.uv[(y * self.width + x) as usize]
    }
}

/// CPU remap stage implementing the `Stitcher` capability.
///
/// Operates on CPU-visible frames; a GPU-resident frame without a mapped
/// buffer is skipped gracefully.
pub struct EquirectStitcher {
    dims: Option<(u32, u32)>,
    map: Option<CalibrationMap>,
    /// Path the current map was loaded from, to reload only on change
    map_source: Option<PathBuf>,
    scratch: Vec<u8>,
}

impl EquirectStitcher {
    pub fn new() -> Self {
        Self {
            dims: None,
            map: None,
            map_source: None,
            scratch: Vec::new(),
        }
    }

    /// Use an in-memory map instead of loading one from disk
    pub fn with_map(map: CalibrationMap) -> Self {
        Self {
            dims: Some((map.width, map.height)),
            map: Some(map),
            map_source: None,
            scratch: Vec::new(),
        }
    }

    fn ensure_map(&mut self, config: &StitchConfig, width: u32, height: u32) -> Result<()> {
        if let Some(path) = &config.calibration_map {
            if self.map_source.as_deref() != Some(path.as_path()) {
                self.map = Some(CalibrationMap::load(path)?);
                self.map_source = Some(path.clone());
            }
        } else if self.map.is_none() {
            debug!("no calibration map configured, generating 180-degree equisolid map");
            self.map = Some(CalibrationMap::fisheye_equisolid(width, height, 180.0));
        }
        Ok(())
    }
}

impl Default for EquirectStitcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Stitcher for EquirectStitcher {
    fn initialize(&mut self, width: u32, height: u32) -> Result<()> {
        if let Some(map) = &self.map {
            if (map.width, map.height) != (width, height) {
                bail!(
                    "calibration map is {}x{}, stitcher initialized at {width}x{height}",
                    map.width,
                    map.height
                );
            }
        }
        self.dims = Some((width, height));
        Ok(())
    }

    fn process(&mut self, frame: &mut GpuFrameView, config: &StitchConfig) -> Result<()> {
        if !config.enable {
            return Ok(());
        }

        let (width, height) = self
            .dims
            .ok_or_else(|| anyhow!("stitcher not initialized"))?;
        if frame.width != width || frame.height != height {
            return Err(FrameError::DimensionMismatch {
                got_width: frame.width,
                got_height: frame.height,
                want_width: width,
                want_height: height,
            }
            .into());
        }
        if frame.format != PixelFormat::Rgba8 {
            return Err(FrameError::UnsupportedFormat(frame.format).into());
        }
        let pixels = frame.cpu_memory().ok_or(FrameError::NotCpuVisible)?.clone();

        self.ensure_map(config, width, height)?;
        let map = self
            .map
            .as_ref()
            .ok_or_else(|| anyhow!("no calibration map"))?;

        // Snapshot the source, then rewrite the shared buffer in place.
        {
            let src = pixels.read();
            if src.len() < frame.expected_cpu_len() {
                return Err(anyhow!(
                    "frame buffer is {} bytes, expected at least {}",
                    src.len(),
                    frame.expected_cpu_len()
                ));
            }
            self.scratch.clear();
            self.scratch.extend_from_slice(&src);
        }

        let stride = frame.stride as usize;
        let mut dst = pixels.write();
        for y in 0..height {
            for x in 0..width {
                let (u, v) = map.sample(x, y);
                let d = y as usize * stride + x as usize * 4;

                if !(0.0..=1.0).contains(&u) || !(0.0..=1.0).contains(&v) {
                    dst[d..d + 4].copy_from_slice(&[0, 0, 0, 255]);
                    continue;
                }

                let sx = (u * (width - 1) as f32).round() as usize;
                let sy = (v * (height - 1) as f32).round() as usize;
                let s = sy * stride + sx * 4;
                dst[d..d + 4].copy_from_slice(&self.scratch[s..s + 4]);
            }
        }

        Ok(())
    }

    fn shutdown(&mut self) {
        self.dims = None;
        self.scratch = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::RwLock;

    use super::*;
    use crate::media::FrameMemory;

    fn frame_with_pixels(width: u32, height: u32, pixels: Vec<u8>) -> GpuFrameView {
        GpuFrameView::from_cpu_pixels(Arc::new(RwLock::new(pixels)), width, height, 0)
    }

    fn enabled() -> StitchConfig {
        StitchConfig {
            calibration_map: None,
            enable: true,
        }
    }

    #[test]
    fn test_identity_map_preserves_content() {
        let mut stitcher = EquirectStitcher::with_map(CalibrationMap::identity(4, 4));
        stitcher.initialize(4, 4).unwrap();

        let pixels: Vec<u8> = (0..4 * 4 * 4).map(|i| (i % 251) as u8).collect();
        let mut frame = frame_with_pixels(4, 4, pixels.clone());
        stitcher.process(&mut frame, &enabled()).unwrap();

        assert_eq!(*frame.cpu_memory().unwrap().read(), pixels);
        assert_eq!((frame.width, frame.height), (4, 4));
    }

    #[test]
    fn test_horizontal_flip_map() {
        let mut map = CalibrationMap::identity(2, 1);
        for (u, _) in map.uv.iter_mut() {
            *u = 1.0 - *u;
        }
        let mut stitcher = EquirectStitcher::with_map(map);
        stitcher.initialize(2, 1).unwrap();

        let mut pixels = vec![0u8; 8];
        pixels[0..4].copy_from_slice(&[10, 20, 30, 255]);
        pixels[4..8].copy_from_slice(&[40, 50, 60, 255]);
        let mut frame = frame_with_pixels(2, 1, pixels);
        stitcher.process(&mut frame, &enabled()).unwrap();

        let out = frame.cpu_memory().unwrap().read().clone();
        assert_eq!(&out[0..4], &[40, 50, 60, 255]);
        assert_eq!(&out[4..8], &[10, 20, 30, 255]);
    }

    #[test]
    fn test_unmapped_pixels_render_black() {
        let mut map = CalibrationMap::identity(2, 1);
        map.uv[1] = (-1.0, -1.0);
        let mut stitcher = EquirectStitcher::with_map(map);
        stitcher.initialize(2, 1).unwrap();

        let mut frame = frame_with_pixels(2, 1, vec![200u8; 8]);
        stitcher.process(&mut frame, &enabled()).unwrap();

        let out = frame.cpu_memory().unwrap().read().clone();
        assert_eq!(&out[4..8], &[0, 0, 0, 255]);
    }

    #[test]
    fn test_disabled_config_is_passthrough() {
        let mut stitcher = EquirectStitcher::with_map(CalibrationMap::identity(2, 2));
        stitcher.initialize(2, 2).unwrap();

        let pixels = vec![77u8; 16];
        let mut frame = frame_with_pixels(2, 2, pixels.clone());
        stitcher
            .process(
                &mut frame,
                &StitchConfig {
                    calibration_map: None,
                    enable: false,
                },
            )
            .unwrap();
        assert_eq!(*frame.cpu_memory().unwrap().read(), pixels);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut stitcher = EquirectStitcher::with_map(CalibrationMap::identity(4, 4));
        stitcher.initialize(4, 4).unwrap();

        let mut frame = frame_with_pixels(8, 8, vec![0u8; 8 * 8 * 4]);
        assert!(stitcher.process(&mut frame, &enabled()).is_err());
    }

    #[test]
    fn test_gpu_frame_skipped_gracefully() {
        let mut stitcher = EquirectStitcher::with_map(CalibrationMap::identity(2, 2));
        stitcher.initialize(2, 2).unwrap();

        let mut frame = GpuFrameView {
            memory: FrameMemory::Gpu(crate::media::GpuHandles { image: 1, memory: 2 }),
            export: None,
            format: PixelFormat::Rgba8,
            width: 2,
            height: 2,
            stride: 8,
            timestamp_ns: 0,
            color: Default::default(),
        };
        assert!(stitcher.process(&mut frame, &enabled()).is_err());
    }

    #[test]
    fn test_map_save_load_round_trip() {
        let map = CalibrationMap::fisheye_equisolid(16, 8, 180.0);
        let path = std::env::temp_dir().join(format!(
            "vr360-studio-map-{}.vruv",
            std::process::id()
        ));

        map.save(&path).unwrap();
        let loaded = CalibrationMap::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!((loaded.width, loaded.height), (16, 8));
        assert_eq!(loaded.uv, map.uv);
    }

    #[test]
    fn test_load_rejects_bad_magic() {
        let path = std::env::temp_dir().join(format!(
            "vr360-studio-badmap-{}.vruv",
            std::process::id()
        ));
        std::fs::write(&path, b"NOPE0000").unwrap();
        let result = CalibrationMap::load(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }

    #[test]
    fn test_equisolid_center_maps_to_lens_center() {
        // The forward direction (image center) must sample the lens center.
        let map = CalibrationMap::fisheye_equisolid(8, 4, 180.0);
        let (u, v) = map.sample(4, 2);
        assert!((u - 0.5).abs() < 0.08, "u = {u}");
        assert!((v - 0.5).abs() < 0.08, "v = {v}");
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut stitcher = EquirectStitcher::with_map(CalibrationMap::identity(2, 2));
        stitcher.initialize(2, 2).unwrap();
        stitcher.shutdown();
        stitcher.shutdown();

        let mut frame = frame_with_pixels(2, 2, vec![0u8; 16]);
        assert!(stitcher.process(&mut frame, &enabled()).is_err());
    }
}
