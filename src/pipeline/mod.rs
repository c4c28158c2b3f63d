//! Frame Pipeline
//!
//! Capability interfaces every pipeline stage implements, and the frame
//! router that drives one frame through them per tick.
//!
//! These traits are the neutral home shared by the router, the adapters in
//! `media/`, and the render engines in `render/` - concrete adapters own
//! their backend resources (codec context, CUDA stream, device fd) and are
//! responsible for releasing them on shutdown.

mod router;

pub use router::{FrameRouter, RouterStats, TickOutcome};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::media::GpuFrameView;

/// Shared adapter handles. Stages are registered with the router as
/// reference-counted handles so that removing one from its owning registry
/// while the router still holds it degrades to a live-but-unrouted adapter,
/// never a dangling reference.
pub type SharedRenderEngine = Arc<Mutex<dyn RenderEngine>>;
pub type SharedStitcher = Arc<Mutex<dyn Stitcher>>;
pub type SharedSuperRes = Arc<Mutex<dyn SuperResAdapter>>;
pub type SharedEncoder = Arc<Mutex<dyn EncoderAdapter>>;
pub type SharedVirtualCam = Arc<Mutex<dyn VirtualCamOutput>>;

/// Render engine configuration
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    /// Enable API validation layers (debug builds of the engine)
    pub enable_validation: bool,
    /// Platform extensions the engine must enable (e.g. external-memory
    /// extensions for the zero-copy export path)
    pub platform_extensions: Vec<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 3840,
            height: 1920,
            enable_validation: false,
            platform_extensions: Vec::new(),
        }
    }
}

/// External surface the final frame is blitted to for headset passthrough.
///
/// The router treats this as opaque; only the render engine interprets it.
pub enum PresentationTarget {
    /// A swapchain image handle owned by the presentation layer (OpenXR)
    VulkanImage { image: u64 },
    /// A CPU pixel buffer, used by the headless engine and by tests
    CpuBuffer(Arc<RwLock<Vec<u8>>>),
}

/// Owns the GPU context, begins/ends frames and exposes the rendered output.
///
/// GPU synchronization is the engine's responsibility: by the time
/// `output_frame` returns, the frame content is ready for every downstream
/// consumer of the returned view.
pub trait RenderEngine: Send {
    fn initialize(&mut self, config: &RenderConfig) -> Result<()>;

    fn shutdown(&mut self);

    /// Begin a new frame. A `false` return is the backpressure signal: the
    /// tick is dropped, never queued.
    fn begin_frame(&mut self) -> bool;

    /// Produce the source content for the current frame
    fn draw_scene(&mut self);

    /// The rendered output of the current frame
    fn output_frame(&mut self) -> GpuFrameView;

    /// Blit the current output into an externally supplied presentation
    /// surface at the given dimensions
    fn blit_to_external(
        &mut self,
        target: &mut PresentationTarget,
        width: u32,
        height: u32,
    ) -> Result<()>;
}

/// Kind of capture source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Camera,
    Browser,
    Screen,
    #[default]
    TestPattern,
}

/// Capture source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_type: SourceType,
    /// Device identifier (V4L2 path, display name, URL)
    pub device_id: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Produces frames (camera, browser, screen share). Driven by the render
/// engine / scene layer, not by the router directly.
pub trait FrameSource: Send {
    fn initialize(&mut self, config: &SourceConfig) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Acquire the next frame, or `None` if no frame is ready.
    ///
    /// The returned view stays valid until `release_frame` is called for it.
    fn acquire_frame(&mut self) -> Option<GpuFrameView>;

    fn release_frame(&mut self, frame: GpuFrameView);

    fn shutdown(&mut self);
}

/// Stitcher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StitchConfig {
    /// Path to the per-calibration UV map; `None` uses the identity map
    pub calibration_map: Option<PathBuf>,
    pub enable: bool,
}

/// GPU transform: fisheye to equirectangular remap using a calibration map.
///
/// Logically in-place: the frame keeps its dimensions, the content is
/// remapped. Must run on non-upscaled input so the calibration map matches
/// the capture resolution.
pub trait Stitcher: Send {
    fn initialize(&mut self, width: u32, height: u32) -> Result<()>;

    fn process(&mut self, frame: &mut GpuFrameView, config: &StitchConfig) -> Result<()>;

    fn shutdown(&mut self);
}

/// Super-resolution quality mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SrQuality {
    /// Mode 0: fastest
    Performance = 0,
    /// Mode 1: best quality
    #[default]
    HighQuality = 1,
}

impl SrQuality {
    pub fn mode(&self) -> u32 {
        *self as u32
    }
}

/// Supported super-resolution scale factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ScaleFactor {
    /// 1.33x (4/3)
    #[serde(rename = "1.33x")]
    X133,
    /// 1.5x
    #[serde(rename = "1.5x")]
    X15,
    /// 2x
    #[default]
    #[serde(rename = "2x")]
    X2,
    /// 3x
    #[serde(rename = "3x")]
    X3,
    /// 4x
    #[serde(rename = "4x")]
    X4,
}

impl ScaleFactor {
    pub fn factor(&self) -> f32 {
        match self {
            ScaleFactor::X133 => 4.0 / 3.0,
            ScaleFactor::X15 => 1.5,
            ScaleFactor::X2 => 2.0,
            ScaleFactor::X3 => 3.0,
            ScaleFactor::X4 => 4.0,
        }
    }

    /// Output dimension for an input dimension: `round(dim * factor)`
    pub fn apply(&self, dim: u32) -> u32 {
        (dim as f32 * self.factor()).round() as u32
    }

    pub fn all() -> &'static [ScaleFactor] {
        &[
            ScaleFactor::X133,
            ScaleFactor::X15,
            ScaleFactor::X2,
            ScaleFactor::X3,
            ScaleFactor::X4,
        ]
    }
}

/// Super-resolution configuration. Quality and sharpness may change per call
/// without re-initializing the session; a dimension change requires
/// re-initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperResConfig {
    /// Enhancement strength in `[0, 1]`
    pub sharpness: f32,
    pub quality: SrQuality,
    /// Directory containing the vendor model files
    pub model_dir: PathBuf,
    pub scale: ScaleFactor,
}

impl Default for SuperResConfig {
    fn default() -> Self {
        Self {
            sharpness: 0.4,
            quality: SrQuality::default(),
            model_dir: PathBuf::new(),
            scale: ScaleFactor::default(),
        }
    }
}

/// AI upscaling transform. The only stage allowed to change frame
/// dimensions; on success the view's `width`/`height`/`stride` reflect the
/// upscaled resolution.
pub trait SuperResAdapter: Send {
    /// Prepare a fixed-resolution inference session. Must be called again
    /// if the input dimensions change.
    fn initialize(&mut self, width: u32, height: u32) -> Result<()>;

    fn process(&mut self, frame: &mut GpuFrameView, config: &SuperResConfig) -> Result<()>;

    /// Release the inference session. Idempotent.
    fn shutdown(&mut self);
}

/// Encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Requested codec family ("h264", "h265", "av1")
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub bitrate_kbps: u32,
    pub hardware_acceleration: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: "h264".to_string(),
            width: 3840,
            height: 1920,
            fps_num: 30,
            fps_den: 1,
            bitrate_kbps: 40_000,
            hardware_acceleration: true,
        }
    }
}

/// Consumes frames, produces a compressed bitstream.
///
/// When `encode_frame` returns `Ok`, the encoder has captured all frame
/// content it needs and no longer references the caller's view.
pub trait EncoderAdapter: Send {
    fn initialize(&mut self, config: &EncoderConfig) -> Result<()>;

    fn encode_frame(&mut self, frame: &GpuFrameView) -> Result<()>;

    /// Drain pending output without destroying the codec context (used on
    /// stop, not on shutdown)
    fn flush(&mut self) -> Result<()>;

    /// Release codec context and buffers. Idempotent.
    fn shutdown(&mut self);
}

/// Virtual camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualCamConfig {
    /// OS device path, e.g. `/dev/video20`
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for VirtualCamConfig {
    fn default() -> Self {
        Self {
            device_path: "/dev/video20".to_string(),
            width: 1920,
            height: 1080,
            fps: 30,
        }
    }
}

/// Converts frames to the device pixel format and writes them to an OS
/// virtual video device
pub trait VirtualCamOutput: Send {
    fn initialize(&mut self, config: &VirtualCamConfig) -> Result<()>;

    fn send_frame(&mut self, frame: &GpuFrameView) -> Result<()>;

    /// Close the device handle. Idempotent.
    fn shutdown(&mut self);
}
