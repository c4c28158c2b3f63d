//! Media Pipeline
//!
//! Frame descriptors shared by every pipeline stage, plus the encoder,
//! virtual-camera, stitcher and super-resolution adapters.

mod encoder;
mod stitcher;
mod superres;
mod vcam;

pub use encoder::{
    encoder_candidates, resolve_encoder_name, software_fallback, FfmpegEncoder, FileSink,
    PacketSink,
};
pub use stitcher::{CalibrationMap, EquirectStitcher};
pub use superres::MaxineSuperRes;
pub use vcam::{rgba_to_yuyv, V4l2VirtualCam};

use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::RwLock;

/// Pixel format of a frame's backing memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// 4-channel 8-bit RGBA, the native working format of the pipeline
    #[default]
    Rgba8,
    /// YUV 4:2:2 packed (Y0 U Y1 V), produced for virtual camera devices
    Yuyv422,
    /// NV12 semi-planar (Y plane + interleaved UV plane)
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats (NV12 is reported as its
    /// luma-plane cost)
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Yuyv422 => 2,
            PixelFormat::Nv12 => 1,
        }
    }
}

/// Video color space (matrix coefficients)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorSpace {
    /// BT.709 (HDTV) - Default
    #[default]
    BT709,
    /// BT.601 (SDTV)
    BT601,
    /// BT.2020 (UHDTV)
    BT2020,
}

/// Video color range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorRange {
    /// Limited range (16-235 for Y, 16-240 for UV) - Standard for TV/Video
    #[default]
    Limited,
    /// Full range (0-255) - Standard for PC/JPEG
    Full,
}

/// HDR mastering metadata carried alongside the color space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HdrMetadata {
    /// Mastering display max luminance in nits
    pub max_luminance: f32,
    /// Mastering display min luminance in nits
    pub min_luminance: f32,
    /// Maximum content light level in nits
    pub max_cll: f32,
}

/// Color space + HDR metadata, propagated unchanged by every stage that is
/// not itself a color-space converter
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ColorInfo {
    pub space: ColorSpace,
    pub range: ColorRange,
    pub hdr: Option<HdrMetadata>,
}

/// Opaque same-process GPU handles (Vulkan image + device memory, as raw
/// handle values)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuHandles {
    pub image: u64,
    pub memory: u64,
}

/// OS-level export handle for cross-API sharing (Vulkan external memory /
/// DMA-BUF file descriptor).
///
/// This is a non-owning descriptor. Platform semantics may consume the fd on
/// import, so one export maps to at most one import without re-exporting;
/// ownership of the fd transfers to the importer.
#[derive(Debug, Clone, Copy)]
pub struct FrameExport {
    pub fd: RawFd,
    /// Byte size of the exported allocation
    pub size: u64,
}

/// Backing memory of one frame.
///
/// CPU memory is shared behind `Arc<RwLock>` so a view clone can never
/// dangle; the producing stage keeps the allocation alive and in-place
/// transforms swap contents under the write lock. GPU memory is a pair of
/// opaque handles owned by the render engine.
#[derive(Clone)]
pub enum FrameMemory {
    /// CPU-visible pixels, shared with the producing stage
    Cpu(Arc<RwLock<Vec<u8>>>),
    /// Opaque GPU handles, only meaningful to the owning engine and to
    /// importers going through the export handle
    Gpu(GpuHandles),
}

impl std::fmt::Debug for FrameMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameMemory::Cpu(buf) => f
                .debug_struct("Cpu")
                .field("len", &buf.read().len())
                .finish(),
            FrameMemory::Gpu(handles) => f.debug_tuple("Gpu").field(handles).finish(),
        }
    }
}

/// Non-owning descriptor of one video frame: backing memory plus metadata.
///
/// A view never owns frame memory. It is valid for the duration of one
/// `FrameRouter::process_frame` call; no stage may retain it past that call.
/// `width`/`height`/`stride` always describe the current contents - a stage
/// that resizes (super-resolution) updates all three together with the
/// memory swap. `timestamp_ns` is monotonic capture time and is propagated
/// unchanged through every transform stage.
#[derive(Debug, Clone)]
pub struct GpuFrameView {
    pub memory: FrameMemory,
    /// Present only when the memory has been exported for cross-API sharing
    pub export: Option<FrameExport>,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes
    pub stride: u32,
    /// Monotonic capture time in nanoseconds
    pub timestamp_ns: u64,
    pub color: ColorInfo,
}

impl GpuFrameView {
    /// Wrap CPU-visible RGBA pixels in a view
    pub fn from_cpu_pixels(
        pixels: Arc<RwLock<Vec<u8>>>,
        width: u32,
        height: u32,
        timestamp_ns: u64,
    ) -> Self {
        Self {
            memory: FrameMemory::Cpu(pixels),
            export: None,
            format: PixelFormat::Rgba8,
            width,
            height,
            stride: width * 4,
            timestamp_ns,
            color: ColorInfo::default(),
        }
    }

    pub fn is_cpu_visible(&self) -> bool {
        matches!(self.memory, FrameMemory::Cpu(_))
    }

    /// Shared CPU pixel buffer, if this frame is CPU-visible
    pub fn cpu_memory(&self) -> Option<&Arc<RwLock<Vec<u8>>>> {
        match &self.memory {
            FrameMemory::Cpu(buf) => Some(buf),
            FrameMemory::Gpu(_) => None,
        }
    }

    /// Expected CPU byte length for the current dimensions
    pub fn expected_cpu_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

/// Errors at the frame seam: a sink or transform was handed a frame it
/// cannot consume
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not CPU-visible (GPU-resident frames must be mapped first)")]
    NotCpuVisible,
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),
    #[error("frame is {got_width}x{got_height}, stage expects {want_width}x{want_height}")]
    DimensionMismatch {
        got_width: u32,
        got_height: u32,
        want_width: u32,
        want_height: u32,
    },
    #[error("frame has no export handle (zero-copy path requires exported memory)")]
    NotExported,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_frame(width: u32, height: u32) -> GpuFrameView {
        let pixels = Arc::new(RwLock::new(vec![0u8; (width * height * 4) as usize]));
        GpuFrameView::from_cpu_pixels(pixels, width, height, 42)
    }

    #[test]
    fn test_cpu_view_layout() {
        let frame = cpu_frame(640, 480);
        assert_eq!(frame.stride, 2560);
        assert_eq!(frame.expected_cpu_len(), 640 * 480 * 4);
        assert_eq!(frame.timestamp_ns, 42);
        assert!(frame.is_cpu_visible());
        assert!(frame.export.is_none());
    }

    #[test]
    fn test_view_clone_shares_memory() {
        let frame = cpu_frame(4, 4);
        let clone = frame.clone();

        frame.cpu_memory().unwrap().write()[0] = 0xAB;
        assert_eq!(clone.cpu_memory().unwrap().read()[0], 0xAB);
    }

    #[test]
    fn test_gpu_view_not_cpu_visible() {
        let frame = GpuFrameView {
            memory: FrameMemory::Gpu(GpuHandles {
                image: 0x10,
                memory: 0x20,
            }),
            export: None,
            format: PixelFormat::Rgba8,
            width: 16,
            height: 16,
            stride: 64,
            timestamp_ns: 0,
            color: ColorInfo::default(),
        };
        assert!(!frame.is_cpu_visible());
        assert!(frame.cpu_memory().is_none());
    }
}
