//! Virtual Camera Output
//!
//! Writes frames to a v4l2loopback output device so other applications can
//! open the studio feed as a webcam. Frames are converted from RGBA to
//! packed 4:2:2 YUYV with BT.601 integer coefficients before writing.
//!
//! Talks to the device directly through `libc` (open/ioctl/write); the
//! expected failure mode is the v4l2loopback module not being loaded, which
//! surfaces as an ordinary `initialize` error.

use std::ffi::{c_void, CString};
use std::os::fd::RawFd;

use anyhow::{anyhow, bail, Context as _, Result};
use log::{debug, info, warn};

use crate::media::{FrameError, GpuFrameView, PixelFormat};
use crate::pipeline::{VirtualCamConfig, VirtualCamOutput};

// ─── V4L2 ABI ────────────────────────────────────────────────────────────

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

const V4L2_PIX_FMT_YUYV: u32 = fourcc(b"YUYV");
const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
const V4L2_FIELD_NONE: u32 = 1;
const V4L2_COLORSPACE_SMPTE170M: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct V4l2PixFormat {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    priv_: u32,
    flags: u32,
    ycbcr_enc: u32,
    quantization: u32,
    xfer_func: u32,
}

/// The kernel's `v4l2_format.fmt` union is 200 bytes and 8-aligned (some
/// members hold pointers); only the pix view is used here.
#[repr(C, align(8))]
union V4l2FormatUnion {
    pix: V4l2PixFormat,
    raw: [u8; 200],
}

#[repr(C)]
struct V4l2Format {
    type_: u32,
    fmt: V4l2FormatUnion,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct V4l2Fract {
    numerator: u32,
    denominator: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct V4l2OutputParm {
    capability: u32,
    outputmode: u32,
    timeperframe: V4l2Fract,
    extendedmode: u32,
    writebuffers: u32,
    reserved: [u32; 4],
}

#[repr(C)]
union V4l2ParmUnion {
    output: V4l2OutputParm,
    raw: [u8; 200],
}

#[repr(C)]
struct V4l2StreamParm {
    type_: u32,
    parm: V4l2ParmUnion,
}

/// `_IOWR('V', nr, size)`
const fn vidioc_rw(nr: u64, size: usize) -> libc::c_ulong {
    const IOC_WRITE: u64 = 1;
    const IOC_READ: u64 = 2;
    (((IOC_READ | IOC_WRITE) << 30) | ((size as u64) << 16) | ((b'V' as u64) << 8) | nr)
        as libc::c_ulong
}

const VIDIOC_S_FMT: libc::c_ulong = vidioc_rw(5, std::mem::size_of::<V4l2Format>());
const VIDIOC_S_PARM: libc::c_ulong = vidioc_rw(22, std::mem::size_of::<V4l2StreamParm>());

// ─── Color conversion ────────────────────────────────────────────────────

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Convert RGBA pixels to packed 4:2:2 YUYV with BT.601 coefficients.
///
/// Chroma is point-sampled from the first pixel of each horizontal pair
/// (not averaged). `width` must be even; `stride` is the RGBA row stride in
/// bytes. The output buffer is resized to `width * height * 2`.
pub fn rgba_to_yuyv(rgba: &[u8], width: u32, height: u32, stride: u32, out: &mut Vec<u8>) {
    let width = width as usize;
    let height = height as usize;
    let stride = stride as usize;
    out.clear();
    out.resize(width * height * 2, 0);

    for row in 0..height {
        let src_row = row * stride;
        let dst_row = row * width * 2;
        for pair in 0..width / 2 {
            let p0 = src_row + pair * 8;
            let p1 = p0 + 4;

            let (r0, g0, b0) = (rgba[p0] as i32, rgba[p0 + 1] as i32, rgba[p0 + 2] as i32);
            let (r1, g1, b1) = (rgba[p1] as i32, rgba[p1 + 1] as i32, rgba[p1 + 2] as i32);

            let y0 = clamp_u8(((66 * r0 + 129 * g0 + 25 * b0 + 128) >> 8) + 16);
            let y1 = clamp_u8(((66 * r1 + 129 * g1 + 25 * b1 + 128) >> 8) + 16);
            // Chroma from the first pixel of the pair.
            let u = clamp_u8(((-38 * r0 - 74 * g0 + 112 * b0 + 128) >> 8) + 128);
            let v = clamp_u8(((112 * r0 - 94 * g0 - 18 * b0 + 128) >> 8) + 128);

            let d = dst_row + pair * 4;
            out[d] = y0;
            out[d + 1] = u;
            out[d + 2] = y1;
            out[d + 3] = v;
        }
    }
}

// ─── Adapter ─────────────────────────────────────────────────────────────

/// Writes converted frames to a v4l2loopback device
pub struct V4l2VirtualCam {
    fd: RawFd,
    config: Option<VirtualCamConfig>,
    /// Reused packed-YUYV staging buffer
    packed: Vec<u8>,
    frames_sent: u64,
}

impl V4l2VirtualCam {
    pub fn new() -> Self {
        Self {
            fd: -1,
            config: None,
            packed: Vec::new(),
            frames_sent: 0,
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    fn negotiate_format(fd: RawFd, config: &VirtualCamConfig) -> Result<()> {
        let mut format = V4l2Format {
            type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            fmt: V4l2FormatUnion { raw: [0; 200] },
        };
        format.fmt.pix = V4l2PixFormat {
            width: config.width,
            height: config.height,
            pixelformat: V4L2_PIX_FMT_YUYV,
            field: V4L2_FIELD_NONE,
            bytesperline: config.width * 2,
            sizeimage: config.width * config.height * 2,
            colorspace: V4L2_COLORSPACE_SMPTE170M,
            ..V4l2PixFormat::default()
        };

        // SAFETY: fd is an open V4L2 device and format is a fully
        // initialized v4l2_format.
        let rc = unsafe { libc::ioctl(fd, VIDIOC_S_FMT, &mut format as *mut V4l2Format) };
        if rc < 0 {
            return Err(anyhow!(
                "VIDIOC_S_FMT failed: {} (is v4l2loopback loaded?)",
                std::io::Error::last_os_error()
            ));
        }

        // The driver may adjust the request; anything but our format means
        // the device cannot take this feed.
        // SAFETY: the driver filled the pix view on success.
        let accepted = unsafe { format.fmt.pix };
        if accepted.pixelformat != V4L2_PIX_FMT_YUYV
            || accepted.width != config.width
            || accepted.height != config.height
        {
            bail!(
                "device negotiated {}x{} fourcc {:#x}, wanted {}x{} YUYV",
                accepted.width,
                accepted.height,
                accepted.pixelformat,
                config.width,
                config.height
            );
        }
        Ok(())
    }

    fn set_frame_rate(fd: RawFd, config: &VirtualCamConfig) {
        let mut parm = V4l2StreamParm {
            type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            parm: V4l2ParmUnion { raw: [0; 200] },
        };
        parm.parm.output = V4l2OutputParm {
            timeperframe: V4l2Fract {
                numerator: 1,
                denominator: config.fps.max(1),
            },
            ..V4l2OutputParm::default()
        };

        // SAFETY: fd is an open V4L2 device and parm is fully initialized.
        let rc = unsafe { libc::ioctl(fd, VIDIOC_S_PARM, &mut parm as *mut V4l2StreamParm) };
        if rc < 0 {
            // Not all loopback builds accept S_PARM on the output side.
            warn!(
                "VIDIOC_S_PARM failed, fps hint ignored: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

impl Default for V4l2VirtualCam {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualCamOutput for V4l2VirtualCam {
    fn initialize(&mut self, config: &VirtualCamConfig) -> Result<()> {
        if config.width % 2 != 0 {
            bail!(
                "YUYV output requires an even width, got {}",
                config.width
            );
        }
        self.shutdown();

        let cpath = CString::new(config.device_path.as_str())
            .context("device path contains a NUL byte")?;
        // SAFETY: cpath is a valid NUL-terminated path.
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(anyhow!(
                "failed to open {}: {} (is v4l2loopback loaded?)",
                config.device_path,
                std::io::Error::last_os_error()
            ));
        }

        if let Err(e) = Self::negotiate_format(fd, config) {
            // SAFETY: fd was opened above and is not stored anywhere.
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Self::set_frame_rate(fd, config);

        info!(
            "virtual camera {} ready at {}x{}@{} YUYV",
            config.device_path, config.width, config.height, config.fps
        );
        self.fd = fd;
        self.config = Some(config.clone());
        self.frames_sent = 0;
        Ok(())
    }

    fn send_frame(&mut self, frame: &GpuFrameView) -> Result<()> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| anyhow!("virtual camera not initialized"))?;
        if self.fd < 0 {
            return Err(anyhow!("virtual camera device closed"));
        }

        if frame.format != PixelFormat::Rgba8 {
            return Err(FrameError::UnsupportedFormat(frame.format).into());
        }
        if frame.width != config.width || frame.height != config.height {
            return Err(FrameError::DimensionMismatch {
                got_width: frame.width,
                got_height: frame.height,
                want_width: config.width,
                want_height: config.height,
            }
            .into());
        }
        // GPU-resident frames must be mapped upstream before this stage.
        let pixels = frame.cpu_memory().ok_or(FrameError::NotCpuVisible)?;

        {
            let src = pixels.read();
            if src.len() < frame.expected_cpu_len() {
                return Err(anyhow!(
                    "frame buffer is {} bytes, expected at least {}",
                    src.len(),
                    frame.expected_cpu_len()
                ));
            }
            rgba_to_yuyv(&src, frame.width, frame.height, frame.stride, &mut self.packed);
        }

        // SAFETY: fd is open and packed holds width*height*2 initialized
        // bytes.
        let written = unsafe {
            libc::write(
                self.fd,
                self.packed.as_ptr() as *const c_void,
                self.packed.len(),
            )
        };
        if written != self.packed.len() as isize {
            return Err(anyhow!(
                "short write to {}: {written} of {} bytes ({})",
                config.device_path,
                self.packed.len(),
                std::io::Error::last_os_error()
            ));
        }

        self.frames_sent += 1;
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.fd >= 0 {
            debug!("closing virtual camera after {} frames", self.frames_sent);
            // SAFETY: fd is an open descriptor owned by this adapter.
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
        self.config = None;
    }
}

impl Drop for V4l2VirtualCam {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::RwLock;

    use super::*;

    #[test]
    fn test_v4l2_abi_constants() {
        assert_eq!(std::mem::size_of::<V4l2Format>(), 208);
        assert_eq!(std::mem::size_of::<V4l2StreamParm>(), 204);
        assert_eq!(VIDIOC_S_FMT, 0xC0D0_5605);
        assert_eq!(VIDIOC_S_PARM, 0xC0CC_5616);
        assert_eq!(V4L2_PIX_FMT_YUYV, 0x5659_5559);
    }

    fn solid_rgba(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
        rgba.iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect()
    }

    #[test]
    fn test_pure_red_conversion_matches_integer_formula() {
        // 4x2 pure red: every YUYV pair must be exactly (Y=82, U=90, V=240)
        // from the integer BT.601 arithmetic.
        let rgba = solid_rgba(4, 2, [255, 0, 0, 255]);
        let mut out = Vec::new();
        rgba_to_yuyv(&rgba, 4, 2, 16, &mut out);

        assert_eq!(out.len(), 16);
        for pair in out.chunks_exact(4) {
            assert_eq!(pair, &[82, 90, 82, 240]);
        }
    }

    #[test]
    fn test_mid_gray_conversion() {
        // (128,128,128): Y = ((220*128+128)>>8)+16 = 126, U = V = 128
        let rgba = solid_rgba(2, 1, [128, 128, 128, 255]);
        let mut out = Vec::new();
        rgba_to_yuyv(&rgba, 2, 1, 8, &mut out);
        assert_eq!(out, vec![126, 128, 126, 128]);
    }

    #[test]
    fn test_chroma_point_sampled_from_first_pixel() {
        // First pixel red, second pixel blue: chroma must be red's, both
        // luma values their own.
        let mut rgba = vec![0u8; 8];
        rgba[0..4].copy_from_slice(&[255, 0, 0, 255]);
        rgba[4..8].copy_from_slice(&[0, 0, 255, 255]);
        let mut out = Vec::new();
        rgba_to_yuyv(&rgba, 2, 1, 8, &mut out);

        let blue_y = clamp_u8(((25 * 255 + 128) >> 8) + 16);
        assert_eq!(out, vec![82, 90, blue_y, 240]);
    }

    #[test]
    fn test_conversion_respects_row_stride() {
        // 2x2 red with 4 bytes of per-row padding.
        let stride = 12u32;
        let mut rgba = vec![0u8; (stride * 2) as usize];
        for row in 0..2 {
            for col in 0..2 {
                let p = (row * stride as usize) + col * 4;
                rgba[p..p + 4].copy_from_slice(&[255, 0, 0, 255]);
            }
        }
        let mut out = Vec::new();
        rgba_to_yuyv(&rgba, 2, 2, stride, &mut out);
        assert_eq!(out, vec![82, 90, 82, 240, 82, 90, 82, 240]);
    }

    #[test]
    fn test_initialize_rejects_odd_width() {
        let mut cam = V4l2VirtualCam::new();
        let config = VirtualCamConfig {
            device_path: "/dev/video20".to_string(),
            width: 641,
            height: 480,
            fps: 30,
        };
        assert!(cam.initialize(&config).is_err());
    }

    #[test]
    fn test_send_without_initialize_fails_gracefully() {
        let mut cam = V4l2VirtualCam::new();
        let pixels = Arc::new(RwLock::new(vec![0u8; 4 * 2 * 4]));
        let frame = GpuFrameView::from_cpu_pixels(pixels, 4, 2, 0);
        assert!(cam.send_frame(&frame).is_err());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut cam = V4l2VirtualCam::new();
        cam.shutdown();
        cam.shutdown();
        assert_eq!(cam.frames_sent(), 0);
    }
}
