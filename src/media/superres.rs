//! Super-Resolution Adapter
//!
//! AI upscaling through the NVIDIA Video Effects (Maxine) SuperRes effect.
//! The SDK is loaded at runtime with `dlopen`, so machines without the
//! NVIDIA stack simply fail `initialize` and the studio runs without
//! upscaling.
//!
//! Input frames arrive zero-copy: the Vulkan-exported fd is imported as
//! CUDA external memory (cached per export identity) and the effect reads
//! the render target directly. The upscaled result lands in an
//! adapter-owned CUDA buffer and is mirrored into CPU memory for the
//! downstream sinks, which consume CPU-visible frames.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use log::{debug, info};
use parking_lot::RwLock;

use crate::gpu::cuda::{self, CUdeviceptr, CUstream};
use crate::gpu::{CudaExternalMemoryImporter, ImportCache};
use crate::media::{FrameError, FrameMemory, GpuFrameView, PixelFormat};
use crate::pipeline::{ScaleFactor, SuperResAdapter, SuperResConfig};

// ─── Video Effects SDK ABI ───────────────────────────────────────────────

type NvCvStatus = c_int;
const NVCV_SUCCESS: NvCvStatus = 0;
type NvVfxHandle = *mut c_void;

// Effect selector and parameter names from the SDK headers.
const FX_SUPER_RES: &CStr = c"SuperRes";
const PARAM_MODE: &CStr = c"Mode";
const PARAM_STRENGTH: &CStr = c"Strength";
const PARAM_SRC_IMAGE: &CStr = c"SrcImage";
const PARAM_DST_IMAGE: &CStr = c"DstImage";
const PARAM_MODEL_DIR: &CStr = c"ModelDir";
const PARAM_CUDA_STREAM: &CStr = c"CudaStream";

// NvCVImage field values for chunky RGBA u8 in CUDA memory.
const NVCV_RGBA: u32 = 6;
const NVCV_U8: u32 = 1;
const NVCV_CHUNKY: u8 = 0;
const NVCV_CUDA: u8 = 1;

/// Minimal mirror of the SDK's `NvCVImage` (64 bytes on 64-bit)
#[repr(C)]
struct NvCvImage {
    width: u32,
    height: u32,
    pitch: i32,
    pixel_format: u32,
    component_type: u32,
    pixel_bytes: u8,
    component_bytes: u8,
    num_components: u8,
    planar: u8,
    gpu_mem: u8,
    colorspace: u8,
    reserved: [u8; 2],
    pixels: *mut c_void,
    delete_ptr: *mut c_void,
    delete_proc: Option<unsafe extern "C" fn(*mut c_void)>,
    buffer_bytes: u64,
}

impl NvCvImage {
    fn cuda_rgba(width: u32, height: u32, device_ptr: CUdeviceptr) -> Self {
        Self {
            width,
            height,
            pitch: (width * 4) as i32,
            pixel_format: NVCV_RGBA,
            component_type: NVCV_U8,
            pixel_bytes: 4,
            component_bytes: 1,
            num_components: 4,
            planar: NVCV_CHUNKY,
            gpu_mem: NVCV_CUDA,
            colorspace: 0,
            reserved: [0; 2],
            pixels: device_ptr as *mut c_void,
            delete_ptr: std::ptr::null_mut(),
            delete_proc: None,
            buffer_bytes: width as u64 * height as u64 * 4,
        }
    }
}

struct NvVfxApi {
    create_effect: unsafe extern "C" fn(*const c_char, *mut NvVfxHandle) -> NvCvStatus,
    destroy_effect: unsafe extern "C" fn(NvVfxHandle) -> NvCvStatus,
    set_u32: unsafe extern "C" fn(NvVfxHandle, *const c_char, u32) -> NvCvStatus,
    set_f32: unsafe extern "C" fn(NvVfxHandle, *const c_char, f32) -> NvCvStatus,
    set_string: unsafe extern "C" fn(NvVfxHandle, *const c_char, *const c_char) -> NvCvStatus,
    set_image: unsafe extern "C" fn(NvVfxHandle, *const c_char, *mut NvCvImage) -> NvCvStatus,
    set_cuda_stream: unsafe extern "C" fn(NvVfxHandle, *const c_char, CUstream) -> NvCvStatus,
    load: unsafe extern "C" fn(NvVfxHandle) -> NvCvStatus,
    run: unsafe extern "C" fn(NvVfxHandle, c_int) -> NvCvStatus,
    cuda_stream_create: unsafe extern "C" fn(*mut CUstream) -> NvCvStatus,
    cuda_stream_destroy: unsafe extern "C" fn(CUstream) -> NvCvStatus,
}

// SAFETY: fn pointers into a library that stays loaded for the process
// lifetime.
unsafe impl Send for NvVfxApi {}
unsafe impl Sync for NvVfxApi {}

static NVVFX_API: OnceLock<std::result::Result<NvVfxApi, String>> = OnceLock::new();

fn load_symbol<T>(handle: *mut c_void, name: &'static str) -> std::result::Result<T, String> {
    let cname = CString::new(name).map_err(|_| format!("invalid symbol name: {name}"))?;
    // SAFETY: handle is a valid dlopen handle and cname a valid symbol name.
    let ptr = unsafe { libc::dlsym(handle, cname.as_ptr()) };
    if ptr.is_null() {
        Err(format!("dlsym({name}) failed"))
    } else {
        // SAFETY: ptr points to an SDK function with signature T.
        Ok(unsafe { std::mem::transmute_copy(&ptr) })
    }
}

fn init_nvvfx_api() -> std::result::Result<NvVfxApi, String> {
    let mut handle = std::ptr::null_mut();
    for candidate in ["libVideoFX.so", "libNVVideoEffects.so"] {
        let soname =
            CString::new(candidate).map_err(|_| format!("invalid soname: {candidate}"))?;
        // SAFETY: static soname and valid dlopen flags.
        handle = unsafe { libc::dlopen(soname.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if !handle.is_null() {
            break;
        }
    }
    if handle.is_null() {
        return Err("Video Effects SDK not found (libVideoFX.so)".to_string());
    }

    Ok(NvVfxApi {
        create_effect: load_symbol(handle, "NvVFX_CreateEffect")?,
        destroy_effect: load_symbol(handle, "NvVFX_DestroyEffect")?,
        set_u32: load_symbol(handle, "NvVFX_SetU32")?,
        set_f32: load_symbol(handle, "NvVFX_SetF32")?,
        set_string: load_symbol(handle, "NvVFX_SetString")?,
        set_image: load_symbol(handle, "NvVFX_SetImage")?,
        set_cuda_stream: load_symbol(handle, "NvVFX_SetCudaStream")?,
        load: load_symbol(handle, "NvVFX_Load")?,
        run: load_symbol(handle, "NvVFX_Run")?,
        cuda_stream_create: load_symbol(handle, "NvVFX_CudaStreamCreate")?,
        cuda_stream_destroy: load_symbol(handle, "NvVFX_CudaStreamDestroy")?,
    })
}

fn nvvfx_api() -> Result<&'static NvVfxApi> {
    let api = NVVFX_API.get_or_init(init_nvvfx_api);
    api.as_ref()
        .map_err(|err| anyhow!("super-resolution unavailable: {err}"))
}

#[inline]
fn check_vfx(status: NvCvStatus, context: &str) -> Result<()> {
    if status == NVCV_SUCCESS {
        Ok(())
    } else {
        Err(anyhow!("{context} failed with NvCV status {status}"))
    }
}

// ─── Adapter ─────────────────────────────────────────────────────────────

struct DstBuffers {
    device: CUdeviceptr,
    width: u32,
    height: u32,
    /// CPU mirror handed to downstream sinks after each run
    pixels: Arc<RwLock<Vec<u8>>>,
}

impl Drop for DstBuffers {
    fn drop(&mut self) {
        cuda::mem_free(self.device);
    }
}

struct SrSession {
    effect: NvVfxHandle,
    stream: CUstream,
    input_width: u32,
    input_height: u32,
    /// Boxed so the addresses handed to `NvVFX_SetImage` stay stable
    src_image: Box<NvCvImage>,
    dst_image: Box<NvCvImage>,
    dst: Option<DstBuffers>,
    /// `(src device ptr, scale, model dir)` the effect was last loaded for
    loaded_for: Option<(CUdeviceptr, ScaleFactor, PathBuf)>,
}

// SAFETY: SDK handles have no thread affinity.
unsafe impl Send for SrSession {}

impl Drop for SrSession {
    fn drop(&mut self) {
        let Ok(api) = nvvfx_api() else { return };
        if !self.effect.is_null() {
            // SAFETY: effect came from NvVFX_CreateEffect.
            unsafe {
                (api.destroy_effect)(self.effect);
            }
            self.effect = std::ptr::null_mut();
        }
        if !self.stream.is_null() {
            // SAFETY: stream came from NvVFX_CudaStreamCreate.
            unsafe {
                (api.cuda_stream_destroy)(self.stream);
            }
            self.stream = std::ptr::null_mut();
        }
    }
}

/// NVIDIA Maxine SuperRes upscaler.
///
/// The inference session is fixed-resolution: call `initialize` again when
/// the input dimensions change. Quality and sharpness may vary per call.
pub struct MaxineSuperRes {
    session: Option<SrSession>,
    import_cache: ImportCache<CudaExternalMemoryImporter>,
    frames_processed: u64,
}

impl MaxineSuperRes {
    pub fn new() -> Self {
        Self {
            session: None,
            import_cache: ImportCache::new(CudaExternalMemoryImporter),
            frames_processed: 0,
        }
    }

    /// Whether the Video Effects SDK is present on this machine
    pub fn is_available() -> bool {
        nvvfx_api().is_ok()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    fn ensure_dst(session: &mut SrSession, scale: ScaleFactor) -> Result<()> {
        let out_width = scale.apply(session.input_width);
        let out_height = scale.apply(session.input_height);
        let needs_alloc = session
            .dst
            .as_ref()
            .map_or(true, |d| d.width != out_width || d.height != out_height);
        if !needs_alloc {
            return Ok(());
        }

        let byte_len = out_width as usize * out_height as usize * 4;
        let device = cuda::mem_alloc(byte_len)?;
        debug!("allocated {out_width}x{out_height} super-res destination");
        session.dst = Some(DstBuffers {
            device,
            width: out_width,
            height: out_height,
            pixels: Arc::new(RwLock::new(vec![0u8; byte_len])),
        });
        Ok(())
    }
}

impl Default for MaxineSuperRes {
    fn default() -> Self {
        Self::new()
    }
}

impl SuperResAdapter for MaxineSuperRes {
    fn initialize(&mut self, width: u32, height: u32) -> Result<()> {
        let api = nvvfx_api()?;
        cuda::ensure_context()?;

        // Tear down any previous session first (re-initialization path).
        self.session = None;

        let mut effect: NvVfxHandle = std::ptr::null_mut();
        // SAFETY: selector is a valid C string; out-param is valid.
        check_vfx(
            unsafe { (api.create_effect)(FX_SUPER_RES.as_ptr(), &mut effect) },
            "NvVFX_CreateEffect(SuperRes)",
        )?;

        let mut stream: CUstream = std::ptr::null_mut();
        // SAFETY: out-param is valid.
        let rc = unsafe { (api.cuda_stream_create)(&mut stream) };
        if rc != NVCV_SUCCESS {
            // SAFETY: effect is live and about to be abandoned.
            unsafe {
                (api.destroy_effect)(effect);
            }
            return Err(anyhow!(
                "NvVFX_CudaStreamCreate failed with NvCV status {rc}"
            ));
        }
        // SAFETY: effect and stream are live; parameter name is static.
        let rc = unsafe { (api.set_cuda_stream)(effect, PARAM_CUDA_STREAM.as_ptr(), stream) };
        if rc != NVCV_SUCCESS {
            // SAFETY: both handles are live and about to be abandoned.
            unsafe {
                (api.cuda_stream_destroy)(stream);
                (api.destroy_effect)(effect);
            }
            return Err(anyhow!("NvVFX_SetCudaStream failed with NvCV status {rc}"));
        }

        info!("super-resolution session ready for {width}x{height} input");
        self.session = Some(SrSession {
            effect,
            stream,
            input_width: width,
            input_height: height,
            src_image: Box::new(NvCvImage::cuda_rgba(width, height, 0)),
            dst_image: Box::new(NvCvImage::cuda_rgba(0, 0, 0)),
            dst: None,
            loaded_for: None,
        });
        Ok(())
    }

    fn process(&mut self, frame: &mut GpuFrameView, config: &SuperResConfig) -> Result<()> {
        let api = nvvfx_api()?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("super-resolution not initialized"))?;

        if frame.format != PixelFormat::Rgba8 {
            return Err(FrameError::UnsupportedFormat(frame.format).into());
        }
        if frame.width != session.input_width || frame.height != session.input_height {
            return Err(anyhow!(
                "input changed to {}x{} (session is {}x{}); re-initialize the adapter",
                frame.width,
                frame.height,
                session.input_width,
                session.input_height,
            ));
        }
        // Zero-copy only: a frame without an export handle is skipped and
        // left unmodified.
        let export = frame.export.ok_or(FrameError::NotExported)?;

        let src_ptr = self.import_cache.get_or_import(&export)?.device_ptr;
        Self::ensure_dst(session, config.scale)?;
        let (dst_device, dst_width, dst_height, dst_pixels) = {
            let dst = session.dst.as_ref().ok_or_else(|| anyhow!("no destination"))?;
            (dst.device, dst.width, dst.height, dst.pixels.clone())
        };

        // (Re)bind images and reload the model when the source mapping,
        // scale or model directory changed.
        let loaded_key = (src_ptr, config.scale, config.model_dir.clone());
        if session.loaded_for.as_ref() != Some(&loaded_key) {
            *session.src_image =
                NvCvImage::cuda_rgba(session.input_width, session.input_height, src_ptr);
            *session.dst_image = NvCvImage::cuda_rgba(dst_width, dst_height, dst_device);

            let model_dir = CString::new(config.model_dir.to_string_lossy().as_bytes())
                .map_err(|_| anyhow!("model dir contains a NUL byte"))?;
            // SAFETY: effect is live; image boxes outlive the session;
            // strings are valid C strings.
            unsafe {
                check_vfx(
                    (api.set_string)(session.effect, PARAM_MODEL_DIR.as_ptr(), model_dir.as_ptr()),
                    "NvVFX_SetString(ModelDir)",
                )?;
                check_vfx(
                    (api.set_image)(
                        session.effect,
                        PARAM_SRC_IMAGE.as_ptr(),
                        session.src_image.as_mut() as *mut NvCvImage,
                    ),
                    "NvVFX_SetImage(SrcImage)",
                )?;
                check_vfx(
                    (api.set_image)(
                        session.effect,
                        PARAM_DST_IMAGE.as_ptr(),
                        session.dst_image.as_mut() as *mut NvCvImage,
                    ),
                    "NvVFX_SetImage(DstImage)",
                )?;
                check_vfx((api.load)(session.effect), "NvVFX_Load")?;
            }
            session.loaded_for = Some(loaded_key);
        }

        // Quality and strength are cheap per-call knobs.
        // SAFETY: effect is live; parameter names are static C strings.
        unsafe {
            check_vfx(
                (api.set_u32)(session.effect, PARAM_MODE.as_ptr(), config.quality.mode()),
                "NvVFX_SetU32(Mode)",
            )?;
            check_vfx(
                (api.set_f32)(
                    session.effect,
                    PARAM_STRENGTH.as_ptr(),
                    config.sharpness.clamp(0.0, 1.0),
                ),
                "NvVFX_SetF32(Strength)",
            )?;
            check_vfx((api.run)(session.effect, 0), "NvVFX_Run")?;
        }
        cuda::stream_synchronize(session.stream)?;

        // Mirror the upscaled result for the CPU-visible sinks and swap the
        // view: memory, dimensions and stride update together.
        {
            let mut pixels = dst_pixels.write();
            cuda::memcpy_dtoh(&mut pixels, dst_device)?;
        }
        frame.memory = FrameMemory::Cpu(dst_pixels);
        frame.export = None;
        frame.width = dst_width;
        frame.height = dst_height;
        frame.stride = dst_width * 4;

        self.frames_processed += 1;
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.session.is_some() {
            debug!(
                "shutting down super-resolution after {} frames",
                self.frames_processed
            );
        }
        self.session = None;
        self.import_cache.invalidate();
    }
}

impl Drop for MaxineSuperRes {
    fn drop(&mut self) {
        self.shutdown();
    }
}
