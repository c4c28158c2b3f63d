//! CUDA External-Memory Import
//!
//! Import side of the zero-copy path: register a Vulkan-exported fd as CUDA
//! external memory and map it to a device pointer the effect stages can
//! read. The driver API is loaded at runtime with `dlopen` so the studio
//! runs (with the effect stages degraded) on machines without an NVIDIA
//! driver.
//!
//! Every import creates driver-level resources that must be released after
//! use. `ImportCache` keeps one mapping alive per export identity and
//! releases it only when the identity changes, so steady-state operation
//! does one import total instead of one per frame.

use std::ffi::{c_int, c_uint, c_void, CStr, CString};
use std::os::fd::RawFd;
use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use log::{debug, info};

use crate::media::FrameExport;

pub type CUresult = c_int;
pub type CUdevice = c_int;
pub type CUdeviceptr = u64;
pub type CUcontext = *mut c_void;
pub type CUstream = *mut c_void;
pub type CUexternalMemory = *mut c_void;

pub const CUDA_SUCCESS: CUresult = 0;
const CU_EXTERNAL_MEMORY_HANDLE_TYPE_OPAQUE_FD: c_uint = 1;

// ─── Driver ABI structs ──────────────────────────────────────────────────

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CudaExternalMemoryHandleWin32 {
    pub handle: *mut c_void,
    pub name: *const c_void,
}

#[repr(C)]
pub union CudaExternalMemoryHandle {
    pub fd: c_int,
    pub win32: CudaExternalMemoryHandleWin32,
    pub nv_sci_buf_object: *const c_void,
}

/// Mirrors `CUDA_EXTERNAL_MEMORY_HANDLE_DESC`
#[repr(C)]
pub struct CudaExternalMemoryHandleDesc {
    pub ty: c_uint,
    pub handle: CudaExternalMemoryHandle,
    pub size: u64,
    pub flags: c_uint,
    pub reserved: [c_uint; 16],
}

/// Mirrors `CUDA_EXTERNAL_MEMORY_BUFFER_DESC`
#[repr(C)]
pub struct CudaExternalMemoryBufferDesc {
    pub offset: u64,
    pub size: u64,
    pub flags: c_uint,
    pub reserved: [c_uint; 16],
}

// ─── Driver API loading ──────────────────────────────────────────────────

struct CudaDriverApi {
    cu_init: unsafe extern "C" fn(c_uint) -> CUresult,
    cu_device_get: unsafe extern "C" fn(*mut CUdevice, c_int) -> CUresult,
    cu_device_primary_ctx_retain: unsafe extern "C" fn(*mut CUcontext, CUdevice) -> CUresult,
    cu_ctx_set_current: unsafe extern "C" fn(CUcontext) -> CUresult,
    cu_import_external_memory:
        unsafe extern "C" fn(*mut CUexternalMemory, *const CudaExternalMemoryHandleDesc) -> CUresult,
    cu_external_memory_get_mapped_buffer: unsafe extern "C" fn(
        *mut CUdeviceptr,
        CUexternalMemory,
        *const CudaExternalMemoryBufferDesc,
    ) -> CUresult,
    cu_destroy_external_memory: unsafe extern "C" fn(CUexternalMemory) -> CUresult,
    cu_mem_alloc: unsafe extern "C" fn(*mut CUdeviceptr, usize) -> CUresult,
    cu_mem_free: unsafe extern "C" fn(CUdeviceptr) -> CUresult,
    cu_memcpy_dtoh: unsafe extern "C" fn(*mut c_void, CUdeviceptr, usize) -> CUresult,
    cu_stream_synchronize: unsafe extern "C" fn(CUstream) -> CUresult,
}

// SAFETY: the table only holds function pointers into the driver library,
// which stays loaded for the process lifetime.
unsafe impl Send for CudaDriverApi {}
unsafe impl Sync for CudaDriverApi {}

static CUDA_DRIVER_API: OnceLock<std::result::Result<CudaDriverApi, String>> = OnceLock::new();
static CUDA_CONTEXT: OnceLock<std::result::Result<usize, String>> = OnceLock::new();

fn dl_error() -> String {
    // SAFETY: dlerror returns a thread-local C string or null.
    unsafe {
        let p = libc::dlerror();
        if p.is_null() {
            "unknown dl error".to_string()
        } else {
            CStr::from_ptr(p).to_string_lossy().to_string()
        }
    }
}

fn load_symbol<T>(handle: *mut c_void, name: &'static str) -> std::result::Result<T, String> {
    let cname = CString::new(name).map_err(|_| format!("invalid CUDA symbol name: {name}"))?;
    // SAFETY: handle is a valid dlopen handle and cname is a valid C symbol name.
    let ptr = unsafe { libc::dlsym(handle, cname.as_ptr()) };
    if ptr.is_null() {
        Err(format!("dlsym({name}) failed: {}", dl_error()))
    } else {
        // SAFETY: ptr points to a driver function with signature T.
        Ok(unsafe { std::mem::transmute_copy(&ptr) })
    }
}

fn init_driver_api() -> std::result::Result<CudaDriverApi, String> {
    let mut handle = std::ptr::null_mut();
    let mut last_err = "unknown dlopen error".to_string();
    for candidate in ["libcuda.so.1", "libcuda.so"] {
        let soname =
            CString::new(candidate).map_err(|_| format!("invalid CUDA soname: {candidate}"))?;
        // SAFETY: static soname and valid dlopen flags.
        handle = unsafe { libc::dlopen(soname.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if !handle.is_null() {
            break;
        }
        last_err = dl_error();
    }
    if handle.is_null() {
        return Err(format!("dlopen(libcuda.so.1|libcuda.so) failed: {last_err}"));
    }

    Ok(CudaDriverApi {
        cu_init: load_symbol(handle, "cuInit")?,
        cu_device_get: load_symbol(handle, "cuDeviceGet")?,
        cu_device_primary_ctx_retain: load_symbol(handle, "cuDevicePrimaryCtxRetain")?,
        cu_ctx_set_current: load_symbol(handle, "cuCtxSetCurrent")?,
        cu_import_external_memory: load_symbol(handle, "cuImportExternalMemory")?,
        cu_external_memory_get_mapped_buffer: load_symbol(
            handle,
            "cuExternalMemoryGetMappedBuffer",
        )?,
        cu_destroy_external_memory: load_symbol(handle, "cuDestroyExternalMemory")?,
        cu_mem_alloc: load_symbol(handle, "cuMemAlloc_v2")?,
        cu_mem_free: load_symbol(handle, "cuMemFree_v2")?,
        cu_memcpy_dtoh: load_symbol(handle, "cuMemcpyDtoH_v2")?,
        cu_stream_synchronize: load_symbol(handle, "cuStreamSynchronize")?,
    })
}

fn driver_api() -> Result<&'static CudaDriverApi> {
    let api = CUDA_DRIVER_API.get_or_init(init_driver_api);
    api.as_ref().map_err(|err| {
        anyhow!(
            "CUDA driver API unavailable: {err}. \
Effect stages that need CUDA will be skipped."
        )
    })
}

#[inline]
fn check_cu(result: CUresult, context: &str) -> Result<()> {
    if result == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(anyhow!("{context} failed with CUDA error code {result}"))
    }
}

/// Make the primary CUDA context current on this thread. One-shot per
/// process; the retained context is intentionally leaked (it lives as long
/// as the studio does).
pub fn ensure_context() -> Result<()> {
    let ctx = CUDA_CONTEXT.get_or_init(|| {
        let api = match driver_api() {
            Ok(api) => api,
            Err(e) => return Err(e.to_string()),
        };
        let mut device: CUdevice = 0;
        let mut context: CUcontext = std::ptr::null_mut();
        // SAFETY: driver API fn pointers loaded above; out-params are valid.
        let rc = unsafe {
            let rc = (api.cu_init)(0);
            if rc != CUDA_SUCCESS {
                return Err(format!("cuInit failed with CUDA error code {rc}"));
            }
            let rc = (api.cu_device_get)(&mut device, 0);
            if rc != CUDA_SUCCESS {
                return Err(format!("cuDeviceGet failed with CUDA error code {rc}"));
            }
            let rc = (api.cu_device_primary_ctx_retain)(&mut context, device);
            if rc != CUDA_SUCCESS {
                return Err(format!(
                    "cuDevicePrimaryCtxRetain failed with CUDA error code {rc}"
                ));
            }
            (api.cu_ctx_set_current)(context)
        };
        if rc != CUDA_SUCCESS {
            return Err(format!("cuCtxSetCurrent failed with CUDA error code {rc}"));
        }
        info!("CUDA primary context retained on device 0");
        Ok(context as usize)
    });
    match ctx {
        Ok(_) => Ok(()),
        Err(e) => Err(anyhow!("CUDA context unavailable: {e}")),
    }
}

// ─── Device memory helpers ───────────────────────────────────────────────

/// Allocate linear device memory
pub fn mem_alloc(size: usize) -> Result<CUdeviceptr> {
    let api = driver_api()?;
    ensure_context()?;
    let mut ptr: CUdeviceptr = 0;
    // SAFETY: out-param is valid; context is current.
    check_cu(unsafe { (api.cu_mem_alloc)(&mut ptr, size) }, "cuMemAlloc")?;
    Ok(ptr)
}

/// Free device memory allocated with `mem_alloc`. Accepts 0 as a no-op.
pub fn mem_free(ptr: CUdeviceptr) {
    if ptr == 0 {
        return;
    }
    let Ok(api) = driver_api() else { return };
    // SAFETY: ptr came from cuMemAlloc.
    unsafe {
        (api.cu_mem_free)(ptr);
    }
}

/// Copy device memory to host
pub fn memcpy_dtoh(dst: &mut [u8], src: CUdeviceptr) -> Result<()> {
    let api = driver_api()?;
    // SAFETY: dst is a valid writable host buffer of the given length and
    // src is a device allocation at least that large (caller contract).
    check_cu(
        unsafe { (api.cu_memcpy_dtoh)(dst.as_mut_ptr() as *mut c_void, src, dst.len()) },
        "cuMemcpyDtoH",
    )
}

/// Block until all work queued on the stream has completed
pub fn stream_synchronize(stream: CUstream) -> Result<()> {
    let api = driver_api()?;
    // SAFETY: stream is a valid CUDA stream handle (or null for the default
    // stream).
    check_cu(
        unsafe { (api.cu_stream_synchronize)(stream) },
        "cuStreamSynchronize",
    )
}

// ─── Imported mapping ────────────────────────────────────────────────────

/// A Vulkan allocation imported into CUDA: the external-memory registration
/// plus the mapped device pointer. Released explicitly (or on drop as a
/// safety net).
pub struct ImportedFrameMemory {
    external: CUexternalMemory,
    pub device_ptr: CUdeviceptr,
    pub size: u64,
}

// SAFETY: CUDA driver handles have no thread affinity.
unsafe impl Send for ImportedFrameMemory {}

impl ImportedFrameMemory {
    /// Release the mapped buffer and the external-memory registration.
    /// Idempotent.
    pub fn release(&mut self) {
        let Ok(api) = driver_api() else { return };
        if self.device_ptr != 0 {
            // SAFETY: device_ptr came from cuExternalMemoryGetMappedBuffer.
            unsafe {
                (api.cu_mem_free)(self.device_ptr);
            }
            self.device_ptr = 0;
        }
        if !self.external.is_null() {
            // SAFETY: external came from cuImportExternalMemory.
            unsafe {
                (api.cu_destroy_external_memory)(self.external);
            }
            self.external = std::ptr::null_mut();
        }
    }
}

impl Drop for ImportedFrameMemory {
    fn drop(&mut self) {
        self.release();
    }
}

// ─── Importer + cache ────────────────────────────────────────────────────

/// Abstracts the import call so the cache is testable without a driver
pub trait ExternalMemoryImporter: Send {
    type Mapping: Send;

    fn import(&mut self, export: &FrameExport) -> Result<Self::Mapping>;
}

/// The production importer backed by the CUDA driver API
#[derive(Default)]
pub struct CudaExternalMemoryImporter;

impl ExternalMemoryImporter for CudaExternalMemoryImporter {
    type Mapping = ImportedFrameMemory;

    fn import(&mut self, export: &FrameExport) -> Result<ImportedFrameMemory> {
        let api = driver_api()?;
        ensure_context()?;

        // SAFETY: zeroed is a valid all-zero bit pattern for this C union.
        let mut handle: CudaExternalMemoryHandle = unsafe { std::mem::zeroed() };
        handle.fd = export.fd;
        let desc = CudaExternalMemoryHandleDesc {
            ty: CU_EXTERNAL_MEMORY_HANDLE_TYPE_OPAQUE_FD,
            handle,
            size: export.size,
            flags: 0,
            reserved: [0; 16],
        };

        let mut external: CUexternalMemory = std::ptr::null_mut();
        // SAFETY: desc is a fully initialized ABI struct; out-param valid.
        check_cu(
            unsafe { (api.cu_import_external_memory)(&mut external, &desc) },
            "cuImportExternalMemory",
        )?;

        let buffer_desc = CudaExternalMemoryBufferDesc {
            offset: 0,
            size: export.size,
            flags: 0,
            reserved: [0; 16],
        };
        let mut device_ptr: CUdeviceptr = 0;
        // SAFETY: external is a live registration from the call above.
        let rc = unsafe {
            (api.cu_external_memory_get_mapped_buffer)(&mut device_ptr, external, &buffer_desc)
        };
        if rc != CUDA_SUCCESS {
            // SAFETY: external is live and not yet owned by a mapping.
            unsafe {
                (api.cu_destroy_external_memory)(external);
            }
            return Err(anyhow!(
                "cuExternalMemoryGetMappedBuffer failed with CUDA error code {rc}"
            ));
        }

        debug!(
            "imported fd {} as CUDA buffer 0x{:x} ({} bytes)",
            export.fd, device_ptr, export.size
        );
        Ok(ImportedFrameMemory {
            external,
            device_ptr,
            size: export.size,
        })
    }
}

/// Identity-keyed cache of one imported mapping.
///
/// Keyed by `(fd, size)` of the export: as long as the render target's
/// exported allocation is unchanged, every tick hits the cache. When the
/// exporting side re-exports (render-target recreation on resize), the key
/// changes, the stale mapping is released, and a fresh import happens.
pub struct ImportCache<I: ExternalMemoryImporter> {
    importer: I,
    entry: Option<(RawFd, u64, I::Mapping)>,
    hits: u64,
    misses: u64,
}

impl<I: ExternalMemoryImporter> ImportCache<I> {
    pub fn new(importer: I) -> Self {
        Self {
            importer,
            entry: None,
            hits: 0,
            misses: 0,
        }
    }

    /// The mapping for this export, importing only when the identity changed
    pub fn get_or_import(&mut self, export: &FrameExport) -> Result<&I::Mapping> {
        let cached = self
            .entry
            .as_ref()
            .is_some_and(|(fd, size, _)| *fd == export.fd && *size == export.size);

        if cached {
            self.hits += 1;
        } else {
            let mapping = self.importer.import(export)?;
            // Replacing the entry drops (and thereby releases) the stale
            // mapping.
            self.entry = Some((export.fd, export.size, mapping));
            self.misses += 1;
        }

        match &self.entry {
            Some((_, _, mapping)) => Ok(mapping),
            None => Err(anyhow!("import cache entry vanished")),
        }
    }

    /// Drop the cached mapping (releases driver resources)
    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_abi_struct_layouts() {
        // Locked to the CUDA driver ABI on 64-bit.
        assert_eq!(size_of::<CudaExternalMemoryHandle>(), 16);
        assert_eq!(size_of::<CudaExternalMemoryHandleDesc>(), 104);
        assert_eq!(size_of::<CudaExternalMemoryBufferDesc>(), 88);
    }

    /// Counts imports and releases without touching a driver
    struct FakeImporter {
        imports: u64,
        releases: Arc<AtomicU64>,
    }

    struct FakeMapping {
        releases: Arc<AtomicU64>,
    }

    impl Drop for FakeMapping {
        fn drop(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ExternalMemoryImporter for FakeImporter {
        type Mapping = FakeMapping;

        fn import(&mut self, _export: &FrameExport) -> Result<FakeMapping> {
            self.imports += 1;
            Ok(FakeMapping {
                releases: self.releases.clone(),
            })
        }
    }

    fn cache() -> (ImportCache<FakeImporter>, Arc<AtomicU64>) {
        let releases = Arc::new(AtomicU64::new(0));
        (
            ImportCache::new(FakeImporter {
                imports: 0,
                releases: releases.clone(),
            }),
            releases,
        )
    }

    #[test]
    fn test_cache_hits_on_unchanged_identity() {
        let (mut cache, _releases) = cache();
        let export = FrameExport { fd: 7, size: 1024 };

        for _ in 0..5 {
            cache.get_or_import(&export).unwrap();
        }
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 4);
    }

    #[test]
    fn test_cache_reimports_and_releases_on_identity_change() {
        let (mut cache, releases) = cache();

        cache.get_or_import(&FrameExport { fd: 7, size: 1024 }).unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 0);

        // New fd: stale mapping must be released, fresh one imported.
        cache.get_or_import(&FrameExport { fd: 9, size: 1024 }).unwrap();
        assert_eq!(cache.misses(), 2);
        assert_eq!(releases.load(Ordering::SeqCst), 1);

        // Same fd but resized allocation also misses.
        cache.get_or_import(&FrameExport { fd: 9, size: 4096 }).unwrap();
        assert_eq!(cache.misses(), 3);
        assert_eq!(releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_invalidate_releases_mapping() {
        let (mut cache, releases) = cache();
        cache.get_or_import(&FrameExport { fd: 3, size: 64 }).unwrap();

        cache.invalidate();
        assert_eq!(releases.load(Ordering::SeqCst), 1);

        cache.get_or_import(&FrameExport { fd: 3, size: 64 }).unwrap();
        assert_eq!(cache.misses(), 2);
    }
}
