//! Vulkan External-Memory Export
//!
//! Export side of the zero-copy path: given the device memory backing a
//! rendered image, obtain an OS-level shareable handle (a POSIX fd on Linux)
//! that the CUDA side can import.
//!
//! Ownership rule: the exported fd is consumed by the importer. The exporter
//! must not reuse the same fd for a second import without re-exporting,
//! because some driver stacks consume the underlying primitive on import.

use anyhow::{anyhow, bail, Result};
use ash::vk;
use ash::vk::Handle;
use log::debug;

use crate::media::{FrameExport, GpuHandles};

/// Device extensions a render engine must enable for `VulkanFrameExporter`
/// to work. `VK_KHR_external_memory` itself is core since Vulkan 1.1.
pub fn required_device_extensions() -> &'static [&'static std::ffi::CStr] {
    &[
        ash::khr::external_memory_fd::NAME,
        ash::ext::external_memory_dma_buf::NAME,
    ]
}

/// Chain into `vk::ImageCreateInfo` when creating an image whose memory will
/// be exported
pub fn exportable_image_info() -> vk::ExternalMemoryImageCreateInfo<'static> {
    vk::ExternalMemoryImageCreateInfo::default()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD)
}

/// Chain into `vk::MemoryAllocateInfo` when allocating exportable memory
pub fn exportable_allocate_info() -> vk::ExportMemoryAllocateInfo<'static> {
    vk::ExportMemoryAllocateInfo::default()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD)
}

/// Wraps `VK_KHR_external_memory_fd` for a device
pub struct VulkanFrameExporter {
    fns: ash::khr::external_memory_fd::Device,
}

impl VulkanFrameExporter {
    pub fn new(instance: &ash::Instance, device: &ash::Device) -> Self {
        Self {
            fns: ash::khr::external_memory_fd::Device::new(instance, device),
        }
    }

    /// Export the given device memory as an opaque fd.
    ///
    /// Each call produces a fresh fd whose ownership transfers to the
    /// eventual importer.
    pub fn export_opaque_fd(&self, memory: vk::DeviceMemory, size: u64) -> Result<FrameExport> {
        let info = vk::MemoryGetFdInfoKHR::default()
            .memory(memory)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);

        let fd = unsafe { self.fns.get_memory_fd(&info) }
            .map_err(|e| anyhow!("vkGetMemoryFdKHR failed: {e}"))?;
        if fd < 0 {
            bail!("vkGetMemoryFdKHR returned invalid fd {fd}");
        }

        debug!("exported device memory {memory:?} as fd {fd} ({size} bytes)");
        Ok(FrameExport { fd, size })
    }

    /// Export a frame's backing memory given its opaque handle pair
    pub fn export_frame(&self, handles: GpuHandles, size: u64) -> Result<FrameExport> {
        self.export_opaque_fd(vk::DeviceMemory::from_raw(handles.memory), size)
    }
}
