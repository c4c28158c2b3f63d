//! Zero-Copy GPU Interop
//!
//! Sharing GPU memory between the Vulkan render side and the CUDA effect
//! side without a CPU round-trip: Vulkan exports an allocation as a POSIX fd
//! (`vulkan`), CUDA imports that fd as external memory (`cuda`). Imports are
//! cached by export identity because a fresh import per frame is
//! correctness-safe but far too expensive.

pub mod cuda;
pub mod vulkan;

pub use cuda::{CudaExternalMemoryImporter, ExternalMemoryImporter, ImportCache, ImportedFrameMemory};
pub use vulkan::VulkanFrameExporter;
