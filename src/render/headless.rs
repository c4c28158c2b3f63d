//! Headless Render Engine
//!
//! A CPU render engine for running the studio without a GPU or display:
//! draws an animated test pattern (or composites a capture source) into a
//! shared frame buffer and serves it as the tick's output frame.
//!
//! Doubles as the reference implementation of the `RenderEngine` contract:
//! `begin_frame` refuses re-entry, the output view carries the monotonic
//! timestamp captured at `begin_frame`, and `blit_to_external` copies the
//! final content into a CPU presentation target.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::media::GpuFrameView;
use crate::pipeline::{FrameSource, PresentationTarget, RenderConfig, RenderEngine};
use crate::utils::timestamp_ns;

/// SMPTE-style bar colors used for the default test pattern
const BAR_COLORS: [[u8; 3]; 7] = [
    [180, 180, 180], // gray
    [180, 180, 16],  // yellow
    [16, 180, 180],  // cyan
    [16, 180, 16],   // green
    [180, 16, 180],  // magenta
    [180, 16, 16],   // red
    [16, 16, 180],   // blue
];

pub struct HeadlessRenderEngine {
    config: RenderConfig,
    initialized: bool,
    in_frame: bool,
    output: Arc<RwLock<Vec<u8>>>,
    /// Optional capture source composited instead of the test pattern
    source: Option<Box<dyn FrameSource>>,
    frame_index: u64,
    /// Timestamp captured at `begin_frame`, served by `output_frame`
    frame_timestamp_ns: u64,
}

impl HeadlessRenderEngine {
    pub fn new() -> Self {
        Self {
            config: RenderConfig::default(),
            initialized: false,
            in_frame: false,
            output: Arc::new(RwLock::new(Vec::new())),
            source: None,
            frame_index: 0,
            frame_timestamp_ns: 0,
        }
    }

    /// Composite frames from a capture source instead of the test pattern.
    /// The source must already be initialized and started.
    pub fn set_source(&mut self, source: Option<Box<dyn FrameSource>>) {
        self.source = source;
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    fn draw_test_pattern(&mut self) {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let mut pixels = self.output.write();

        // Vertical bars with a scrolling offset so consecutive frames
        // differ.
        let shift = (self.frame_index as usize * 4) % width.max(1);
        for y in 0..height {
            let row = y * width * 4;
            for x in 0..width {
                let bar = ((x + shift) * BAR_COLORS.len() / width.max(1)) % BAR_COLORS.len();
                let [r, g, b] = BAR_COLORS[bar];
                let p = row + x * 4;
                pixels[p] = r;
                pixels[p + 1] = g;
                pixels[p + 2] = b;
                pixels[p + 3] = 255;
            }
        }
    }

    fn composite_source(&mut self) -> bool {
        let Some(source) = self.source.as_mut() else {
            return false;
        };
        let Some(frame) = source.acquire_frame() else {
            return false;
        };

        let mut drawn = false;
        if frame.width == self.config.width && frame.height == self.config.height {
            if let Some(pixels) = frame.cpu_memory() {
                let src = pixels.read();
                let mut dst = self.output.write();
                let len = dst.len().min(src.len());
                dst[..len].copy_from_slice(&src[..len]);
                drawn = true;
            }
        } else {
            debug!(
                "source frame {}x{} does not match engine {}x{}, skipping composite",
                frame.width, frame.height, self.config.width, self.config.height
            );
        }
        source.release_frame(frame);
        drawn
    }
}

impl Default for HeadlessRenderEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderEngine for HeadlessRenderEngine {
    fn initialize(&mut self, config: &RenderConfig) -> Result<()> {
        if config.width == 0 || config.height == 0 {
            bail!(
                "invalid render target size {}x{}",
                config.width,
                config.height
            );
        }
        self.config = config.clone();
        *self.output.write() = vec![0u8; (config.width * config.height * 4) as usize];
        self.initialized = true;
        self.in_frame = false;
        self.frame_index = 0;
        info!(
            "headless render engine ready at {}x{}",
            config.width, config.height
        );
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(source) = self.source.as_mut() {
            source.shutdown();
        }
        self.initialized = false;
        self.in_frame = false;
    }

    fn begin_frame(&mut self) -> bool {
        if !self.initialized || self.in_frame {
            // Refusing is the backpressure path, not an error.
            return false;
        }
        self.in_frame = true;
        self.frame_timestamp_ns = timestamp_ns();
        true
    }

    fn draw_scene(&mut self) {
        if !self.in_frame {
            return;
        }
        if !self.composite_source() {
            self.draw_test_pattern();
        }
    }

    fn output_frame(&mut self) -> GpuFrameView {
        self.in_frame = false;
        self.frame_index += 1;
        GpuFrameView::from_cpu_pixels(
            self.output.clone(),
            self.config.width,
            self.config.height,
            self.frame_timestamp_ns,
        )
    }

    fn blit_to_external(
        &mut self,
        target: &mut PresentationTarget,
        width: u32,
        height: u32,
    ) -> Result<()> {
        match target {
            PresentationTarget::CpuBuffer(buffer) => {
                // Nearest-neighbour scale from the engine output into the
                // target.
                let src = self.output.read();
                let src_w = self.config.width as usize;
                let src_h = self.config.height as usize;
                let dst_w = width as usize;
                let dst_h = height as usize;
                if src_w == 0 || src_h == 0 {
                    bail!("engine has no output to blit");
                }

                let mut dst = buffer.write();
                dst.resize(dst_w * dst_h * 4, 0);
                for y in 0..dst_h {
                    let sy = (y * src_h / dst_h.max(1)).min(src_h - 1);
                    for x in 0..dst_w {
                        let sx = (x * src_w / dst_w.max(1)).min(src_w - 1);
                        let s = (sy * src_w + sx) * 4;
                        let d = (y * dst_w + x) * 4;
                        if s + 4 <= src.len() {
                            dst[d..d + 4].copy_from_slice(&src[s..s + 4]);
                        }
                    }
                }
                Ok(())
            }
            PresentationTarget::VulkanImage { image } => {
                warn!("headless engine cannot blit to Vulkan image {image:#x}");
                Err(anyhow!("headless engine has no Vulkan presentation path"))
            }
        }
    }
}
