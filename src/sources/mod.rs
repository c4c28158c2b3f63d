//! Capture Sources
//!
//! Concrete `FrameSource` implementations. Camera, browser and screen-share
//! adapters are thin wrappers supplied by the embedding application; the
//! in-repo test-pattern source exercises the capability contract and feeds
//! the headless engine.

use std::sync::Arc;

use anyhow::{bail, Result};
use log::debug;
use parking_lot::RwLock;

use crate::media::GpuFrameView;
use crate::pipeline::{FrameSource, SourceConfig};
use crate::utils::timestamp_ns;

/// Animated gradient source for development and tests
pub struct TestPatternSource {
    config: Option<SourceConfig>,
    running: bool,
    pixels: Arc<RwLock<Vec<u8>>>,
    frames_produced: u64,
}

impl TestPatternSource {
    pub fn new() -> Self {
        Self {
            config: None,
            running: false,
            pixels: Arc::new(RwLock::new(Vec::new())),
            frames_produced: 0,
        }
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames_produced
    }

    fn draw(&mut self) {
        let Some(config) = &self.config else { return };
        let width = config.width as usize;
        let height = config.height as usize;
        let phase = self.frames_produced as usize;

        let mut pixels = self.pixels.write();
        for y in 0..height {
            for x in 0..width {
                let p = (y * width + x) * 4;
                pixels[p] = ((x + phase) * 255 / width.max(1)) as u8;
                pixels[p + 1] = (y * 255 / height.max(1)) as u8;
                pixels[p + 2] = ((phase * 3) % 256) as u8;
                pixels[p + 3] = 255;
            }
        }
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for TestPatternSource {
    fn initialize(&mut self, config: &SourceConfig) -> Result<()> {
        if config.width == 0 || config.height == 0 {
            bail!("invalid source size {}x{}", config.width, config.height);
        }
        *self.pixels.write() = vec![0u8; (config.width * config.height * 4) as usize];
        self.config = Some(config.clone());
        self.running = false;
        self.frames_produced = 0;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.config.is_none() {
            bail!("source not initialized");
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn acquire_frame(&mut self) -> Option<GpuFrameView> {
        if !self.running {
            return None;
        }
        self.draw();
        self.frames_produced += 1;
        let config = self.config.as_ref()?;
        Some(GpuFrameView::from_cpu_pixels(
            self.pixels.clone(),
            config.width,
            config.height,
            timestamp_ns(),
        ))
    }

    fn release_frame(&mut self, _frame: GpuFrameView) {
        // The shared buffer is reused for the next frame; nothing to free.
    }

    fn shutdown(&mut self) {
        if self.running {
            debug!(
                "test pattern source stopped after {} frames",
                self.frames_produced
            );
        }
        self.running = false;
        self.config = None;
    }
}
