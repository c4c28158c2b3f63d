//! Frame Router
//!
//! Drives exactly one frame per tick through the fixed pipeline order:
//! render -> stitch -> super-resolution -> fan-out to encoders and virtual
//! cameras -> presentation blit. Every registered sink observes the same
//! frame content for a given tick.
//!
//! The router is single-threaded and synchronous: `process_frame` runs the
//! whole tick to completion before returning, and `&mut self` on the
//! mutators makes registration changes concurrent with an in-flight tick
//! unrepresentable.

use log::{debug, warn};

use super::{
    PresentationTarget, SharedEncoder, SharedRenderEngine, SharedStitcher, SharedSuperRes,
    SharedVirtualCam, StitchConfig, SuperResConfig,
};

/// Outcome of one `process_frame` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The frame reached every registered sink that accepted it
    Completed,
    /// `begin_frame` refused - the tick was dropped, nothing ran
    Dropped,
}

/// Diagnostics-only bookkeeping. Per-stage failures are advisory degraded
/// operation, so they are counted here instead of propagated.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStats {
    pub ticks: u64,
    pub frames_dropped: u64,
    pub stitch_failures: u64,
    pub superres_failures: u64,
    pub encode_failures: u64,
    pub vcam_failures: u64,
    pub blit_failures: u64,
}

/// Orchestrates the per-tick pipeline.
///
/// Holds shared handles to one render engine (required), zero-or-one
/// stitcher, zero-or-one super-resolution stage, and ordered fan-out
/// collections of encoders and virtual cameras. The router never owns the
/// GPU resources behind its stages; dropping it leaves every adapter alive.
pub struct FrameRouter {
    engine: SharedRenderEngine,
    stitcher: Option<SharedStitcher>,
    stitch_config: StitchConfig,
    superres: Option<SharedSuperRes>,
    superres_config: SuperResConfig,
    encoders: Vec<SharedEncoder>,
    virtual_cams: Vec<SharedVirtualCam>,
    stats: RouterStats,
}

impl FrameRouter {
    /// A render engine is required; there is no routing without one.
    pub fn new(engine: SharedRenderEngine) -> Self {
        Self {
            engine,
            stitcher: None,
            stitch_config: StitchConfig::default(),
            superres: None,
            superres_config: SuperResConfig::default(),
            encoders: Vec::new(),
            virtual_cams: Vec::new(),
            stats: RouterStats::default(),
        }
    }

    /// Replace the optional stitch stage; `None` disables it for subsequent
    /// ticks
    pub fn set_stitcher(&mut self, stage: Option<(SharedStitcher, StitchConfig)>) {
        match stage {
            Some((stitcher, config)) => {
                self.stitcher = Some(stitcher);
                self.stitch_config = config;
            }
            None => self.stitcher = None,
        }
    }

    /// Replace the optional super-resolution stage; `None` disables it for
    /// subsequent ticks
    pub fn set_superres(&mut self, stage: Option<(SharedSuperRes, SuperResConfig)>) {
        match stage {
            Some((adapter, config)) => {
                self.superres = Some(adapter);
                self.superres_config = config;
            }
            None => self.superres = None,
        }
    }

    /// Register an encoder. Fan-out order is registration order, but sinks
    /// are independent and order never affects correctness.
    pub fn add_encoder(&mut self, encoder: SharedEncoder) {
        self.encoders.push(encoder);
    }

    /// Remove an encoder by handle identity. Returns whether it was
    /// registered.
    pub fn remove_encoder(&mut self, encoder: &SharedEncoder) -> bool {
        let before = self.encoders.len();
        self.encoders.retain(|e| !std::sync::Arc::ptr_eq(e, encoder));
        self.encoders.len() != before
    }

    pub fn add_virtual_cam(&mut self, cam: SharedVirtualCam) {
        self.virtual_cams.push(cam);
    }

    pub fn remove_virtual_cam(&mut self, cam: &SharedVirtualCam) -> bool {
        let before = self.virtual_cams.len();
        self.virtual_cams
            .retain(|c| !std::sync::Arc::ptr_eq(c, cam));
        self.virtual_cams.len() != before
    }

    pub fn encoder_count(&self) -> usize {
        self.encoders.len()
    }

    pub fn virtual_cam_count(&self) -> usize {
        self.virtual_cams.len()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Drive one frame through the pipeline.
    ///
    /// Per-stage failures are logged and skipped; the only whole-tick abort
    /// is a `begin_frame` refusal (the engine's backpressure signal). When a
    /// presentation target is supplied, the final frame is blitted to it at
    /// the post-transform dimensions.
    pub fn process_frame(&mut self, presentation: Option<&mut PresentationTarget>) -> TickOutcome {
        self.stats.ticks += 1;

        let mut frame = {
            let mut engine = self.engine.lock();
            if !engine.begin_frame() {
                // Backpressure: if the GPU can't keep up, frames are
                // dropped, never queued.
                self.stats.frames_dropped += 1;
                debug!("begin_frame refused, dropping tick {}", self.stats.ticks);
                return TickOutcome::Dropped;
            }
            engine.draw_scene();
            engine.output_frame()
        };

        if let Some(stitcher) = &self.stitcher {
            if let Err(e) = stitcher.lock().process(&mut frame, &self.stitch_config) {
                self.stats.stitch_failures += 1;
                warn!("stitcher failed, frame passes through unstitched: {e:#}");
            }
        }

        if let Some(superres) = &self.superres {
            // May change frame dimensions; everything below uses the
            // updated view.
            if let Err(e) = superres.lock().process(&mut frame, &self.superres_config) {
                self.stats.superres_failures += 1;
                warn!("super-resolution failed, frame passes through at native size: {e:#}");
            }
        }

        for (index, encoder) in self.encoders.iter().enumerate() {
            if let Err(e) = encoder.lock().encode_frame(&frame) {
                self.stats.encode_failures += 1;
                warn!("encoder {index} rejected frame: {e:#}");
            }
        }

        for (index, cam) in self.virtual_cams.iter().enumerate() {
            if let Err(e) = cam.lock().send_frame(&frame) {
                self.stats.vcam_failures += 1;
                warn!("virtual cam {index} rejected frame: {e:#}");
            }
        }

        if let Some(target) = presentation {
            let (width, height) = (frame.width, frame.height);
            drop(frame);
            if let Err(e) = self.engine.lock().blit_to_external(target, width, height) {
                self.stats.blit_failures += 1;
                warn!("presentation blit failed: {e:#}");
            }
        }

        TickOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::{anyhow, Result};
    use parking_lot::{Mutex, RwLock};

    use super::*;
    use crate::media::{FrameMemory, GpuFrameView, PixelFormat};
    use crate::pipeline::{
        EncoderAdapter, EncoderConfig, RenderConfig, RenderEngine, ScaleFactor, Stitcher,
        SuperResAdapter, VirtualCamConfig, VirtualCamOutput,
    };

    struct MockEngine {
        width: u32,
        height: u32,
        timestamp_ns: u64,
        refuse_begin: bool,
        draw_calls: u64,
        blits: Vec<(u32, u32)>,
    }

    impl MockEngine {
        fn new(width: u32, height: u32, timestamp_ns: u64) -> Self {
            Self {
                width,
                height,
                timestamp_ns,
                refuse_begin: false,
                draw_calls: 0,
                blits: Vec::new(),
            }
        }
    }

    impl RenderEngine for MockEngine {
        fn initialize(&mut self, _config: &RenderConfig) -> Result<()> {
            Ok(())
        }

        fn shutdown(&mut self) {}

        fn begin_frame(&mut self) -> bool {
            !self.refuse_begin
        }

        fn draw_scene(&mut self) {
            self.draw_calls += 1;
        }

        fn output_frame(&mut self) -> GpuFrameView {
            let pixels = Arc::new(RwLock::new(vec![
                0u8;
                (self.width * self.height * 4) as usize
            ]));
            GpuFrameView::from_cpu_pixels(pixels, self.width, self.height, self.timestamp_ns)
        }

        fn blit_to_external(
            &mut self,
            _target: &mut PresentationTarget,
            width: u32,
            height: u32,
        ) -> Result<()> {
            self.blits.push((width, height));
            Ok(())
        }
    }

    /// Records every frame it observes; optionally fails each call.
    struct MockEncoder {
        observed: Vec<(u32, u32, u64)>,
        fail: bool,
    }

    impl MockEncoder {
        fn new() -> Self {
            Self {
                observed: Vec::new(),
                fail: false,
            }
        }
    }

    impl EncoderAdapter for MockEncoder {
        fn initialize(&mut self, _config: &EncoderConfig) -> Result<()> {
            Ok(())
        }

        fn encode_frame(&mut self, frame: &GpuFrameView) -> Result<()> {
            if self.fail {
                return Err(anyhow!("deliberate encode failure"));
            }
            self.observed
                .push((frame.width, frame.height, frame.timestamp_ns));
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn shutdown(&mut self) {}
    }

    struct MockVirtualCam {
        observed: Vec<(u32, u32, u64)>,
    }

    impl MockVirtualCam {
        fn new() -> Self {
            Self {
                observed: Vec::new(),
            }
        }
    }

    impl VirtualCamOutput for MockVirtualCam {
        fn initialize(&mut self, _config: &VirtualCamConfig) -> Result<()> {
            Ok(())
        }

        fn send_frame(&mut self, frame: &GpuFrameView) -> Result<()> {
            self.observed
                .push((frame.width, frame.height, frame.timestamp_ns));
            Ok(())
        }

        fn shutdown(&mut self) {}
    }

    /// Marks the first pixel so downstream observers can prove ordering
    struct MockStitcher {
        calls: u64,
    }

    impl Stitcher for MockStitcher {
        fn initialize(&mut self, _width: u32, _height: u32) -> Result<()> {
            Ok(())
        }

        fn process(&mut self, frame: &mut GpuFrameView, config: &StitchConfig) -> Result<()> {
            if !config.enable {
                return Ok(());
            }
            self.calls += 1;
            if let FrameMemory::Cpu(buf) = &frame.memory {
                buf.write()[0] = 0xEE;
            }
            Ok(())
        }

        fn shutdown(&mut self) {}
    }

    /// Doubles the frame dimensions, as a real upscaler would
    struct MockSuperRes;

    impl SuperResAdapter for MockSuperRes {
        fn initialize(&mut self, _width: u32, _height: u32) -> Result<()> {
            Ok(())
        }

        fn process(&mut self, frame: &mut GpuFrameView, config: &SuperResConfig) -> Result<()> {
            let width = config.scale.apply(frame.width);
            let height = config.scale.apply(frame.height);
            let pixels = Arc::new(RwLock::new(vec![0u8; (width * height * 4) as usize]));
            frame.memory = FrameMemory::Cpu(pixels);
            frame.export = None;
            frame.format = PixelFormat::Rgba8;
            frame.width = width;
            frame.height = height;
            frame.stride = width * 4;
            Ok(())
        }

        fn shutdown(&mut self) {}
    }

    fn engine(width: u32, height: u32, ts: u64) -> Arc<Mutex<MockEngine>> {
        Arc::new(Mutex::new(MockEngine::new(width, height, ts)))
    }

    #[test]
    fn test_fan_out_identity() {
        // 3 encoders + 2 virtual cams all observe the same frame metadata
        let eng = engine(100, 100, 123_456_789);
        let mut router = FrameRouter::new(eng.clone());

        let encoders: Vec<_> = (0..3)
            .map(|_| Arc::new(Mutex::new(MockEncoder::new())))
            .collect();
        let cams: Vec<_> = (0..2)
            .map(|_| Arc::new(Mutex::new(MockVirtualCam::new())))
            .collect();
        for e in &encoders {
            router.add_encoder(e.clone() as SharedEncoder);
        }
        for c in &cams {
            router.add_virtual_cam(c.clone() as SharedVirtualCam);
        }

        assert_eq!(router.process_frame(None), TickOutcome::Completed);

        for e in &encoders {
            assert_eq!(e.lock().observed, vec![(100, 100, 123_456_789)]);
        }
        for c in &cams {
            assert_eq!(c.lock().observed, vec![(100, 100, 123_456_789)]);
        }
    }

    #[test]
    fn test_sinks_receive_post_superres_dimensions() {
        let eng = engine(960, 480, 7);
        let mut router = FrameRouter::new(eng);

        let stitcher = Arc::new(Mutex::new(MockStitcher { calls: 0 }));
        router.set_stitcher(Some((
            stitcher.clone() as SharedStitcher,
            StitchConfig {
                calibration_map: None,
                enable: true,
            },
        )));
        router.set_superres(Some((
            Arc::new(Mutex::new(MockSuperRes)) as SharedSuperRes,
            SuperResConfig {
                scale: ScaleFactor::X2,
                ..SuperResConfig::default()
            },
        )));

        let encoder = Arc::new(Mutex::new(MockEncoder::new()));
        let cam = Arc::new(Mutex::new(MockVirtualCam::new()));
        router.add_encoder(encoder.clone() as SharedEncoder);
        router.add_virtual_cam(cam.clone() as SharedVirtualCam);

        router.process_frame(None);

        // Stitch ran (on pre-upscale input), and every sink saw the
        // post-super-res dimensions with the timestamp untouched.
        assert_eq!(stitcher.lock().calls, 1);
        assert_eq!(encoder.lock().observed, vec![(1920, 960, 7)]);
        assert_eq!(cam.lock().observed, vec![(1920, 960, 7)]);
    }

    #[test]
    fn test_one_failing_encoder_does_not_block_others() {
        let eng = engine(64, 64, 1);
        let mut router = FrameRouter::new(eng);

        let bad = Arc::new(Mutex::new(MockEncoder::new()));
        bad.lock().fail = true;
        let good_a = Arc::new(Mutex::new(MockEncoder::new()));
        let good_b = Arc::new(Mutex::new(MockEncoder::new()));
        let cam = Arc::new(Mutex::new(MockVirtualCam::new()));

        router.add_encoder(good_a.clone() as SharedEncoder);
        router.add_encoder(bad.clone() as SharedEncoder);
        router.add_encoder(good_b.clone() as SharedEncoder);
        router.add_virtual_cam(cam.clone() as SharedVirtualCam);

        assert_eq!(router.process_frame(None), TickOutcome::Completed);

        assert_eq!(good_a.lock().observed.len(), 1);
        assert_eq!(good_b.lock().observed.len(), 1);
        assert_eq!(cam.lock().observed.len(), 1);
        assert_eq!(router.stats().encode_failures, 1);
    }

    #[test]
    fn test_begin_frame_refusal_aborts_tick() {
        let eng = engine(64, 64, 1);
        eng.lock().refuse_begin = true;
        let mut router = FrameRouter::new(eng.clone());

        let encoder = Arc::new(Mutex::new(MockEncoder::new()));
        let cam = Arc::new(Mutex::new(MockVirtualCam::new()));
        router.add_encoder(encoder.clone() as SharedEncoder);
        router.add_virtual_cam(cam.clone() as SharedVirtualCam);

        let mut target = PresentationTarget::VulkanImage { image: 0xBEEF };
        assert_eq!(
            router.process_frame(Some(&mut target)),
            TickOutcome::Dropped
        );

        // Nothing downstream ran: no draw, no sinks, no blit.
        assert_eq!(eng.lock().draw_calls, 0);
        assert!(encoder.lock().observed.is_empty());
        assert!(cam.lock().observed.is_empty());
        assert!(eng.lock().blits.is_empty());
        assert_eq!(router.stats().frames_dropped, 1);
    }

    #[test]
    fn test_presentation_blit_uses_final_dimensions() {
        let eng = engine(100, 50, 9);
        let mut router = FrameRouter::new(eng.clone());
        router.set_superres(Some((
            Arc::new(Mutex::new(MockSuperRes)) as SharedSuperRes,
            SuperResConfig {
                scale: ScaleFactor::X3,
                ..SuperResConfig::default()
            },
        )));

        let mut target = PresentationTarget::VulkanImage { image: 1 };
        router.process_frame(Some(&mut target));

        assert_eq!(eng.lock().blits, vec![(300, 150)]);
    }

    #[test]
    fn test_remove_by_identity() {
        let eng = engine(8, 8, 0);
        let mut router = FrameRouter::new(eng);

        let a = Arc::new(Mutex::new(MockEncoder::new())) as SharedEncoder;
        let b = Arc::new(Mutex::new(MockEncoder::new())) as SharedEncoder;
        router.add_encoder(a.clone());
        router.add_encoder(b.clone());
        assert_eq!(router.encoder_count(), 2);

        assert!(router.remove_encoder(&a));
        assert!(!router.remove_encoder(&a));
        assert_eq!(router.encoder_count(), 1);

        let cam = Arc::new(Mutex::new(MockVirtualCam::new())) as SharedVirtualCam;
        router.add_virtual_cam(cam.clone());
        assert!(router.remove_virtual_cam(&cam));
        assert_eq!(router.virtual_cam_count(), 0);
    }

    #[test]
    fn test_disabled_stitcher_leaves_frame_untouched() {
        let eng = engine(8, 8, 0);
        let mut router = FrameRouter::new(eng);
        let stitcher = Arc::new(Mutex::new(MockStitcher { calls: 0 }));
        router.set_stitcher(Some((
            stitcher.clone() as SharedStitcher,
            StitchConfig::default(), // enable defaults to false
        )));

        router.process_frame(None);
        assert_eq!(stitcher.lock().calls, 0);
    }
}
