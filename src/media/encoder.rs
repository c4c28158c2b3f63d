//! Video Encoder
//!
//! Hardware-accelerated H.264/H.265/AV1 encoding using FFmpeg.
//!
//! Encoder resolution tries hardware variants in strict priority order
//! (NVENC, then VA-API, then Intel QuickSync) before falling back to the
//! software encoder, mirroring what works best on typical streaming rigs.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context as _, Result};
use log::{debug, info, warn};

use crate::media::{FrameError, GpuFrameView, PixelFormat};
use crate::pipeline::{EncoderAdapter, EncoderConfig};

extern crate ffmpeg_next as ffmpeg;

use ffmpeg::codec::context::Context as CodecContext;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{context::Context as ScalerContext, flag::Flags as ScalerFlags};
use ffmpeg::util::frame::video::Video as FfmpegFrame;
use ffmpeg::util::rational::Rational;

// ─── Codec resolution policy ─────────────────────────────────────────────

/// The software fallback for a codec family
pub fn software_fallback(codec: &str) -> String {
    match codec {
        "h264" => "libx264".to_string(),
        "h265" | "hevc" => "libx265".to_string(),
        "av1" => "libaom-av1".to_string(),
        other => other.to_string(),
    }
}

/// Candidate encoder names for a requested codec, in strict priority order:
/// NVENC first, then VA-API, then QuickSync, then the software fallback.
/// Hardware variants are only attempted when `hardware` is set.
pub fn encoder_candidates(codec: &str, hardware: bool) -> Vec<String> {
    // FFmpeg names its HEVC hardware encoders by the codec's formal name.
    let family = match codec {
        "h265" => "hevc",
        other => other,
    };

    let mut names = Vec::new();
    if hardware {
        names.push(format!("{family}_nvenc"));
        names.push(format!("{family}_vaapi"));
        names.push(format!("{family}_qsv"));
    }
    names.push(software_fallback(codec));
    names
}

/// Resolve the first available candidate, probing with `available`
/// (production passes an FFmpeg `find_by_name` + open probe)
pub fn resolve_encoder_name(
    codec: &str,
    hardware: bool,
    available: impl Fn(&str) -> bool,
) -> Option<String> {
    encoder_candidates(codec, hardware)
        .into_iter()
        .find(|name| available(name))
}

// ─── Bitstream sinks ─────────────────────────────────────────────────────

/// Receives encoded bitstream output (file writer, muxer, network sender)
pub trait PacketSink: Send {
    /// Write one encoded packet. `pts` is in the encoder's time base.
    fn write_packet(&mut self, data: &[u8], pts: i64, keyframe: bool) -> Result<()>;

    /// Flush buffers and finalise the output
    fn finish(&mut self) -> Result<()>;
}

/// Raw Annex-B elementary-stream writer
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
}

impl FileSink {
    pub fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)
            .with_context(|| format!("failed to create output file {}", path.display()))?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            bytes_written: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl PacketSink for FileSink {
    fn write_packet(&mut self, data: &[u8], _pts: i64, _keyframe: bool) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("file sink already finished"))?;
        writer.write_all(data)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(
                "finished bitstream {} ({} bytes)",
                self.path.display(),
                self.bytes_written
            );
        }
        Ok(())
    }
}

// ─── Encoder adapter ─────────────────────────────────────────────────────

/// pts in time-base units (`fps_den / fps_num`) for a capture timestamp
fn pts_for(timestamp_ns: u64, fps_num: u32, fps_den: u32) -> i64 {
    (timestamp_ns as i128 * fps_num as i128 / (1_000_000_000i128 * fps_den.max(1) as i128)) as i64
}

enum EncoderState {
    Uninitialized,
    Ready(Box<OpenEncoder>),
    /// Drained via `flush`; refuses frames until re-initialized
    Flushed,
    Shutdown,
}

struct OpenEncoder {
    encoder: ffmpeg::encoder::video::Encoder,
    scaler: ScalerContext,
    config: EncoderConfig,
    resolved_name: String,
    frames_encoded: u64,
}

/// Video encoder using FFmpeg with hardware acceleration.
///
/// Owns the codec context, the RGBA to YUV420P scaler and the packet sink.
/// When `encode_frame` returns `Ok`, all frame content has been converted
/// into the encoder's own buffers; the caller's view is no longer
/// referenced.
pub struct FfmpegEncoder {
    state: EncoderState,
    sink: Box<dyn PacketSink>,
}

impl FfmpegEncoder {
    pub fn new(sink: Box<dyn PacketSink>) -> Self {
        Self {
            state: EncoderState::Uninitialized,
            sink,
        }
    }

    /// The resolved FFmpeg encoder name, once initialized
    pub fn resolved_name(&self) -> Option<&str> {
        match &self.state {
            EncoderState::Ready(open) => Some(&open.resolved_name),
            _ => None,
        }
    }

    /// Try candidates in priority order until one opens
    fn open_first_candidate(config: &EncoderConfig) -> Result<(ffmpeg::encoder::video::Encoder, String)> {
        for name in encoder_candidates(&config.codec, config.hardware_acceleration) {
            let Some(codec) = ffmpeg::encoder::find_by_name(&name) else {
                debug!("encoder {name} not present in this FFmpeg build");
                continue;
            };

            let ctx = CodecContext::new_with_codec(codec);
            let mut video = match ctx.encoder().video() {
                Ok(video) => video,
                Err(e) => {
                    debug!("encoder {name} rejected video context: {e:?}");
                    continue;
                }
            };

            video.set_width(config.width);
            video.set_height(config.height);
            video.set_format(Pixel::YUV420P);
            video.set_time_base(Rational::new(
                config.fps_den.max(1) as i32,
                config.fps_num.max(1) as i32,
            ));
            video.set_frame_rate(Some(Rational::new(
                config.fps_num.max(1) as i32,
                config.fps_den.max(1) as i32,
            )));
            video.set_bit_rate(config.bitrate_kbps as usize * 1000);

            match video.open() {
                Ok(encoder) => {
                    info!("resolved encoder {name} for codec {}", config.codec);
                    return Ok((encoder, name));
                }
                Err(e) => {
                    // Typical when the hardware backend is absent at runtime.
                    debug!("failed to open encoder {name}: {e:?}");
                }
            }
        }
        Err(anyhow!(
            "no encoder available for codec {} (hardware_acceleration={})",
            config.codec,
            config.hardware_acceleration
        ))
    }

    /// Drain pending packets from the codec into the sink
    fn drain_packets(open: &mut OpenEncoder, sink: &mut dyn PacketSink) -> Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        loop {
            match open.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    let data = packet.data().unwrap_or(&[]);
                    if !data.is_empty() {
                        sink.write_packet(data, packet.pts().unwrap_or(0), packet.is_key())?;
                    }
                }
                Err(ffmpeg::Error::Other { errno }) if errno == libc::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => return Err(anyhow!("receive_packet failed: {e:?}")),
            }
        }
        Ok(())
    }
}

impl EncoderAdapter for FfmpegEncoder {
    fn initialize(&mut self, config: &EncoderConfig) -> Result<()> {
        ffmpeg::init().map_err(|e| anyhow!("failed to initialize FFmpeg: {e:?}"))?;

        let (encoder, resolved_name) = Self::open_first_candidate(config)?;

        let scaler = ScalerContext::get(
            Pixel::RGBA,
            config.width,
            config.height,
            Pixel::YUV420P,
            config.width,
            config.height,
            ScalerFlags::BILINEAR,
        )
        .map_err(|e| anyhow!("failed to create RGBA->YUV420P scaler: {e:?}"))?;

        self.state = EncoderState::Ready(Box::new(OpenEncoder {
            encoder,
            scaler,
            config: config.clone(),
            resolved_name,
            frames_encoded: 0,
        }));
        Ok(())
    }

    fn encode_frame(&mut self, frame: &GpuFrameView) -> Result<()> {
        let open = match &mut self.state {
            EncoderState::Ready(open) => open,
            EncoderState::Uninitialized => {
                return Err(anyhow!("encoder not initialized"));
            }
            EncoderState::Flushed => {
                return Err(anyhow!("encoder flushed; re-initialize before encoding"));
            }
            EncoderState::Shutdown => {
                return Err(anyhow!("encoder shut down"));
            }
        };

        if frame.format != PixelFormat::Rgba8 {
            return Err(FrameError::UnsupportedFormat(frame.format).into());
        }
        if frame.width != open.config.width || frame.height != open.config.height {
            return Err(FrameError::DimensionMismatch {
                got_width: frame.width,
                got_height: frame.height,
                want_width: open.config.width,
                want_height: open.config.height,
            }
            .into());
        }
        let pixels = frame.cpu_memory().ok_or(FrameError::NotCpuVisible)?;

        // Copy the shared pixels into an FFmpeg frame, honouring both
        // strides.
        let mut rgba = FfmpegFrame::new(Pixel::RGBA, frame.width, frame.height);
        {
            let src = pixels.read();
            if src.len() < frame.expected_cpu_len() {
                return Err(anyhow!(
                    "frame buffer is {} bytes, expected at least {}",
                    src.len(),
                    frame.expected_cpu_len()
                ));
            }
            let dst_stride = rgba.stride(0);
            let src_stride = frame.stride as usize;
            let row_bytes = frame.width as usize * 4;
            let height = frame.height as usize;
            let dst = rgba.data_mut(0);
            for row in 0..height {
                let s = row * src_stride;
                let d = row * dst_stride;
                dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
            }
        }

        let mut yuv = FfmpegFrame::empty();
        open.scaler
            .run(&rgba, &mut yuv)
            .map_err(|e| anyhow!("RGBA->YUV420P conversion failed: {e:?}"))?;
        yuv.set_pts(Some(pts_for(
            frame.timestamp_ns,
            open.config.fps_num,
            open.config.fps_den,
        )));

        open.encoder
            .send_frame(&yuv)
            .map_err(|e| anyhow!("send_frame failed: {e:?}"))?;
        open.frames_encoded += 1;

        Self::drain_packets(open, self.sink.as_mut())
    }

    fn flush(&mut self) -> Result<()> {
        match &mut self.state {
            EncoderState::Ready(open) => {
                open.encoder
                    .send_eof()
                    .map_err(|e| anyhow!("send_eof failed: {e:?}"))?;
                Self::drain_packets(open, self.sink.as_mut())?;
                debug!(
                    "encoder {} drained after {} frames",
                    open.resolved_name, open.frames_encoded
                );
                self.state = EncoderState::Flushed;
                Ok(())
            }
            // Draining an already-drained or never-started encoder is a
            // no-op.
            EncoderState::Flushed | EncoderState::Uninitialized => Ok(()),
            EncoderState::Shutdown => Err(anyhow!("encoder shut down")),
        }
    }

    fn shutdown(&mut self) {
        if matches!(self.state, EncoderState::Shutdown) {
            return;
        }
        self.state = EncoderState::Shutdown;
        if let Err(e) = self.sink.finish() {
            warn!("packet sink failed to finish: {e:#}");
        }
    }
}

impl Drop for FfmpegEncoder {
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
    fn test_candidates_hardware_priority_order() {
        assert_eq!(
            encoder_candidates("h264", true),
            vec!["h264_nvenc", "h264_vaapi", "h264_qsv", "libx264"]
        );
        // Software-only request skips hardware variants entirely.
        assert_eq!(encoder_candidates("h264", false), vec!["libx264"]);
    }

    #[test]
    fn test_candidates_h265_uses_hevc_family() {
        assert_eq!(
            encoder_candidates("h265", true),
            vec!["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "libx265"]
        );
    }

    #[test]
    fn test_resolution_prefers_nvenc_over_all_others() {
        // Every ordering of "available" hardware backends resolves NVENC
        // first when it is present.
        let all = |_: &str| true;
        assert_eq!(
            resolve_encoder_name("h264", true, all).as_deref(),
            Some("h264_nvenc")
        );

        let no_nvenc = |name: &str| !name.contains("nvenc");
        assert_eq!(
            resolve_encoder_name("h264", true, no_nvenc).as_deref(),
            Some("h264_vaapi")
        );

        let qsv_only = |name: &str| name.contains("qsv") || name.starts_with("lib");
        assert_eq!(
            resolve_encoder_name("h264", true, qsv_only).as_deref(),
            Some("h264_qsv")
        );
    }

    #[test]
    fn test_resolution_falls_back_to_software() {
        let software_only = |name: &str| name == "libx264";
        assert_eq!(
            resolve_encoder_name("h264", true, software_only).as_deref(),
            Some("libx264")
        );

        let nothing = |_: &str| false;
        assert_eq!(resolve_encoder_name("h264", true, nothing), None);
    }

    #[test]
    fn test_pts_rescaling() {
        // 1 second at 30/1 fps -> pts 30
        assert_eq!(pts_for(1_000_000_000, 30, 1), 30);
        // Half a second at 60/1 -> 30
        assert_eq!(pts_for(500_000_000, 60, 1), 30);
        // NTSC 30000/1001
        assert_eq!(pts_for(1_001_000_000, 30_000, 1001), 30);
        assert_eq!(pts_for(0, 30, 1), 0);
    }

    struct VecSink {
        packets: Vec<Vec<u8>>,
        finished: bool,
    }

    impl PacketSink for VecSink {
        fn write_packet(&mut self, data: &[u8], _pts: i64, _keyframe: bool) -> Result<()> {
            self.packets.push(data.to_vec());
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    fn unready_encoder() -> FfmpegEncoder {
        FfmpegEncoder::new(Box::new(VecSink {
            packets: Vec::new(),
            finished: false,
        }))
    }

    #[test]
    fn test_uninitialized_encoder_refuses_frames_without_crashing() {
        let mut encoder = unready_encoder();
        let pixels = Arc::new(RwLock::new(vec![0u8; 16 * 16 * 4]));
        let frame = GpuFrameView::from_cpu_pixels(pixels, 16, 16, 0);

        assert!(encoder.encode_frame(&frame).is_err());
        assert!(encoder.encode_frame(&frame).is_err());
        assert!(encoder.resolved_name().is_none());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut encoder = unready_encoder();
        encoder.shutdown();
        encoder.shutdown();
        // Still refuses frames afterwards, without panicking.
        let pixels = Arc::new(RwLock::new(vec![0u8; 4 * 4 * 4]));
        let frame = GpuFrameView::from_cpu_pixels(pixels, 4, 4, 0);
        assert!(encoder.encode_frame(&frame).is_err());
    }

    #[test]
    fn test_flush_before_initialize_is_noop() {
        let mut encoder = unready_encoder();
        assert!(encoder.flush().is_ok());
    }
}
