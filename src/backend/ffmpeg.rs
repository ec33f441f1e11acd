//! Synthetic framebuffer capture with FFmpeg encoding
//!
//! Renders a moving NV12 test pattern (with an optional pointer sprite) into
//! a small ring of capture textures and encodes it through FFmpeg, using
//! NVENC when available and x264 otherwise.
//!
//! Display names of the form `name:WIDTHxHEIGHT` select the framebuffer
//! size; anything else gets 1920x1080.

use super::{
    BackendError, BackendFactory, BackendResult, Bitstream, CaptureBackend, CaptureSetup,
    EncoderBackend, EncoderSetup, GrabError, PictureParams, Resource,
};
use crate::caps::OutputCaps;
use crate::config::{EncoderConfig, H264Profile};
use crate::types::Resolution;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::Dictionary;
use std::sync::Arc;

const DEFAULT_DISPLAY: &str = "synthetic";
const CAPTURE_TEXTURES: usize = 2;
const POINTER_SIZE: u32 = 16;

/// H.264 encoder implementation behind FFmpeg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum H264Encoder {
    Nvenc,
    X264,
}

impl H264Encoder {
    fn select(backend: EncoderBackend) -> BackendResult<Self> {
        match backend {
            EncoderBackend::Auto if nvenc_available() => Ok(H264Encoder::Nvenc),
            EncoderBackend::Auto if x264_available() => Ok(H264Encoder::X264),
            EncoderBackend::Auto => Err(BackendError::new(
                "select_encoder",
                "no H.264 encoder found. Install FFmpeg with NVENC or x264 support.",
            )),
            EncoderBackend::Nvenc if nvenc_available() => Ok(H264Encoder::Nvenc),
            EncoderBackend::Nvenc => Err(BackendError::new(
                "select_encoder",
                "NVENC not found. Ensure NVIDIA drivers and FFmpeg with NVENC support are installed.",
            )),
            EncoderBackend::Software if x264_available() => Ok(H264Encoder::X264),
            EncoderBackend::Software => Err(BackendError::new(
                "select_encoder",
                "libx264 not found. Install FFmpeg with x264 support.",
            )),
        }
    }

    fn ffmpeg_name(&self) -> &'static str {
        match self {
            H264Encoder::Nvenc => "h264_nvenc",
            H264Encoder::X264 => "libx264",
        }
    }

    fn profile(&self, profile: H264Profile) -> &'static str {
        match (self, profile) {
            (_, H264Profile::Baseline) => "baseline",
            (_, H264Profile::Main) => "main",
            (_, H264Profile::High) => "high",
            (H264Encoder::Nvenc, H264Profile::High444) => "high444p",
            (H264Encoder::X264, H264Profile::High444) => "high444",
        }
    }

    fn options(&self, config: &EncoderConfig, bitrate: u32) -> Dictionary<'static> {
        let mut opts = Dictionary::new();
        opts.set("profile", self.profile(config.profile));
        opts.set("forced-idr", "1");

        match self {
            H264Encoder::Nvenc => {
                opts.set("preset", config.preset.to_nvenc_preset());
                opts.set("tune", config.preset.to_nvenc_tuning());
                opts.set("rc", "cbr");
                opts.set("delay", "0");
                opts.set("zerolatency", "1");
                if config.output_aud {
                    opts.set("aud", "1");
                }
            }
            H264Encoder::X264 => {
                opts.set("preset", config.preset.to_x264_preset());
                opts.set("tune", "zerolatency");
                let kbps = bitrate / 1000;
                let mut params = vec![
                    format!("vbv-maxrate={}", kbps),
                    format!("vbv-bufsize={}", kbps),
                    "nal-hrd=cbr".to_string(),
                ];
                if config.output_aud {
                    params.push("aud=1".into());
                }
                if config.picture_timing_sei {
                    params.push("pic-struct=1".into());
                }
                if config.repeat_headers {
                    params.push("repeat-headers=1".into());
                }
                opts.set("x264-params", &params.join(":"));
            }
        }
        opts
    }
}

/// One capture texture: an NV12 image
struct Texture {
    luma: Vec<u8>,
    chroma: Vec<u8>,
}

impl Texture {
    fn new(size: Resolution) -> Self {
        let luma = size.width as usize * size.height as usize;
        Self {
            luma: vec![16; luma],
            chroma: vec![128; luma / 2],
        }
    }
}

/// Capture backend over a synthetic framebuffer
pub struct FfmpegBackend {
    kind: H264Encoder,
    display: Option<String>,
    screen: Resolution,
    render_context: bool,
    drawable: bool,
    capture_handle: bool,
    capture: Option<CaptureSetup>,
    textures: Vec<Texture>,
    next_texture: usize,
    encoder: Option<ffmpeg::encoder::Video>,
    registered: Vec<bool>,
    mapped: Option<usize>,
    bitstream: Option<Vec<u8>>,
    keyframe: bool,
    frames_rendered: u64,
}

impl FfmpegBackend {
    /// Create a backend. Must be called on the thread that will drive it.
    pub fn new(backend: EncoderBackend) -> BackendResult<Self> {
        ffmpeg::init().map_err(|e| BackendError::new("init", e.to_string()))?;
        let kind = H264Encoder::select(backend)?;

        Ok(Self {
            kind,
            display: None,
            screen: Resolution::FHD_1080P,
            render_context: false,
            drawable: false,
            capture_handle: false,
            capture: None,
            textures: Vec::new(),
            next_texture: 0,
            encoder: None,
            registered: Vec::new(),
            mapped: None,
            bitstream: None,
            keyframe: false,
            frames_rendered: 0,
        })
    }

    /// Factory that builds the backend on the capture worker
    pub fn factory(backend: EncoderBackend) -> Arc<dyn BackendFactory> {
        Arc::new(move || -> BackendResult<Box<dyn CaptureBackend>> {
            Ok(Box::new(FfmpegBackend::new(backend)?))
        })
    }

    fn parse_display(name: &str) -> Option<Resolution> {
        let (_, size) = name.rsplit_once(':')?;
        Resolution::parse(size)
    }

    /// Sizes outside the output caps are refused before any buffer is sized
    /// from them
    fn check_screen(screen: Resolution) -> BackendResult<Resolution> {
        let template = OutputCaps::template();
        if template.width.contains(screen.width) && template.height.contains(screen.height) {
            Ok(screen)
        } else {
            Err(BackendError::new(
                "connect_display",
                format!(
                    "unsupported screen size {} (width {}, height {})",
                    screen, template.width, template.height
                ),
            ))
        }
    }

    /// Draw the next test pattern frame into `texture`
    fn render(&mut self, texture: usize) -> BackendResult<()> {
        let Some(capture) = self.capture else {
            return Err(BackendError::new("grab", "no capture session"));
        };
        let size = capture.size;
        let (width, height) = (size.width as usize, size.height as usize);
        let frame = self.frames_rendered;

        let target = self
            .textures
            .get_mut(texture)
            .ok_or_else(|| BackendError::new("grab", format!("no texture {}", texture)))?;

        // Diagonal bars scrolling right
        let shift = (frame * 4) as usize;
        for (y, row) in target.luma.chunks_exact_mut(width).enumerate() {
            for (x, px) in row.iter_mut().enumerate() {
                *px = if ((x + y + shift) / 64) % 2 == 0 { 48 } else { 176 };
            }
        }
        let hue = (frame % 256) as u8;
        for pair in target.chroma.chunks_exact_mut(2) {
            pair[0] = hue;
            pair[1] = 255 - hue;
        }

        if capture.show_pointer {
            let px = (frame as usize * 7) % width.saturating_sub(POINTER_SIZE as usize).max(1);
            let py = (frame as usize * 3) % height.saturating_sub(POINTER_SIZE as usize).max(1);
            for dy in 0..(POINTER_SIZE as usize).min(height - py) {
                // Left-aligned triangle
                let start = (py + dy) * width + px;
                let len = (dy + 1).min(width - px);
                target.luma[start..start + len].fill(235);
            }
        }

        self.frames_rendered += 1;
        Ok(())
    }

    fn drain_packets(&mut self) -> BackendResult<()> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| BackendError::new("encode_picture", "no encoder"))?;
        let bitstream = self
            .bitstream
            .as_mut()
            .ok_or_else(|| BackendError::new("encode_picture", "no bitstream buffer"))?;
        bitstream.clear();
        self.keyframe = false;

        loop {
            let mut packet = ffmpeg::Packet::empty();
            match encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    if let Some(data) = packet.data() {
                        bitstream.extend_from_slice(data);
                    }
                    self.keyframe |= packet.is_key();
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => {
                    return Err(BackendError::new(
                        "encode_picture",
                        format!("failed to receive packet: {}", e),
                    ))
                }
            }
        }
        Ok(())
    }
}

impl CaptureBackend for FfmpegBackend {
    fn name(&self) -> &str {
        self.kind.ffmpeg_name()
    }

    fn connect_display(&mut self, display_name: Option<&str>) -> BackendResult<Resolution> {
        let name = display_name.unwrap_or(DEFAULT_DISPLAY);
        self.screen = Self::check_screen(Self::parse_display(name).unwrap_or(Resolution::FHD_1080P))?;
        self.display = Some(name.to_string());
        tracing::debug!("Opened synthetic display {} ({})", name, self.screen);
        Ok(self.screen)
    }

    fn display_name(&self) -> Option<String> {
        self.display.clone()
    }

    fn create_render_context(&mut self) -> BackendResult<()> {
        if self.display.is_none() {
            return Err(BackendError::new("create_render_context", "no display"));
        }
        self.render_context = true;
        Ok(())
    }

    fn create_drawable(&mut self) -> BackendResult<()> {
        if !self.render_context {
            return Err(BackendError::new("create_drawable", "no render context"));
        }
        self.drawable = true;
        Ok(())
    }

    fn create_capture_handle(&mut self) -> BackendResult<Resolution> {
        if !self.drawable {
            return Err(BackendError::new("create_capture_handle", "no current drawable"));
        }
        self.capture_handle = true;
        Ok(self.screen)
    }

    fn create_capture_session(&mut self, setup: &CaptureSetup) -> BackendResult<usize> {
        if !self.capture_handle {
            return Err(BackendError::new("create_capture_session", "no capture handle"));
        }
        self.capture = Some(*setup);
        self.textures = (0..CAPTURE_TEXTURES)
            .map(|_| Texture::new(setup.size))
            .collect();
        self.registered = vec![false; CAPTURE_TEXTURES];
        self.next_texture = 0;
        Ok(CAPTURE_TEXTURES)
    }

    fn create_encoder(&mut self, setup: &EncoderSetup) -> BackendResult<()> {
        let step = "create_encoder";
        let name = self.kind.ffmpeg_name();
        let codec = ffmpeg::encoder::find_by_name(name)
            .ok_or_else(|| BackendError::new(step, format!("encoder {} not found", name)))?;

        let context = ffmpeg::codec::context::Context::new_with_codec(codec);
        let mut encoder = context
            .encoder()
            .video()
            .map_err(|e| BackendError::new(step, e.to_string()))?;

        let num = i32::try_from(setup.framerate.num)
            .map_err(|_| BackendError::new(step, "framerate out of range"))?;
        let den = i32::try_from(setup.framerate.den)
            .map_err(|_| BackendError::new(step, "framerate out of range"))?;

        encoder.set_width(setup.size.width);
        encoder.set_height(setup.size.height);
        encoder.set_format(Pixel::NV12);
        // One tick per frame
        encoder.set_time_base(ffmpeg::Rational::new(den, num));
        encoder.set_frame_rate(Some(ffmpeg::Rational::new(num, den)));
        encoder.set_gop(setup.config.gop_size.unwrap_or(i32::MAX as u32));
        encoder.set_max_b_frames(0);
        encoder.set_bit_rate(setup.bitrate as usize);
        encoder.set_max_bit_rate(setup.bitrate as usize);

        let opts = self.kind.options(&setup.config, setup.bitrate);
        let opened = encoder
            .open_with(opts)
            .map_err(|e| BackendError::new(step, format!("failed to open {}: {}", name, e)))?;
        self.encoder = Some(opened);

        tracing::info!(
            "{} encoder initialized: {} @ {} ({} bps, preset {:?}, profile {})",
            name,
            setup.size,
            setup.framerate,
            setup.bitrate,
            setup.config.preset,
            setup.config.profile.as_str()
        );
        Ok(())
    }

    fn register_input(&mut self, texture: usize) -> BackendResult<()> {
        if self.encoder.is_none() {
            return Err(BackendError::new("register_input", "no encoder"));
        }
        let slot = self
            .registered
            .get_mut(texture)
            .ok_or_else(|| BackendError::new("register_input", format!("no texture {}", texture)))?;
        *slot = true;
        Ok(())
    }

    fn create_bitstream(&mut self) -> BackendResult<()> {
        if self.encoder.is_none() {
            return Err(BackendError::new("create_bitstream", "no encoder"));
        }
        self.bitstream = Some(Vec::new());
        Ok(())
    }

    fn grab(&mut self) -> Result<usize, GrabError> {
        if self.capture.is_none() || self.textures.is_empty() {
            return Err(GrabError::MustRecreate);
        }
        let texture = self.next_texture;
        self.next_texture = (self.next_texture + 1) % self.textures.len();
        self.render(texture).map_err(GrabError::Failed)?;
        Ok(texture)
    }

    fn map_input(&mut self, texture: usize) -> BackendResult<()> {
        if !self.registered.get(texture).copied().unwrap_or(false) {
            return Err(BackendError::new(
                "map_input",
                format!("texture {} is not registered", texture),
            ));
        }
        if let Some(mapped) = self.mapped {
            return Err(BackendError::new(
                "map_input",
                format!("texture {} still mapped", mapped),
            ));
        }
        self.mapped = Some(texture);
        Ok(())
    }

    fn encode_picture(&mut self, params: &PictureParams) -> BackendResult<()> {
        let step = "encode_picture";
        let texture = self
            .mapped
            .and_then(|index| self.textures.get(index))
            .ok_or_else(|| BackendError::new(step, "no mapped input"))?;
        let size = self
            .capture
            .map(|c| c.size)
            .ok_or_else(|| BackendError::new(step, "no capture session"))?;
        let width = size.width as usize;

        let mut frame = ffmpeg::frame::Video::new(Pixel::NV12, size.width, size.height);
        for plane in 0..2 {
            let source = if plane == 0 { &texture.luma } else { &texture.chroma };
            let stride = frame.stride(plane);
            for (row, line) in source.chunks_exact(width).enumerate() {
                let start = row * stride;
                frame.data_mut(plane)[start..start + width].copy_from_slice(line);
            }
        }

        let pts = i64::try_from(params.frame_index)
            .map_err(|_| BackendError::new(step, "frame index out of range"))?;
        frame.set_pts(Some(pts));
        if params.force_idr {
            frame.set_kind(ffmpeg::picture::Type::I);
        }

        self.encoder
            .as_mut()
            .ok_or_else(|| BackendError::new(step, "no encoder"))?
            .send_frame(&frame)
            .map_err(|e| BackendError::new(step, format!("failed to send frame: {}", e)))?;

        self.drain_packets()
    }

    fn lock_bitstream(&mut self) -> BackendResult<Bitstream<'_>> {
        let data = self
            .bitstream
            .as_deref()
            .ok_or_else(|| BackendError::new("lock_bitstream", "no bitstream buffer"))?;
        Ok(Bitstream {
            data,
            keyframe: self.keyframe,
        })
    }

    fn unlock_bitstream(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn unmap_input(&mut self, texture: usize) -> BackendResult<()> {
        match self.mapped {
            Some(mapped) if mapped == texture => {
                self.mapped = None;
                Ok(())
            }
            _ => Err(BackendError::new(
                "unmap_input",
                format!("texture {} is not mapped", texture),
            )),
        }
    }

    fn release(&mut self, resource: Resource) {
        tracing::debug!("Releasing {:?}", resource);
        match resource {
            Resource::Bitstream => self.bitstream = None,
            Resource::Input(texture) => {
                if let Some(slot) = self.registered.get_mut(texture) {
                    *slot = false;
                }
            }
            Resource::Encoder => {
                if let Some(mut encoder) = self.encoder.take() {
                    // Nothing is pending at low latency; flush anyway so the
                    // encoder shuts down cleanly.
                    if let Err(e) = encoder.send_eof() {
                        tracing::warn!("Error flushing encoder: {}", e);
                    }
                    let mut packet = ffmpeg::Packet::empty();
                    while encoder.receive_packet(&mut packet).is_ok() {}
                }
            }
            Resource::CaptureSession => {
                self.capture = None;
                self.textures.clear();
                self.registered.clear();
                self.mapped = None;
            }
            Resource::CaptureHandle => self.capture_handle = false,
            Resource::Drawable => self.drawable = false,
            Resource::RenderContext => self.render_context = false,
            Resource::Display => self.display = None,
        }
    }
}

// ============================================================================
// Encoder Detection Functions
// ============================================================================

/// Check if NVENC is available on this system
pub fn nvenc_available() -> bool {
    if ffmpeg::init().is_err() {
        return false;
    }
    ffmpeg::encoder::find_by_name("h264_nvenc").is_some()
}

/// Check for x264 support
pub fn x264_available() -> bool {
    if ffmpeg::init().is_err() {
        return false;
    }
    ffmpeg::encoder::find_by_name("libx264").is_some()
}

/// Get GPU name via nvidia-smi
pub fn get_gpu_name() -> Option<String> {
    nvidia_smi_query("name")
}

/// Get NVIDIA driver version
pub fn get_driver_version() -> Option<String> {
    nvidia_smi_query("driver_version")
}

fn nvidia_smi_query(field: &str) -> Option<String> {
    std::process::Command::new("nvidia-smi")
        .args([format!("--query-gpu={}", field).as_str(), "--format=csv,noheader"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
}

/// Encoder availability
#[derive(Debug, Clone, Default)]
pub struct EncoderInfo {
    pub nvenc: bool,
    pub x264: bool,
    pub gpu_name: Option<String>,
    pub driver_version: Option<String>,
}

impl EncoderInfo {
    /// Encoder [`EncoderBackend::Auto`] would pick
    pub fn preferred(&self) -> Option<&'static str> {
        if self.nvenc {
            Some(H264Encoder::Nvenc.ffmpeg_name())
        } else if self.x264 {
            Some(H264Encoder::X264.ffmpeg_name())
        } else {
            None
        }
    }
}

/// Get information about available encoders
pub fn get_info() -> EncoderInfo {
    EncoderInfo {
        nvenc: nvenc_available(),
        x264: x264_available(),
        gpu_name: get_gpu_name(),
        driver_version: get_driver_version(),
    }
}
