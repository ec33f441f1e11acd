//! Capture/encode backends
//!
//! A backend exposes the native capture and encode steps one resource at a
//! time. The session drives them in order, keeps track of what was
//! acquired and releases it in reverse. Backends are bound to the thread
//! that created them and are never required to be `Send`; they are built
//! on the capture worker through a [`BackendFactory`].

pub mod ffmpeg;

#[cfg(test)]
pub(crate) mod scripted;

use crate::config::EncoderConfig;
use crate::types::{duration_nanos, Framerate, Resolution};
use std::time::Duration;
use thiserror::Error;

pub use self::ffmpeg::FfmpegBackend;

/// Failure of a single backend step
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{step}: {message}")]
pub struct BackendError {
    pub step: &'static str,
    pub message: String,
}

impl BackendError {
    pub fn new(step: &'static str, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Outcome of a failed grab
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrabError {
    /// Capture state went stale (mode switch, GPU reset); rebuild and retry
    MustRecreate,
    Failed(BackendError),
}

/// A resource held by a session. Released in reverse acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Display,
    RenderContext,
    Drawable,
    CaptureHandle,
    CaptureSession,
    Encoder,
    /// A capture texture registered as encoder input
    Input(usize),
    Bitstream,
}

impl Resource {
    /// Capture and encode resources; rebuilt on parameter change or a stale
    /// capture. Everything else lives as long as the session.
    pub fn is_pipeline(&self) -> bool {
        !matches!(
            self,
            Resource::Display | Resource::RenderContext | Resource::Drawable
        )
    }
}

/// Capture session settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSetup {
    /// Frame size, width aligned to 4
    pub size: Resolution,
    pub show_pointer: bool,
}

/// Encoder settings
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSetup {
    pub size: Resolution,
    pub framerate: Framerate,
    pub bitrate: u32,
    pub config: EncoderConfig,
}

/// Per-picture encode parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureParams {
    pub frame_index: u64,
    /// `frame_index * duration`
    pub timestamp: Duration,
    /// One nominal frame period
    pub duration: Duration,
    pub force_idr: bool,
}

impl PictureParams {
    pub fn new(frame_index: u64, framerate: Framerate, force_idr: bool) -> Self {
        let duration = framerate.frame_duration();
        let timestamp =
            Duration::from_nanos(frame_index.saturating_mul(duration_nanos(duration)));
        Self {
            frame_index,
            timestamp,
            duration,
            force_idr,
        }
    }
}

/// Locked encoder output
#[derive(Debug)]
pub struct Bitstream<'a> {
    pub data: &'a [u8],
    pub keyframe: bool,
}

/// The native capture and encode capability, split into the steps a
/// session performs.
pub trait CaptureBackend {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Open the display connection. Returns the screen size.
    fn connect_display(&mut self, display_name: Option<&str>) -> BackendResult<Resolution>;

    /// Name of the display actually connected to
    fn display_name(&self) -> Option<String>;

    /// Create a rendering context with a texture-capable configuration
    fn create_render_context(&mut self) -> BackendResult<()>;

    /// Create an offscreen drawable and make the context current on it
    fn create_drawable(&mut self) -> BackendResult<()>;

    /// Create the capture handle. Returns the current framebuffer size.
    fn create_capture_handle(&mut self) -> BackendResult<Resolution>;

    /// Bind a capture session. Returns the number of output textures.
    fn create_capture_session(&mut self, setup: &CaptureSetup) -> BackendResult<usize>;

    fn create_encoder(&mut self, setup: &EncoderSetup) -> BackendResult<()>;

    /// Register capture texture `texture` as an encoder input
    fn register_input(&mut self, texture: usize) -> BackendResult<()>;

    fn create_bitstream(&mut self) -> BackendResult<()>;

    /// Non-blocking grab with forced refresh. Returns the texture holding
    /// the frame.
    fn grab(&mut self) -> Result<usize, GrabError>;

    fn map_input(&mut self, texture: usize) -> BackendResult<()>;

    fn encode_picture(&mut self, params: &PictureParams) -> BackendResult<()>;

    fn lock_bitstream(&mut self) -> BackendResult<Bitstream<'_>>;

    fn unlock_bitstream(&mut self) -> BackendResult<()>;

    fn unmap_input(&mut self, texture: usize) -> BackendResult<()>;

    /// Release one resource. Failures are logged by the backend; release
    /// always proceeds.
    fn release(&mut self, resource: Resource);
}

/// Builds a backend on the capture worker thread
pub trait BackendFactory: Send + Sync {
    fn create(&self) -> BackendResult<Box<dyn CaptureBackend>>;
}

impl<F> BackendFactory for F
where
    F: Fn() -> BackendResult<Box<dyn CaptureBackend>> + Send + Sync,
{
    fn create(&self) -> BackendResult<Box<dyn CaptureBackend>> {
        self()
    }
}

/// Encoder backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncoderBackend {
    /// Automatically select best available (NVENC > Software)
    #[default]
    Auto,
    /// Force NVIDIA NVENC hardware encoding
    Nvenc,
    /// Force CPU software encoding (x264)
    Software,
}

impl EncoderBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Some(EncoderBackend::Auto),
            "nvenc" => Some(EncoderBackend::Nvenc),
            "software" | "x264" => Some(EncoderBackend::Software),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_layers() {
        assert!(!Resource::Display.is_pipeline());
        assert!(!Resource::Drawable.is_pipeline());
        assert!(Resource::CaptureHandle.is_pipeline());
        assert!(Resource::Input(1).is_pipeline());
        assert!(Resource::Bitstream.is_pipeline());
    }

    #[test]
    fn test_picture_params() {
        let params = PictureParams::new(3, Framerate::FPS_25, true);
        assert_eq!(params.duration, Duration::from_millis(40));
        assert_eq!(params.timestamp, Duration::from_millis(120));
        assert!(params.force_idr);
    }

    #[test]
    fn test_encoder_backend_parse() {
        assert_eq!(EncoderBackend::parse("NVENC"), Some(EncoderBackend::Nvenc));
        assert_eq!(EncoderBackend::parse("x264"), Some(EncoderBackend::Software));
        assert_eq!(EncoderBackend::parse("vaapi"), None);
    }
}
