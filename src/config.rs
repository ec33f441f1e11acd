//! Configuration types for GhostGrab

use crate::error::{Error, Result};
use crate::types::{Framerate, StreamParams};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration, usually loaded from a TOML file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    /// Parameters a freshly opened session is built with, before the
    /// first frame request brings in the source settings
    pub session: StreamParams,
    pub encoder: EncoderConfig,
    pub pacing: PacingConfig,
    pub recovery: RecoveryPolicy,
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        tracing::debug!("Loading configuration from {}", path.display());
        Self::from_toml_str(&text)
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject values that can never produce a stream
    pub fn validate(&self) -> Result<()> {
        if !self.source.framerate.is_valid() {
            return Err(Error::InvalidFramerate(self.source.framerate));
        }
        if !self.session.framerate.is_valid() {
            return Err(Error::InvalidFramerate(self.session.framerate));
        }
        if self.source.bitrate == 0 {
            return Err(Error::Config("bitrate must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Source settings; the host may change these while streaming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Display to capture (None = default display)
    pub display_name: Option<String>,
    /// Show mouse pointer in capture
    pub show_pointer: bool,
    /// Target bitrate in bits/sec
    pub bitrate: u32,
    /// Target framerate
    pub framerate: Framerate,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            show_pointer: true,
            bitrate: 2_000_000,
            framerate: Framerate::FPS_25,
        }
    }
}

impl SourceConfig {
    pub fn with_display(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.framerate = Framerate::from_fps(fps);
        self
    }

    pub fn with_framerate(mut self, framerate: Framerate) -> Self {
        self.framerate = framerate;
        self
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_show_pointer(mut self, show: bool) -> Self {
        self.show_pointer = show;
        self
    }

    /// The session parameters a frame request carries
    pub fn stream_params(&self) -> StreamParams {
        StreamParams {
            framerate: self.framerate,
            bitrate: self.bitrate,
            show_pointer: self.show_pointer,
        }
    }
}

/// Encoder configuration. Fixed for the lifetime of a session; only the
/// bitrate and framerate come from [`StreamParams`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub profile: H264Profile,
    pub preset: EncoderPreset,
    pub rate_control: RateControl,
    /// Keyframe interval in frames (None = infinite, keyframes only on request)
    pub gop_size: Option<u32>,
    /// Emit access unit delimiters
    pub output_aud: bool,
    /// Emit picture timing SEI (x264 only; NVENC decides on its own)
    pub picture_timing_sei: bool,
    /// Repeat SPS/PPS before every IDR
    pub repeat_headers: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            profile: H264Profile::High,
            preset: EncoderPreset::LowLatencyHq,
            rate_control: RateControl::CbrLowDelayHq,
            gop_size: None,
            output_aud: true,
            picture_timing_sei: true,
            repeat_headers: false,
        }
    }
}

impl EncoderConfig {
    pub fn with_profile(mut self, profile: H264Profile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_preset(mut self, preset: EncoderPreset) -> Self {
        self.preset = preset;
        self
    }

    pub fn with_gop_size(mut self, gop: u32) -> Self {
        self.gop_size = Some(gop);
        self
    }
}

/// H.264 profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum H264Profile {
    Baseline,
    Main,
    #[default]
    High,
    High444,
}

impl H264Profile {
    /// Name used in caps and by FFmpeg encoders
    pub fn as_str(&self) -> &'static str {
        match self {
            H264Profile::Baseline => "baseline",
            H264Profile::Main => "main",
            H264Profile::High => "high",
            H264Profile::High444 => "high-4:4:4",
        }
    }
}

/// Encoder preset. Both variants encode every picture without delay, so
/// each pull gets its own access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EncoderPreset {
    /// Lowest latency
    LowLatencyHp,
    /// Low latency, higher quality
    #[default]
    LowLatencyHq,
}

impl EncoderPreset {
    /// Convert to NVENC preset name
    pub fn to_nvenc_preset(&self) -> &'static str {
        match self {
            EncoderPreset::LowLatencyHp => "p1",
            EncoderPreset::LowLatencyHq => "p3",
        }
    }

    /// Convert to NVENC tuning name
    pub fn to_nvenc_tuning(&self) -> &'static str {
        match self {
            EncoderPreset::LowLatencyHp => "ull",
            EncoderPreset::LowLatencyHq => "ll",
        }
    }

    /// Convert to x264 preset name
    pub fn to_x264_preset(&self) -> &'static str {
        match self {
            EncoderPreset::LowLatencyHp => "ultrafast",
            EncoderPreset::LowLatencyHq => "veryfast",
        }
    }
}

/// Rate control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RateControl {
    /// Constant bitrate tuned for low delay
    #[default]
    CbrLowDelayHq,
    /// Constant bitrate
    Cbr,
}

/// Frame pacing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Grace period before the first frame, letting the capture backend settle
    pub startup_delay_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: 5000,
        }
    }
}

impl PacingConfig {
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

/// Recovery policy for backend faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Rebuilds allowed per frame when the backend reports its state is stale
    pub max_recreate_attempts: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_recreate_attempts: 3,
        }
    }
}
