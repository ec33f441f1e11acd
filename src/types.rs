//! Common types used throughout GhostGrab

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Scale `value` by `num / denom` with 128-bit intermediate precision,
/// rounding down. Saturates at `u64::MAX`.
pub fn scale(value: u64, num: u64, denom: u64) -> u64 {
    if denom == 0 {
        return u64::MAX;
    }
    let scaled = value as u128 * num as u128 / denom as u128;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// Like [`scale`] but rounding up.
pub fn scale_ceil(value: u64, num: u64, denom: u64) -> u64 {
    if denom == 0 {
        return u64::MAX;
    }
    let scaled = (value as u128 * num as u128).div_ceil(denom as u128);
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const HD_720P: Self = Self::new(1280, 720);
    pub const FHD_1080P: Self = Self::new(1920, 1080);

    /// Round the width up to the next multiple of 4, as capture surfaces require.
    pub fn align_width(self) -> Self {
        Self::new(self.width.saturating_add(3) & !3, self.height)
    }

    /// Parse a `WIDTHxHEIGHT` string.
    pub fn parse(s: &str) -> Option<Self> {
        let (w, h) = s.trim().split_once(['x', 'X'])?;
        let width = w.parse().ok()?;
        let height = h.parse().ok()?;
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self::new(width, height))
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::FHD_1080P
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Framerate as a fraction. Defines the rate grid frames are aligned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Framerate {
    pub num: u32,
    pub den: u32,
}

impl Framerate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub const FPS_25: Self = Self::new(25, 1);
    pub const FPS_30: Self = Self::new(30, 1);
    pub const FPS_60: Self = Self::new(60, 1);

    /// Convert a floating point fps value. Whole numbers become `n/1`,
    /// anything else is kept to three decimals as `n/1000`.
    pub fn from_fps(fps: f64) -> Self {
        if !fps.is_finite() || fps <= 0.0 {
            return Self::new(0, 1);
        }
        if fps == fps.trunc() {
            Self::new(fps as u32, 1)
        } else {
            Self::new((fps * 1000.0).round() as u32, 1000)
        }
    }

    /// A framerate is usable for pacing only if both terms are non-zero.
    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// Get framerate as f64
    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }

    /// Length of one nominal frame period.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_nanos(scale(NANOS_PER_SEC, self.den as u64, self.num as u64))
    }

    /// Index of the grid slot that `elapsed` falls into.
    pub fn frame_at(&self, elapsed: Duration) -> u64 {
        scale(
            duration_nanos(elapsed),
            self.num as u64,
            NANOS_PER_SEC * self.den as u64,
        )
    }

    /// Start time of grid slot `index`. Rounded up so that
    /// `frame_at(time_of(n)) == n` holds for fractional rates.
    pub fn time_of(&self, index: u64) -> Duration {
        Duration::from_nanos(scale_ceil(index, NANOS_PER_SEC * self.den as u64, self.num as u64))
    }
}

impl Default for Framerate {
    fn default() -> Self {
        Self::FPS_25
    }
}

impl std::fmt::Display for Framerate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{} fps", self.num)
        } else {
            write!(f, "{:.3} fps", self.as_f64())
        }
    }
}

pub(crate) fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Parameters that are baked into a backend session when it is built.
/// Changing any of them forces a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamParams {
    /// Target bitrate in bits/sec
    pub bitrate: u32,
    pub show_pointer: bool,
    pub framerate: Framerate,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            framerate: Framerate::FPS_30,
            bitrate: 2_000_000,
            show_pointer: false,
        }
    }
}

impl std::fmt::Display for StreamParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} @ {} bps, pointer {}",
            self.framerate,
            self.bitrate,
            if self.show_pointer { "on" } else { "off" }
        )
    }
}

/// Encoded output of one capture-encode cycle, as it leaves the worker thread.
#[derive(Debug, Clone)]
pub struct EncodedPicture {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub frame_index: u64,
    pub timestamp: Duration,
    pub keyframe: bool,
}

/// Identity of a running stream. Frames keep a reference to it so the
/// producer can tell how many of its frames are still held downstream.
#[derive(Debug)]
pub struct StreamRef {
    pub name: String,
    pub display: Option<String>,
}

/// An access unit handed to the consumer
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Encoded byte-stream data
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Position on the rate grid since stream start
    pub frame_index: u64,
    /// Presentation timestamp, `frame_index` frame periods after stream start
    pub pts: Duration,
    /// Decode timestamp; the encoder never reorders, so this is left unset
    pub dts: Option<Duration>,
    pub duration: Duration,
    pub keyframe: bool,
    pub(crate) stream: Arc<StreamRef>,
}

impl EncodedFrame {
    /// Size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The stream this frame was produced by.
    pub fn stream(&self) -> &StreamRef {
        &self.stream
    }
}
