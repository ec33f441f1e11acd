//! GhostGrab: paced live screen capture with H.264 encoding
//!
//! Pulls frames from a framebuffer capture backend, encodes each one to an
//! H.264 access unit and hands them out at a fixed frame rate with
//! presentation timestamps on the frame grid.
//!
//! # Features
//!
//! - **Pacing**: frames are released on the framerate grid of a shared clock,
//!   with cancellable waits for flushing
//! - **Thread affinity**: every backend call runs on one dedicated worker
//!   thread, so callers may pull from any thread
//! - **Recovery**: capture sessions are rebuilt on parameter changes and when
//!   the backend asks for it, with a bounded retry count
//!
//! # Example
//!
//! ```rust,no_run
//! use ghostgrab::{EncoderBackend, FfmpegBackend, FrameProducer, SystemClock};
//! use std::sync::Arc;
//!
//! fn main() -> ghostgrab::Result<()> {
//!     let mut producer = FrameProducer::builder()
//!         .backend(FfmpegBackend::factory(EncoderBackend::Auto))
//!         .clock(Arc::new(SystemClock::new()))
//!         .fps(30.0)
//!         .build()?;
//!
//!     producer.start()?;
//!     let frame = producer.produce()?;
//!     println!("frame {} at {:?}: {} bytes", frame.frame_index, frame.pts, frame.size());
//!     producer.stop()
//! }
//! ```

pub mod backend;
pub mod caps;
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod pacer;
pub mod producer;
pub mod session;
pub mod types;

// Re-exports for convenience
pub use backend::{BackendFactory, CaptureBackend, EncoderBackend, FfmpegBackend};
pub use caps::{FramerateRange, OutputCaps};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, EncoderConfig, SourceConfig};
pub use error::{Error, Flow, Result};
pub use producer::{FrameProducer, FrameProducerBuilder, ProducerHandle, ProducerStats};
pub use types::{EncodedFrame, Framerate, Resolution};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if NVENC is available on this system
pub fn is_nvenc_available() -> bool {
    backend::ffmpeg::nvenc_available()
}

/// Get information about available encoders
pub fn get_encoder_info() -> backend::ffmpeg::EncoderInfo {
    backend::ffmpeg::get_info()
}
