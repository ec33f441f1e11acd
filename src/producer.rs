//! Pull-driven frame producer
//!
//! Ties the pieces together: each [`FrameProducer::produce`] call paces
//! against the clock, dispatches one capture-encode cycle to the capture
//! worker and stamps the result.
//!
//! Settings the host may change while streaming (bitrate, pointer, fps,
//! keyframe requests, unlock) go through a [`ProducerHandle`], which can be
//! used from any thread.

use crate::backend::BackendFactory;
use crate::caps::{FramerateRange, OutputCaps};
use crate::channel::{CommandChannel, OpenArgs};
use crate::clock::Clock;
use crate::config::{Config, SourceConfig};
use crate::error::{Error, Result};
use crate::pacer::{FramePacer, Unlocker};
use crate::session::FrameRequest;
use crate::types::{EncodedFrame, Framerate, StreamRef};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Producer statistics since the last start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Frames handed to the consumer
    pub frames_produced: u64,
    /// Encoded bytes handed to the consumer
    pub bytes_produced: u64,
    pub keyframes: u64,
    /// Pulls that failed after pacing (capture or encode errors)
    pub failed_frames: u64,
    /// Capture pipeline rebuilds
    pub rebuilds: u64,
    /// Index of the last produced frame
    pub last_index: Option<u64>,
}

struct Shared {
    source: Mutex<SourceConfig>,
    force_keyframe: AtomicBool,
    /// Display the open session is connected to
    session_display: Mutex<Option<String>>,
    unlocker: Unlocker,
}

/// Thread-safe access to a producer's live settings
#[derive(Clone)]
pub struct ProducerHandle {
    shared: Arc<Shared>,
}

impl ProducerHandle {
    /// Interrupt a pull waiting on the clock; it returns [`Error::Cancelled`]
    pub fn unlock(&self) {
        self.shared.unlocker.unlock();
    }

    /// Allow pulls again after [`ProducerHandle::unlock`]
    pub fn unlock_stop(&self) {
        self.shared.unlocker.unlock_stop();
    }

    /// Make the next produced frame a keyframe
    pub fn request_keyframe(&self) {
        tracing::warn!("Keyframe requested");
        self.shared.force_keyframe.store(true, Ordering::SeqCst);
    }

    pub fn keyframe_pending(&self) -> bool {
        self.shared.force_keyframe.load(Ordering::SeqCst)
    }

    /// Display to capture on the next start
    pub fn set_display_name(&self, name: Option<String>) {
        self.shared.source.lock().display_name = name;
    }

    /// The display the open session is connected to, or the configured one
    pub fn display_name(&self) -> Option<String> {
        if let Some(name) = self.shared.session_display.lock().clone() {
            return Some(name);
        }
        self.shared.source.lock().display_name.clone()
    }

    pub fn set_show_pointer(&self, show: bool) {
        self.shared.source.lock().show_pointer = show;
    }

    pub fn show_pointer(&self) -> bool {
        self.shared.source.lock().show_pointer
    }

    pub fn set_bitrate(&self, bitrate: u32) {
        self.shared.source.lock().bitrate = bitrate;
    }

    pub fn bitrate(&self) -> u32 {
        self.shared.source.lock().bitrate
    }

    /// Set the target rate from a float; whole numbers become `n/1`, others
    /// `n/1000`
    pub fn set_fps(&self, fps: f64) {
        self.set_framerate(Framerate::from_fps(fps));
    }

    pub fn fps(&self) -> f64 {
        self.framerate().as_f64()
    }

    pub fn set_framerate(&self, framerate: Framerate) {
        self.shared.source.lock().framerate = framerate;
    }

    pub fn framerate(&self) -> Framerate {
        self.shared.source.lock().framerate
    }
}

/// Produces paced, encoded frames on demand
pub struct FrameProducer {
    config: Config,
    factory: Arc<dyn BackendFactory>,
    shared: Arc<Shared>,
    pacer: FramePacer,
    channel: Option<CommandChannel>,
    stream: Option<Arc<StreamRef>>,
    stats: ProducerStats,
}

impl FrameProducer {
    pub fn new(
        config: Config,
        factory: Arc<dyn BackendFactory>,
        clock: Option<Arc<dyn Clock>>,
    ) -> Self {
        let pacer = FramePacer::new(
            clock,
            config.source.framerate,
            config.pacing.startup_delay(),
        );
        let shared = Arc::new(Shared {
            source: Mutex::new(config.source.clone()),
            force_keyframe: AtomicBool::new(true),
            session_display: Mutex::new(None),
            unlocker: pacer.unlocker(),
        });

        Self {
            config,
            factory,
            shared,
            pacer,
            channel: None,
            stream: None,
            stats: ProducerStats::default(),
        }
    }

    pub fn builder() -> FrameProducerBuilder {
        FrameProducerBuilder::new()
    }

    /// Attach or detach the clock used for pacing
    pub fn set_clock(&mut self, clock: Option<Arc<dyn Clock>>) {
        self.pacer.set_clock(clock);
    }

    pub fn handle(&self) -> ProducerHandle {
        ProducerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.channel.is_some()
    }

    /// Open the capture session and begin a new stream
    pub fn start(&mut self) -> Result<()> {
        if self.channel.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let args = OpenArgs {
            display_name: self.shared.source.lock().display_name.clone(),
            params: self.config.session,
            encoder: self.config.encoder.clone(),
            policy: self.config.recovery,
        };
        let channel = CommandChannel::open(self.factory.clone(), args)?;
        let info = channel.info().clone();

        tracing::info!(
            "Producer started on {} via {} ({})",
            info.display_name.as_deref().unwrap_or("default display"),
            info.backend,
            info.frame_size
        );

        *self.shared.session_display.lock() = info.display_name.clone();
        self.shared.force_keyframe.store(true, Ordering::SeqCst);
        self.pacer.reset();
        self.stats = ProducerStats::default();
        self.stream = Some(Arc::new(StreamRef {
            name: info.backend,
            display: info.display_name,
        }));
        self.channel = Some(channel);
        Ok(())
    }

    /// Close the capture session. Frames still held by consumers stay
    /// valid.
    pub fn stop(&mut self) -> Result<()> {
        let Some(channel) = self.channel.take() else {
            return Ok(());
        };

        let outstanding = self.outstanding_frames();
        if outstanding > 0 {
            tracing::debug!("Stopping with {} frames still held downstream", outstanding);
        }

        *self.shared.session_display.lock() = None;
        self.stream = None;
        self.pacer.reset();

        let result = channel.close();
        tracing::info!(
            "Producer stopped: {} frames, {} bytes, {} failed, {} rebuilds",
            self.stats.frames_produced,
            self.stats.bytes_produced,
            self.stats.failed_frames,
            self.stats.rebuilds
        );
        result
    }

    /// Wait for the next frame slot, then capture and encode it.
    pub fn produce(&mut self) -> Result<EncodedFrame> {
        let (Some(channel), Some(stream)) = (self.channel.as_mut(), self.stream.as_ref()) else {
            return Err(Error::NotStarted);
        };

        let source = self.shared.source.lock().clone();
        self.pacer.set_framerate(source.framerate);
        let paced = self.pacer.pace()?;

        // Consumed even if the frame fails
        let force_keyframe = self.shared.force_keyframe.swap(false, Ordering::SeqCst);

        let request = FrameRequest {
            params: source.stream_params(),
            force_keyframe,
            frame_index: paced.index,
            timestamp: paced.timestamp,
        };
        let result = channel.produce_frame(request);
        self.stats.rebuilds = channel.info().rebuilds;

        let picture = match result {
            Ok(picture) => picture,
            Err(e) => {
                self.stats.failed_frames += 1;
                tracing::warn!("Frame {} failed: {}", paced.index, e);
                return Err(e);
            }
        };

        self.stats.frames_produced += 1;
        self.stats.bytes_produced += picture.data.len() as u64;
        if picture.keyframe {
            self.stats.keyframes += 1;
        }
        self.stats.last_index = Some(paced.index);

        tracing::debug!(
            "Frame {} pts {:?} duration {:?} ({} bytes{})",
            paced.index,
            paced.timestamp,
            paced.duration,
            picture.data.len(),
            if picture.keyframe { ", keyframe" } else { "" }
        );

        Ok(EncodedFrame {
            data: picture.data,
            width: picture.width,
            height: picture.height,
            frame_index: paced.index,
            pts: paced.timestamp,
            dts: None,
            duration: paced.duration,
            keyframe: picture.keyframe,
            stream: stream.clone(),
        })
    }

    /// Current output caps: the session's size once started, the template
    /// before that
    pub fn caps(&self) -> OutputCaps {
        match self.channel.as_ref() {
            Some(channel) => {
                OutputCaps::for_session(channel.info().frame_size, self.config.encoder.profile)
            }
            None => OutputCaps::template(),
        }
    }

    /// Settle the target framerate with what downstream accepts. The
    /// session must be open.
    pub fn negotiate_framerate(&mut self, downstream: Option<FramerateRange>) -> Result<Framerate> {
        if self.channel.is_none() {
            return Err(Error::NotStarted);
        }

        let ours = self.caps().framerate;
        let range = match downstream {
            Some(theirs) => ours.intersect(&theirs).ok_or_else(|| {
                Error::Config(format!("no common framerate between {} and {}", ours, theirs))
            })?,
            None => ours,
        };
        let framerate = range.fixate();

        tracing::debug!("Negotiated framerate {}", framerate);
        self.shared.source.lock().framerate = framerate;
        self.pacer.set_framerate(framerate);
        Ok(framerate)
    }

    /// Frames of the current stream still held by consumers
    pub fn outstanding_frames(&self) -> usize {
        self.stream
            .as_ref()
            .map(|stream| Arc::strong_count(stream) - 1)
            .unwrap_or(0)
    }

    /// Frames paced since the stream started, including failed ones
    pub fn frames_paced(&self) -> u64 {
        self.pacer.frames_paced()
    }

    pub fn stats(&self) -> ProducerStats {
        self.stats.clone()
    }
}

impl Drop for FrameProducer {
    fn drop(&mut self) {
        if self.channel.is_some() {
            if let Err(e) = self.stop() {
                tracing::warn!("Error stopping producer: {}", e);
            }
        }
    }
}

/// Builder for [`FrameProducer`]
pub struct FrameProducerBuilder {
    config: Config,
    factory: Option<Arc<dyn BackendFactory>>,
    clock: Option<Arc<dyn Clock>>,
}

impl FrameProducerBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            factory: None,
            clock: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn backend(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn display(mut self, name: impl Into<String>) -> Self {
        self.config.source.display_name = Some(name.into());
        self
    }

    pub fn fps(mut self, fps: f64) -> Self {
        self.config.source.framerate = Framerate::from_fps(fps);
        self
    }

    pub fn bitrate(mut self, bitrate: u32) -> Self {
        self.config.source.bitrate = bitrate;
        self
    }

    pub fn build(self) -> Result<FrameProducer> {
        self.config.validate()?;
        let factory = self
            .factory
            .ok_or_else(|| Error::Config("no capture backend configured".into()))?;
        Ok(FrameProducer::new(self.config, factory, self.clock))
    }
}

impl Default for FrameProducerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
