//! Capture/encode session state machine
//!
//! A [`Session`] owns one backend and every resource acquired from it. It
//! lives on the capture worker thread for its whole life.
//!
//! Resources come in two layers. The display layer (display connection,
//! render context, drawable) is acquired once at open. The pipeline layer
//! (capture handle and session, encoder, registered inputs, bitstream
//! buffer) is torn down and rebuilt whenever the stream parameters change
//! or the backend reports its capture state is stale.

use crate::backend::{
    BackendError, BackendResult, CaptureBackend, CaptureSetup, EncoderSetup, GrabError,
    PictureParams, Resource,
};
use crate::config::{EncoderConfig, RecoveryPolicy};
use crate::error::{Error, Result};
use crate::types::{EncodedPicture, Resolution, StreamParams};
use std::time::Duration;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Reinitializing,
    /// A rebuild failed; only close is possible
    Failed,
    Destroyed,
}

/// One frame to capture and encode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRequest {
    pub params: StreamParams,
    pub force_keyframe: bool,
    pub frame_index: u64,
    pub timestamp: Duration,
}

pub struct Session {
    backend: Box<dyn CaptureBackend>,
    state: SessionState,
    params: StreamParams,
    encoder: EncoderConfig,
    policy: RecoveryPolicy,
    screen: Resolution,
    frame_size: Resolution,
    textures: usize,
    /// Acquired resources, in acquisition order
    held: Vec<Resource>,
    rebuilds: u64,
    failure: Option<String>,
}

impl Session {
    /// Acquire every resource the session needs. On failure, whatever was
    /// acquired is released in reverse order and no session is returned.
    pub fn open(
        backend: Box<dyn CaptureBackend>,
        display_name: Option<&str>,
        params: StreamParams,
        encoder: EncoderConfig,
        policy: RecoveryPolicy,
    ) -> Result<Self> {
        if !params.framerate.is_valid() {
            return Err(Error::InvalidFramerate(params.framerate));
        }

        let mut session = Self {
            backend,
            state: SessionState::Uninitialized,
            params,
            encoder,
            policy,
            screen: Resolution::default(),
            frame_size: Resolution::default(),
            textures: 0,
            held: Vec::new(),
            rebuilds: 0,
            failure: None,
        };

        let opened = session
            .acquire_display(display_name)
            .and_then(|_| session.build_pipeline());

        if let Err(e) = opened {
            tracing::error!("Failed to open {} capture session: {}", session.backend.name(), e);
            session.release_all();
            session.state = SessionState::Destroyed;
            return Err(Error::OpenFailed(e.to_string()));
        }

        session.state = SessionState::Active;
        tracing::info!(
            "Capture session open on {} ({}): {} {}",
            session.display_name().as_deref().unwrap_or("default display"),
            session.backend.name(),
            session.frame_size,
            session.params
        );
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn params(&self) -> StreamParams {
        self.params
    }

    /// Size of encoded frames
    pub fn frame_size(&self) -> Resolution {
        self.frame_size
    }

    pub fn screen_size(&self) -> Resolution {
        self.screen
    }

    pub fn display_name(&self) -> Option<String> {
        self.backend.display_name()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Pipeline rebuilds attempted since open
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    pub fn held(&self) -> &[Resource] {
        &self.held
    }

    /// Capture and encode one frame, rebuilding first if the requested
    /// parameters differ from the session's.
    pub fn produce(&mut self, request: &FrameRequest) -> Result<EncodedPicture> {
        match self.state {
            SessionState::Active => {}
            SessionState::Failed => {
                return Err(Error::SessionFailed(
                    self.failure.clone().unwrap_or_else(|| "rebuild failed".into()),
                ));
            }
            state => {
                return Err(Error::Internal(format!(
                    "produce on a session in state {:?}",
                    state
                )));
            }
        }
        if !request.params.framerate.is_valid() {
            return Err(Error::InvalidFramerate(request.params.framerate));
        }

        if request.params != self.params {
            tracing::warn!(
                "Recreating capture pipeline, parameters changed: {} -> {}",
                self.params, request.params
            );
            self.params = request.params;
            self.rebuild()?;
        }

        let mut attempts = 0;
        let texture = loop {
            match self.backend.grab() {
                Ok(texture) => break texture,
                Err(GrabError::MustRecreate) => {
                    if attempts >= self.policy.max_recreate_attempts {
                        tracing::warn!(
                            "Capture still stale after {} rebuilds, dropping frame {}",
                            attempts, request.frame_index
                        );
                        return Err(Error::RetryExhausted { attempts });
                    }
                    attempts += 1;
                    tracing::warn!(
                        "Recreating capture pipeline, backend reported stale state ({}/{})",
                        attempts, self.policy.max_recreate_attempts
                    );
                    self.rebuild()?;
                }
                Err(GrabError::Failed(e)) => return Err(Error::EncodeFailed(e.to_string())),
            }
        };

        self.encode(texture, request)
    }

    /// Release every resource in reverse acquisition order
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.state == SessionState::Destroyed {
            return;
        }
        self.release_all();
        self.state = SessionState::Destroyed;
        tracing::info!("Capture session closed after {} rebuilds", self.rebuilds);
    }

    fn acquire<T>(
        &mut self,
        resource: Resource,
        step: impl FnOnce(&mut dyn CaptureBackend) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let value = step(self.backend.as_mut())?;
        self.held.push(resource);
        Ok(value)
    }

    fn acquire_display(&mut self, display_name: Option<&str>) -> BackendResult<()> {
        self.screen = self.acquire(Resource::Display, |b| b.connect_display(display_name))?;
        self.acquire(Resource::RenderContext, |b| b.create_render_context())?;
        self.acquire(Resource::Drawable, |b| b.create_drawable())?;
        Ok(())
    }

    fn build_pipeline(&mut self) -> BackendResult<()> {
        let size = self
            .acquire(Resource::CaptureHandle, |b| b.create_capture_handle())?
            .align_width();

        let capture = CaptureSetup {
            size,
            show_pointer: self.params.show_pointer,
        };
        let textures = self.acquire(Resource::CaptureSession, |b| {
            b.create_capture_session(&capture)
        })?;
        if textures == 0 {
            return Err(BackendError::new(
                "create_capture_session",
                "no capture textures",
            ));
        }

        let encoder = EncoderSetup {
            size,
            framerate: self.params.framerate,
            bitrate: self.params.bitrate,
            config: self.encoder.clone(),
        };
        self.acquire(Resource::Encoder, |b| b.create_encoder(&encoder))?;

        for texture in 0..textures {
            self.acquire(Resource::Input(texture), |b| b.register_input(texture))?;
        }
        self.acquire(Resource::Bitstream, |b| b.create_bitstream())?;

        self.frame_size = size;
        self.textures = textures;
        tracing::debug!("Capture pipeline built: {} with {} textures", size, textures);
        Ok(())
    }

    fn rebuild(&mut self) -> Result<()> {
        self.state = SessionState::Reinitializing;
        self.rebuilds += 1;
        self.release_pipeline();

        match self.build_pipeline() {
            Ok(()) => {
                self.state = SessionState::Active;
                tracing::info!("Capture pipeline rebuilt: {} {}", self.frame_size, self.params);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Cannot rebuild capture pipeline: {}", e);
                self.release_pipeline();
                self.state = SessionState::Failed;
                let message = e.to_string();
                self.failure = Some(message.clone());
                Err(Error::SessionFailed(message))
            }
        }
    }

    fn encode(&mut self, texture: usize, request: &FrameRequest) -> Result<EncodedPicture> {
        if texture >= self.textures {
            return Err(Error::EncodeFailed(format!(
                "grab returned texture {} of {}",
                texture, self.textures
            )));
        }

        self.backend
            .map_input(texture)
            .map_err(|e| Error::EncodeFailed(e.to_string()))?;
        let encoded = self.encode_mapped(request);
        let unmapped = self.backend.unmap_input(texture);

        let picture = encoded.map_err(|e| Error::EncodeFailed(e.to_string()))?;
        unmapped.map_err(|e| Error::EncodeFailed(e.to_string()))?;
        Ok(picture)
    }

    fn encode_mapped(&mut self, request: &FrameRequest) -> BackendResult<EncodedPicture> {
        let picture = PictureParams::new(
            request.frame_index,
            self.params.framerate,
            request.force_keyframe,
        );
        if picture.force_idr {
            tracing::warn!("Forcing keyframe at frame {}", request.frame_index);
        }
        self.backend.encode_picture(&picture)?;

        let (data, keyframe) = {
            let bitstream = self.backend.lock_bitstream()?;
            (bitstream.data.to_vec(), bitstream.keyframe)
        };
        self.backend.unlock_bitstream()?;

        Ok(EncodedPicture {
            data,
            width: self.frame_size.width,
            height: self.frame_size.height,
            frame_index: request.frame_index,
            timestamp: request.timestamp,
            keyframe,
        })
    }

    fn release_pipeline(&mut self) {
        while let Some(&resource) = self.held.last() {
            if !resource.is_pipeline() {
                break;
            }
            self.held.pop();
            self.backend.release(resource);
        }
    }

    fn release_all(&mut self) {
        while let Some(resource) = self.held.pop() {
            self.backend.release(resource);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
