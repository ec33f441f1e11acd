//! Recording backend for tests

use super::{
    BackendError, BackendFactory, BackendResult, Bitstream, CaptureBackend, CaptureSetup,
    EncoderSetup, GrabError, PictureParams, Resource,
};
use crate::types::{Framerate, Resolution};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, ThreadId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Connect(Option<String>),
    RenderContext,
    Drawable,
    CaptureHandle,
    CaptureSession(CaptureSetup),
    Encoder { framerate: Framerate, bitrate: u32 },
    Register(usize),
    Bitstream,
    Grab,
    Map(usize),
    Encode(PictureParams),
    Lock,
    Unlock,
    Unmap(usize),
    Release(Resource),
}

#[derive(Debug)]
pub(crate) struct Script {
    pub screen: Resolution,
    pub textures: usize,
    /// Steps that fail every time they run
    pub fail: HashSet<&'static str>,
    /// Number of upcoming grabs that report `MustRecreate`
    pub recreate_grabs: u32,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            screen: Resolution::new(1366, 768),
            textures: 2,
            fail: HashSet::new(),
            recreate_grabs: 0,
        }
    }
}

/// Shared log of every call made by backends built from it
#[derive(Debug, Clone, Default)]
pub(crate) struct Recorder {
    calls: Arc<Mutex<Vec<(Call, ThreadId)>>>,
    script: Arc<Mutex<Script>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, step: &'static str) {
        self.script.lock().fail.insert(step);
    }

    pub fn heal(&self, step: &'static str) {
        self.script.lock().fail.remove(step);
    }

    pub fn recreate_grabs(&self, count: u32) {
        self.script.lock().recreate_grabs = count;
    }

    pub fn set_screen(&self, screen: Resolution) {
        self.script.lock().screen = screen;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().iter().map(|(call, _)| call.clone()).collect()
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        self.calls.lock().iter().map(|(_, id)| *id).collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|(call, _)| pred(call)).count()
    }

    pub fn released(&self) -> Vec<Resource> {
        self.calls
            .lock()
            .iter()
            .filter_map(|(call, _)| match call {
                Call::Release(resource) => Some(*resource),
                _ => None,
            })
            .collect()
    }

    /// Number of capture sessions built so far
    pub fn builds(&self) -> usize {
        self.count(|c| matches!(c, Call::CaptureSession(_)))
    }

    pub fn encodes(&self) -> Vec<PictureParams> {
        self.calls
            .lock()
            .iter()
            .filter_map(|(call, _)| match call {
                Call::Encode(params) => Some(*params),
                _ => None,
            })
            .collect()
    }

    pub fn backend(&self) -> ScriptedBackend {
        ScriptedBackend {
            recorder: self.clone(),
            display: None,
            last_picture: None,
            output: Vec::new(),
        }
    }

    pub fn factory(&self) -> Arc<dyn BackendFactory> {
        let recorder = self.clone();
        Arc::new(move || -> BackendResult<Box<dyn CaptureBackend>> {
            Ok(Box::new(recorder.backend()))
        })
    }

    fn record(&self, call: Call) {
        self.calls.lock().push((call, thread::current().id()));
    }

    fn step(&self, step: &'static str, call: Call) -> BackendResult<()> {
        self.record(call);
        if self.script.lock().fail.contains(step) {
            return Err(BackendError::new(step, "scripted failure"));
        }
        Ok(())
    }
}

pub(crate) struct ScriptedBackend {
    recorder: Recorder,
    display: Option<String>,
    last_picture: Option<PictureParams>,
    output: Vec<u8>,
}

impl CaptureBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn connect_display(&mut self, display_name: Option<&str>) -> BackendResult<Resolution> {
        self.recorder.step(
            "connect_display",
            Call::Connect(display_name.map(str::to_string)),
        )?;
        self.display = Some(display_name.unwrap_or(":0").to_string());
        Ok(self.recorder.script.lock().screen)
    }

    fn display_name(&self) -> Option<String> {
        self.display.clone()
    }

    fn create_render_context(&mut self) -> BackendResult<()> {
        self.recorder.step("create_render_context", Call::RenderContext)
    }

    fn create_drawable(&mut self) -> BackendResult<()> {
        self.recorder.step("create_drawable", Call::Drawable)
    }

    fn create_capture_handle(&mut self) -> BackendResult<Resolution> {
        self.recorder.step("create_capture_handle", Call::CaptureHandle)?;
        Ok(self.recorder.script.lock().screen)
    }

    fn create_capture_session(&mut self, setup: &CaptureSetup) -> BackendResult<usize> {
        self.recorder
            .step("create_capture_session", Call::CaptureSession(*setup))?;
        Ok(self.recorder.script.lock().textures)
    }

    fn create_encoder(&mut self, setup: &EncoderSetup) -> BackendResult<()> {
        self.recorder.step(
            "create_encoder",
            Call::Encoder {
                framerate: setup.framerate,
                bitrate: setup.bitrate,
            },
        )
    }

    fn register_input(&mut self, texture: usize) -> BackendResult<()> {
        self.recorder.step("register_input", Call::Register(texture))
    }

    fn create_bitstream(&mut self) -> BackendResult<()> {
        self.recorder.step("create_bitstream", Call::Bitstream)
    }

    fn grab(&mut self) -> Result<usize, GrabError> {
        self.recorder.record(Call::Grab);
        let mut script = self.recorder.script.lock();
        if script.recreate_grabs > 0 {
            script.recreate_grabs -= 1;
            return Err(GrabError::MustRecreate);
        }
        if script.fail.contains("grab") {
            return Err(GrabError::Failed(BackendError::new("grab", "scripted failure")));
        }
        Ok(0)
    }

    fn map_input(&mut self, texture: usize) -> BackendResult<()> {
        self.recorder.step("map_input", Call::Map(texture))
    }

    fn encode_picture(&mut self, params: &PictureParams) -> BackendResult<()> {
        self.recorder.step("encode_picture", Call::Encode(*params))?;
        self.last_picture = Some(*params);
        Ok(())
    }

    fn lock_bitstream(&mut self) -> BackendResult<Bitstream<'_>> {
        self.recorder.step("lock_bitstream", Call::Lock)?;
        let picture = self
            .last_picture
            .ok_or_else(|| BackendError::new("lock_bitstream", "nothing encoded"))?;
        self.output = picture.frame_index.to_be_bytes().to_vec();
        Ok(Bitstream {
            data: &self.output,
            keyframe: picture.force_idr,
        })
    }

    fn unlock_bitstream(&mut self) -> BackendResult<()> {
        self.recorder.step("unlock_bitstream", Call::Unlock)
    }

    fn unmap_input(&mut self, texture: usize) -> BackendResult<()> {
        self.recorder.step("unmap_input", Call::Unmap(texture))
    }

    fn release(&mut self, resource: Resource) {
        self.recorder.record(Call::Release(resource));
    }
}
