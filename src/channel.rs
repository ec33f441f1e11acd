//! Thread-affine command channel
//!
//! Capture backends must be driven from the thread that created them. The
//! [`CommandChannel`] spawns a dedicated worker thread, builds the backend
//! there, and forwards every session operation to it through a single-slot
//! mailbox. Each call blocks until the worker has posted its reply.
//!
//! The mailbox has two halves, each with its own lock and condition
//! variable: the caller writes a command into the inbox and waits on the
//! outbox; the worker waits on the inbox and writes replies into the
//! outbox. Replies are tagged with the command's sequence number so a reply
//! can never be handed to a call it does not belong to.

use crate::backend::BackendFactory;
use crate::config::{EncoderConfig, RecoveryPolicy};
use crate::error::{Error, Result};
use crate::session::{FrameRequest, Session};
use crate::types::{EncodedPicture, Resolution, StreamParams};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Arguments for opening a session on the worker
#[derive(Debug, Clone, Default)]
pub struct OpenArgs {
    pub display_name: Option<String>,
    pub params: StreamParams,
    pub encoder: EncoderConfig,
    pub policy: RecoveryPolicy,
}

/// What the caller may know about the session living on the worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub backend: String,
    /// Display the backend actually connected to
    pub display_name: Option<String>,
    pub frame_size: Resolution,
    pub params: StreamParams,
    /// Pipeline rebuilds since open
    pub rebuilds: u64,
}

enum Command {
    Open(OpenArgs),
    Produce(FrameRequest),
    Close,
}

enum Reply {
    Opened(Result<SessionInfo>),
    Produced {
        result: Result<EncodedPicture>,
        rebuilds: u64,
    },
    Closed,
}

#[derive(Default)]
struct Inbox {
    command: Option<(u64, Command)>,
    finish: bool,
}

#[derive(Default)]
struct Outbox {
    reply: Option<(u64, Reply)>,
    worker_exited: bool,
}

#[derive(Default)]
struct Mailbox {
    inbox: Mutex<Inbox>,
    input_ready: Condvar,
    outbox: Mutex<Outbox>,
    output_ready: Condvar,
}

impl Mailbox {
    fn post(&self, sequence: u64, reply: Reply) {
        let mut outbox = self.outbox.lock();
        outbox.reply = Some((sequence, reply));
        self.output_ready.notify_all();
    }
}

/// Marks the worker as gone when it returns or unwinds
struct ExitGuard<'a>(&'a Mailbox);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!("Capture worker panicked");
        }
        let mut outbox = self.0.outbox.lock();
        outbox.worker_exited = true;
        self.0.output_ready.notify_all();
    }
}

/// Synchronous call transport to the session's worker thread
pub struct CommandChannel {
    mailbox: Arc<Mailbox>,
    worker: Option<JoinHandle<()>>,
    sequence: u64,
    info: SessionInfo,
}

impl CommandChannel {
    /// Spawn the worker and open a session on it. If the session cannot be
    /// opened the worker exits and is joined before this returns.
    pub fn open(factory: Arc<dyn BackendFactory>, args: OpenArgs) -> Result<Self> {
        let mailbox = Arc::new(Mailbox::default());
        let worker = thread::Builder::new()
            .name("ghostgrab-capture".into())
            .spawn({
                let mailbox = mailbox.clone();
                move || run_worker(&mailbox, factory)
            })?;

        let mut channel = Self {
            mailbox,
            worker: Some(worker),
            sequence: 0,
            info: SessionInfo::default(),
        };

        match channel.call(Command::Open(args))? {
            Reply::Opened(Ok(info)) => {
                channel.info = info;
                Ok(channel)
            }
            Reply::Opened(Err(e)) => {
                channel.shutdown();
                Err(e)
            }
            _ => Err(Error::Internal("unexpected reply to open".into())),
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Run one capture-encode cycle on the worker
    pub fn produce_frame(&mut self, request: FrameRequest) -> Result<EncodedPicture> {
        match self.call(Command::Produce(request))? {
            Reply::Produced { result, rebuilds } => {
                self.info.rebuilds = rebuilds;
                let picture = result?;
                self.info.params = request.params;
                self.info.frame_size = Resolution::new(picture.width, picture.height);
                Ok(picture)
            }
            _ => Err(Error::Internal("unexpected reply to produce".into())),
        }
    }

    /// Tear the session down and join the worker
    pub fn close(mut self) -> Result<()> {
        let result = match self.call(Command::Close) {
            Ok(Reply::Closed) => Ok(()),
            Ok(_) => Err(Error::Internal("unexpected reply to close".into())),
            Err(e) => Err(e),
        };
        self.shutdown();
        result
    }

    fn call(&mut self, command: Command) -> Result<Reply> {
        self.sequence += 1;
        let sequence = self.sequence;

        {
            let mut inbox = self.mailbox.inbox.lock();
            inbox.command = Some((sequence, command));
            self.mailbox.input_ready.notify_one();
        }

        let mut outbox = self.mailbox.outbox.lock();
        loop {
            if let Some((tag, reply)) = outbox.reply.take() {
                if tag == sequence {
                    return Ok(reply);
                }
                tracing::debug!("Discarding stale reply {} (waiting for {})", tag, sequence);
                continue;
            }
            if outbox.worker_exited {
                return Err(Error::WorkerGone);
            }
            self.mailbox.output_ready.wait(&mut outbox);
        }
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        {
            let mut inbox = self.mailbox.inbox.lock();
            inbox.finish = true;
            self.mailbox.input_ready.notify_one();
        }
        if worker.join().is_err() {
            tracing::warn!("Capture worker panicked during shutdown");
        }
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(mailbox: &Mailbox, factory: Arc<dyn BackendFactory>) {
    let _exit = ExitGuard(mailbox);
    let mut session: Option<Session> = None;
    tracing::debug!("Capture worker started");

    loop {
        let (sequence, command) = {
            let mut inbox = mailbox.inbox.lock();
            loop {
                if inbox.finish {
                    tracing::debug!("Capture worker finishing");
                    return;
                }
                if let Some(command) = inbox.command.take() {
                    break command;
                }
                mailbox.input_ready.wait(&mut inbox);
            }
        };

        let (reply, done) = match command {
            Command::Open(args) => match open_session(factory.as_ref(), args) {
                Ok(opened) => {
                    let info = describe(&opened);
                    session = Some(opened);
                    (Reply::Opened(Ok(info)), false)
                }
                Err(e) => (Reply::Opened(Err(e)), true),
            },
            Command::Produce(request) => {
                let reply = match session.as_mut() {
                    Some(session) => Reply::Produced {
                        result: session.produce(&request),
                        rebuilds: session.rebuilds(),
                    },
                    None => Reply::Produced {
                        result: Err(Error::Internal("no open session".into())),
                        rebuilds: 0,
                    },
                };
                (reply, false)
            }
            Command::Close => {
                if let Some(session) = session.take() {
                    session.close();
                }
                (Reply::Closed, true)
            }
        };

        mailbox.post(sequence, reply);
        if done {
            tracing::debug!("Capture worker exiting");
            return;
        }
    }
}

fn open_session(factory: &dyn BackendFactory, args: OpenArgs) -> Result<Session> {
    let backend = factory
        .create()
        .map_err(|e| Error::OpenFailed(e.to_string()))?;
    tracing::info!("Opening {} capture session", backend.name());
    Session::open(
        backend,
        args.display_name.as_deref(),
        args.params,
        args.encoder,
        args.policy,
    )
}

fn describe(session: &Session) -> SessionInfo {
    SessionInfo {
        backend: session.backend_name().to_string(),
        display_name: session.display_name(),
        frame_size: session.frame_size(),
        params: session.params(),
        rebuilds: session.rebuilds(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{Call, Recorder};
    use crate::backend::{BackendError, BackendResult, CaptureBackend, Resource};
    use crate::types::Framerate;

    fn args() -> OpenArgs {
        OpenArgs {
            display_name: Some(":0".into()),
            ..Default::default()
        }
    }

    fn request(frame_index: u64) -> FrameRequest {
        let params = StreamParams::default();
        FrameRequest {
            params,
            force_keyframe: false,
            frame_index,
            timestamp: params.framerate.time_of(frame_index),
        }
    }

    #[test]
    fn test_backend_runs_on_worker_thread() {
        let recorder = Recorder::new();
        let mut channel = CommandChannel::open(recorder.factory(), args()).unwrap();
        channel.produce_frame(request(0)).unwrap();
        channel.produce_frame(request(1)).unwrap();
        channel.close().unwrap();

        let threads = recorder.threads();
        assert!(!threads.is_empty());
        assert!(threads.iter().all(|id| *id == threads[0]));
        assert_ne!(threads[0], thread::current().id());
    }

    #[test]
    fn test_open_reports_session() {
        let recorder = Recorder::new();
        let channel = CommandChannel::open(recorder.factory(), args()).unwrap();
        let info = channel.info();
        assert_eq!(info.backend, "scripted");
        assert_eq!(info.display_name.as_deref(), Some(":0"));
        assert_eq!(info.frame_size, Resolution::new(1368, 768));
        assert_eq!(info.params, StreamParams::default());
    }

    #[test]
    fn test_open_failure_joins_worker() {
        let recorder = Recorder::new();
        recorder.fail("create_capture_session");

        let err = CommandChannel::open(recorder.factory(), args()).err().unwrap();
        assert!(matches!(err, Error::OpenFailed(_)));
        assert_eq!(
            recorder.released(),
            vec![
                Resource::CaptureHandle,
                Resource::Drawable,
                Resource::RenderContext,
                Resource::Display,
            ]
        );
    }

    #[test]
    fn test_factory_failure() {
        let factory: Arc<dyn BackendFactory> =
            Arc::new(|| -> BackendResult<Box<dyn CaptureBackend>> {
                Err(BackendError::new("create", "no GPU"))
            });
        let err = CommandChannel::open(factory, args()).err().unwrap();
        assert!(matches!(err, Error::OpenFailed(ref m) if m.contains("no GPU")));
    }

    #[test]
    fn test_worker_panic_surfaces_as_worker_gone() {
        let factory: Arc<dyn BackendFactory> =
            Arc::new(|| -> BackendResult<Box<dyn CaptureBackend>> { panic!("driver crashed") });
        let err = CommandChannel::open(factory, args()).err().unwrap();
        assert!(matches!(err, Error::WorkerGone));
    }

    #[test]
    fn test_close_releases_everything() {
        let recorder = Recorder::new();
        let channel = CommandChannel::open(recorder.factory(), args()).unwrap();
        channel.close().unwrap();
        assert_eq!(recorder.released().len(), 9);
        assert_eq!(recorder.released().last(), Some(&Resource::Display));
    }

    #[test]
    fn test_drop_releases_on_worker() {
        let recorder = Recorder::new();
        let channel = CommandChannel::open(recorder.factory(), args()).unwrap();
        drop(channel);

        assert_eq!(recorder.released().len(), 9);
        let threads = recorder.threads();
        assert!(threads.iter().all(|id| *id != thread::current().id()));
    }

    #[test]
    fn test_produce_errors_keep_channel_usable() {
        let recorder = Recorder::new();
        let mut channel = CommandChannel::open(recorder.factory(), args()).unwrap();
        recorder.recreate_grabs(u32::MAX);

        let err = channel.produce_frame(request(0)).unwrap_err();
        assert!(matches!(err, Error::RetryExhausted { attempts: 3 }));

        recorder.recreate_grabs(0);
        let picture = channel.produce_frame(request(1)).unwrap();
        assert_eq!(picture.frame_index, 1);
    }

    #[test]
    fn test_produce_tracks_params() {
        let recorder = Recorder::new();
        let mut channel = CommandChannel::open(recorder.factory(), args()).unwrap();

        let mut req = request(0);
        req.params.framerate = Framerate::FPS_60;
        channel.produce_frame(req).unwrap();
        assert_eq!(channel.info().params.framerate, Framerate::FPS_60);
        assert_eq!(channel.info().rebuilds, 1);
        assert_eq!(recorder.count(|c| matches!(c, Call::Encoder { .. })), 2);
    }

    #[test]
    fn test_channel_moves_between_threads() {
        let recorder = Recorder::new();
        let mut channel = CommandChannel::open(recorder.factory(), args()).unwrap();
        let picture = thread::spawn(move || {
            let picture = channel.produce_frame(request(4));
            channel.close().unwrap();
            picture
        })
        .join()
        .unwrap()
        .unwrap();
        assert_eq!(picture.frame_index, 4);
    }
}
