//! Error types for GhostGrab

use crate::types::Framerate;
use thiserror::Error;

/// Result type alias for GhostGrab operations
pub type Result<T> = std::result::Result<T, Error>;

/// GhostGrab error type
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot operate without a clock")]
    NoClock,

    #[error("Invalid framerate {}/{}", .0.num, .0.den)]
    InvalidFramerate(Framerate),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Lifecycle errors
    #[error("Source not started")]
    NotStarted,

    #[error("Source already started")]
    AlreadyStarted,

    // Session errors
    #[error("Could not open capture session: {0}")]
    OpenFailed(String),

    #[error("Capture session had to be recreated {attempts} times, giving up on this frame")]
    RetryExhausted { attempts: u32 },

    #[error("Encoding failed: {0}")]
    EncodeFailed(String),

    #[error("Capture session failed: {0}")]
    SessionFailed(String),

    #[error("Capture worker thread exited")]
    WorkerGone,

    // Pacing
    #[error("Wait for next frame was cancelled")]
    Cancelled,

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How the host streaming loop should react to a failed pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Not ready; fix configuration or retry later
    NotReady,
    /// Stop the stream with an error
    Fatal,
    /// Cancelled by an unlock; stop cleanly
    Flushing,
}

impl Error {
    /// Map this error onto the host's flow outcome
    pub fn flow(&self) -> Flow {
        match self {
            Error::Cancelled => Flow::Flushing,
            Error::InvalidFramerate(_) | Error::RetryExhausted { .. } | Error::NotStarted => {
                Flow::NotReady
            }
            _ => Flow::Fatal,
        }
    }

    /// Check if the stream can keep pulling frames after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::RetryExhausted { .. } | Error::Cancelled)
    }

    /// Check if this error comes from configuration rather than the backend
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::NoClock | Error::InvalidFramerate(_) | Error::ConfigParse(_)
        )
    }
}
