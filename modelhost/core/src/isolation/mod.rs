//! Isolated Execution Contexts
//!
//! An isolated context runs a [`TaskExecutor`](crate::executor::TaskExecutor)
//! somewhere the coordinator cannot touch directly: a dedicated thread with
//! its own async runtime, or a child process. The only thing crossing the
//! boundary is framed JSON (see [`frame`]).
//!
//! # Pieces
//!
//! - [`ContextLauncher`]: starts a context and hands back its byte streams
//! - [`ThreadLauncher`]: context on a dedicated OS thread
//! - [`ProcessLauncher`]: context in a `modelhost-worker` child process
//! - [`IsolatedAdapter`]: drives one live context on behalf of a coordinator
//!
//! ```text
//!   Coordinator ──ExecutionRequest──▶ IsolatedAdapter ══frames══▶ worker::serve
//!        ▲                                  │                          │
//!        └──────── EventRouter ◀── relay ◀══╧═══════frames═════════════┘
//! ```

pub mod adapter;
pub mod frame;
pub mod process;
pub mod thread;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use uuid::Uuid;

pub use adapter::{EventRouter, IsolatedAdapter};
pub use frame::{FrameDecoder, FrameReader, FrameWriter};
pub use process::ProcessLauncher;
pub use thread::ThreadLauncher;

// ============================================================================
// Identity
// ============================================================================

/// Identifier of one isolated context
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    /// Generate a fresh identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for thread names and terse logs
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx_{}", self.0.simple())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors crossing the isolation boundary
#[derive(Debug, Error)]
pub enum TransportError {
    /// The context could not be started
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The other side went away
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// A request could not be handed to the context
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// A frame could not be encoded or decoded
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A message does not fit in one frame
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Encoded payload size
        size: usize,
        /// Largest payload a frame can carry
        max: usize,
    },

    /// Underlying stream error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame checksum mismatch, the stream is corrupt
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried by the frame
        expected: u32,
        /// Checksum of the received payload
        actual: u32,
    },

    /// Operation not valid in the context's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

// ============================================================================
// Launching
// ============================================================================

/// Read half of a context's byte stream
pub type ContextReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a context's byte stream
pub type ContextWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything needed to talk to a freshly launched context
pub struct ContextChannels {
    /// Events from the context, as frames
    pub reader: ContextReader,
    /// Requests to the context, as frames
    pub writer: ContextWriter,
    /// Resolves with a reason if the context dies abnormally
    ///
    /// Dropped without a value when the context ends cleanly.
    pub failure: oneshot::Receiver<String>,
    /// Kill switch
    pub handle: Box<dyn ContextHandle>,
}

impl fmt::Debug for ContextChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextChannels").finish_non_exhaustive()
    }
}

/// Hard-stop control over a running context
pub trait ContextHandle: Send + Sync {
    /// Stop the context without waiting for in-flight work
    ///
    /// Must be safe to call more than once.
    fn terminate(&mut self);
}

/// Starts isolated contexts
#[async_trait]
pub trait ContextLauncher: Send + Sync {
    /// Short description used in logs (`thread`, `process`)
    fn kind(&self) -> &'static str;

    /// Start a context serving the worker protocol
    async fn launch(&self, id: ContextId) -> Result<ContextChannels, TransportError>;
}
