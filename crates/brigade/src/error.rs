//! Error types for the dispatch core.
//!
//! Every fallible operation in `brigade` returns [`Error`]. Failures are
//! synchronous and surfaced at the offending call; the core never retries.
//!
//! ## Error Cases
//! - `InvalidCapability`: a capability declaration is neither a single tag nor
//!   a non-empty collection of tags.
//! - `NotFound`: an operation referenced a worker that is not on duty.
//! - `NoAvailableWorker`: a job named a tag no on-duty worker declares.
//! - `DuplicateRegistration`: a worker went on duty under an identifier that is
//!   already on duty.
//! - `InvalidRequest`: a message arrived but could not be decoded.
//! - `ChannelError`: a connection could not send or receive.
//! - `WorkerDisconnected`: the selected worker failed mid-exchange and was
//!   taken off duty.
//! - `RequestCancelled`: the incoming caller went away.
//! - `SessionClosed`: the session has been torn down.
//!
//! [`Rejected`] pairs an [`Error`] with the connection a failed registration
//! handed over, so the caller can still reply on it.

use crate::WorkerId;
use thiserror::Error;

/// A result type defaulting to the crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for registration and dispatch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The capability declaration has an unsupported shape.
    #[error("Invalid capability: {reason}")]
    InvalidCapability { reason: String },

    /// No on-duty worker has this identifier.
    #[error("Worker not found: {id}")]
    NotFound { id: WorkerId },

    /// No on-duty worker declares the requested tag.
    #[error("No worker available for capability {tag:?}")]
    NoAvailableWorker { tag: String },

    /// The identifier is already on duty.
    #[error("Worker {id} is already on duty")]
    DuplicateRegistration { id: WorkerId },

    /// A message arrived on a live connection but could not be decoded.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// A connection failed to send or receive.
    #[error("Channel communication error: {context}")]
    ChannelError { context: String },

    /// The selected worker's connection failed mid-exchange.
    #[error("Worker {id} disconnected mid-exchange")]
    WorkerDisconnected { id: WorkerId },

    /// The incoming caller disconnected.
    #[error("Request cancelled by caller")]
    RequestCancelled,

    /// The dispatch session has ended.
    #[error("Session is closed")]
    SessionClosed,
}

impl Error {
    /// Stable, machine-readable name of the error case.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidCapability { .. } => "invalid_capability",
            Self::NotFound { .. } => "not_found",
            Self::NoAvailableWorker { .. } => "no_available_worker",
            Self::DuplicateRegistration { .. } => "duplicate_registration",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::ChannelError { .. } => "channel_error",
            Self::WorkerDisconnected { .. } => "worker_disconnected",
            Self::RequestCancelled => "request_cancelled",
            Self::SessionClosed => "session_closed",
        }
    }

    pub(crate) fn invalid_capability(reason: impl Into<String>) -> Self {
        Self::InvalidCapability {
            reason: reason.into(),
        }
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn channel(context: impl Into<String>) -> Self {
        Self::ChannelError {
            context: context.into(),
        }
    }
}

/// A failed hand-over that returns the rejected value to the caller.
///
/// Registration takes ownership of a worker's connection; when it fails the
/// connection comes back here so the transport can still answer on it.
#[derive(Error)]
#[error("{error}")]
pub struct Rejected<C> {
    pub error: Error,
    pub connection: C,
}

impl<C> core::fmt::Debug for Rejected<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<C> From<Rejected<C>> for Error {
    fn from(rejected: Rejected<C>) -> Self {
        rejected.error
    }
}
