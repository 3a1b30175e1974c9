//! Error types for multi-QP bring-up.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::exchange::ConnectionIdentifier;
use crate::qp::QpState;
use crate::wc::WcStatus;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by bring-up, exchange and transfer operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A provider call returned an error outside any more specific context.
    #[error("verbs error: {0}")]
    Verbs(#[from] io::Error),

    /// An invalid argument was supplied.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Acquiring a transport resource failed.
    #[error("failed to {stage}: {source}")]
    Resource {
        /// The acquisition step that failed.
        stage: ResourceStage,
        #[source]
        source: io::Error,
    },

    /// Moving a QP to INIT or RTS failed.
    #[error("QP[{index}] transition to {target} failed: {source}")]
    Transition {
        /// Index of the QP in the resource list.
        index: usize,
        /// Requested state.
        target: QpState,
        #[source]
        source: io::Error,
    },

    /// Moving a QP to RTR failed while applying a peer identifier.
    #[error("QP[{index}] transition to RTR failed (peer {peer}): {source}")]
    RtrTransition {
        /// Index of the QP in the resource list.
        index: usize,
        /// The peer identifier that was being applied.
        peer: ConnectionIdentifier,
        #[source]
        source: io::Error,
    },

    /// Reading or writing the control channel failed.
    #[error("control channel {op} failed: {source}")]
    Transport {
        /// What was being read or written.
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Posting a work request to a QP failed.
    #[error("QP[{index}] post {op} failed: {source}")]
    Post {
        /// Index of the QP in the resource list.
        index: usize,
        /// `"send"` or `"recv"`.
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The peer sent metadata this side refuses to use.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// A work completion finished with an error status.
    #[error("work completion error on QP[{tag}]: {status} (vendor_err={vendor_err:#x})")]
    WorkCompletion {
        /// The completion tag (QP index).
        tag: u64,
        /// The completion status.
        status: WcStatus,
        /// Vendor-specific error code.
        vendor_err: u32,
    },

    /// Polling the completion queue itself failed (e.g. after an overrun).
    #[error("poll_cq failed: {0}")]
    Poll(#[source] io::Error),

    /// A completion carried a tag that names none of the paired QPs.
    #[error("completion tag {tag} does not name one of {num_tags} QPs")]
    UnknownTag {
        /// The unexpected tag.
        tag: u64,
        /// Number of QPs completions may be attributed to.
        num_tags: usize,
    },

    /// Fewer completions than requested arrived before the deadline.
    #[error("poll timed out after {elapsed:?} with {received}/{expected} completions")]
    PollTimeout {
        /// Number of completions requested.
        expected: usize,
        /// Number of completions consumed before giving up.
        received: usize,
        /// Time spent polling.
        elapsed: Duration,
    },
}

/// Coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ResourceAcquisition,
    StateTransition,
    Transport,
    /// Failed work request posts and other provider calls outside a
    /// resource or transition step.
    Verbs,
    Completion,
    InvalidArgument,
}

impl Error {
    /// The error category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resource { .. } => ErrorKind::ResourceAcquisition,
            Self::Transition { .. } | Self::RtrTransition { .. } => ErrorKind::StateTransition,
            Self::Transport { .. } | Self::Handshake(_) => ErrorKind::Transport,
            Self::Verbs(_) | Self::Post { .. } => ErrorKind::Verbs,
            Self::WorkCompletion { .. }
            | Self::Poll(_)
            | Self::UnknownTag { .. }
            | Self::PollTimeout { .. } => ErrorKind::Completion,
            Self::InvalidArg(_) => ErrorKind::InvalidArgument,
        }
    }

    /// Index of the QP a state transition failed on, if any.
    pub fn qp_index(&self) -> Option<usize> {
        match self {
            Self::Transition { index, .. } | Self::RtrTransition { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub(crate) fn transport(op: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Transport { op, source }
    }

    pub(crate) fn resource(stage: ResourceStage) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Resource { stage, source }
    }
}

/// Acquisition step named by [`Error::Resource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStage {
    OpenDevice,
    QueryPort,
    QueryGid,
    AllocPd,
    RegisterMemory,
    CreateCq,
    CreateQp(usize),
}

impl fmt::Display for ResourceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenDevice => f.write_str("open device"),
            Self::QueryPort => f.write_str("query port"),
            Self::QueryGid => f.write_str("query GID"),
            Self::AllocPd => f.write_str("allocate protection domain"),
            Self::RegisterMemory => f.write_str("register memory region"),
            Self::CreateCq => f.write_str("create completion queue"),
            Self::CreateQp(i) => write!(f, "create QP[{i}]"),
        }
    }
}
