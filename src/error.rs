//! Error taxonomy for the production pipeline.
//!
//! Every collaborator call converts its transport failure into a
//! [`PipelineError`] at the call site. Cancellation travels as its own
//! variant so callers can tell an operator abort apart from a network failure.

use thiserror::Error;

/// Errors crossing a component boundary.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The remote service answered with a non-2xx status.
    /// `message` is the `{error}` field of the JSON body when present.
    #[error("{message} ({status})")]
    Api { status: u16, message: String },

    /// The request never produced a response (connect, TLS, timeout, reset).
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response arrived but could not be decoded.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// The publish stream broke its protocol (ended early, reported an error).
    #[error("{0}")]
    Protocol(String),

    /// The operation needs state the item does not have yet.
    #[error("{0}")]
    InvalidState(String),

    /// The persistence collaborator rejected a write.
    #[error("failed to save item: {0}")]
    Store(String),

    /// The operation was cancelled by the operator.
    #[error("Cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether re-issuing the same call could plausibly succeed.
    ///
    /// Rate limits (429), server errors (5xx) and transport failures are
    /// transient. Other 4xx responses, decode failures and cancellation are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Api { status, .. } => *status == 429 || *status >= 500,
            PipelineError::Transport(_) => true,
            PipelineError::Decode(_)
            | PipelineError::Protocol(_)
            | PipelineError::InvalidState(_)
            | PipelineError::Store(_)
            | PipelineError::Cancelled => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }

    /// Short reason suitable for direct display next to the item.
    pub fn reason(&self) -> String {
        match self {
            PipelineError::Api { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
