//! Remote capability-query collaborator.
//!
//! A batch of addresses goes out as one subscription request; the collaborator
//! answers asynchronously on a signal channel. The listener-style callback of
//! the underlying stack is modeled as an [`mpsc`] stream of [`BatchSignal`]s
//! so the executor can await a terminal signal with a deadline instead of
//! blocking on a monitor.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Result alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Identifier of one in-flight batch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request-{}", self.0)
    }
}

/// Reason code attached to a failed batch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReasonCode(pub i32);

impl ReasonCode {
    /// Transient subscription failure. The only code that sends a task down
    /// the retry path; every other failure finishes the task incomplete.
    pub const SUBSCRIBE_TEMPORARY: Self = Self(1);
    /// The service rejected the request outright.
    pub const FORBIDDEN: Self = Self(2);
    /// The request was not understood.
    pub const BAD_REQUEST: Self = Self(3);
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reason-{}", self.0)
    }
}

/// Publish state of the local presence stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublishState {
    /// Not yet reported by the stack.
    #[default]
    Unknown,
    /// Own presence is not published; polling must stay off.
    NotPublished,
    /// Own presence published; polling may run.
    Ok,
}

impl fmt::Display for PublishState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::NotPublished => write!(f, "not-published"),
            Self::Ok => write!(f, "ok"),
        }
    }
}

/// Asynchronous signals for one batch request.
///
/// Signals carrying a [`RequestId`] are only meaningful when the id matches
/// the outstanding request; the executor ignores stragglers from earlier
/// requests on a reused channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchSignal {
    /// The request was accepted and is in progress. Informational; the wait
    /// continues until a terminal signal or the expiry deadline.
    Accepted { request: RequestId },
    /// The request failed with the given reason. Terminal.
    Failed { code: ReasonCode },
    /// Every entry in the batch was answered. Terminal, fully updated.
    Complete { request: RequestId },
    /// The subscription expired before all entries were answered. Terminal,
    /// not fully updated.
    Expired { request: RequestId },
}

/// Errors returned synchronously from a batch submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The remote capability service is not reachable.
    #[error("capability service is unavailable")]
    Unavailable,
    /// The submission was rejected immediately. Treated as a temporary
    /// error: the task retries with backoff.
    #[error("batch request rejected: {code}")]
    Rejected { code: ReasonCode },
}

/// Remote capability-query service.
#[async_trait]
pub trait CapabilityClient: Send + Sync + 'static {
    /// Whether the presence stack is up at all.
    async fn is_available(&self) -> bool;

    /// Current publish state of the local stack.
    async fn publish_state(&self) -> PublishState;

    /// Submit one batch of `tel:` addresses. On success the returned id
    /// correlates the terminal [`BatchSignal`] delivered on `signals`.
    async fn request_batch(
        &self,
        addresses: Vec<String>,
        signals: mpsc::Sender<BatchSignal>,
    ) -> ClientResult<RequestId>;
}
