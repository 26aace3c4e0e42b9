//! Single-batch execution against the remote capability service.
//!
//! One task execution = one subscription request = one call to
//! [`execute_batch`], spawned on its own task so the scheduler actor never
//! blocks. The listener callback of the underlying stack arrives as a signal
//! channel; the executor awaits a terminal signal bounded by the subscription
//! expiry plus a grace period.

use std::sync::Arc;
use std::time::Duration;

use presence_core::{BatchSignal, CapabilityClient, ClientError, PhoneNumber, ReasonCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::task::TaskId;

/// Signal channel depth; a batch produces a handful of signals at most.
const SIGNAL_CHANNEL_CAPACITY: usize = 16;

/// Grace added to the configured subscription expiry before the executor
/// gives up waiting for a terminal signal.
const EXPIRY_GRACE: Duration = Duration::from_secs(30);

/// Terminal result of one batch execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every entry in the batch was acknowledged. Clean completion.
    FullyUpdated,
    /// The wait ended (expiry, subscription timeout, channel closed,
    /// shutdown) without full acknowledgement.
    Incomplete,
    /// The documented transient subscribe failure; the task retries.
    TemporaryError,
    /// A hard failure code. Not worth retrying.
    Error { code: ReasonCode },
    /// The remote service was unreachable at submit time. Finishes the task
    /// incomplete without consuming a retry.
    ServiceUnavailable,
}

/// Submit one task's numbers as a batch and await the terminal signal.
pub async fn execute_batch(
    task: TaskId,
    numbers: Vec<PhoneNumber>,
    client: Arc<dyn CapabilityClient>,
    subscription_expiry: Duration,
    shutdown: CancellationToken,
) -> BatchOutcome {
    if !client.is_available().await {
        warn!(%task, "capability service unavailable, abandoning batch");
        return BatchOutcome::ServiceUnavailable;
    }

    let addresses: Vec<String> = numbers.iter().map(PhoneNumber::to_tel_uri).collect();
    let (signal_tx, mut signal_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);

    let request = match client.request_batch(addresses, signal_tx).await {
        Ok(request) => request,
        Err(ClientError::Unavailable) => {
            warn!(%task, "capability service dropped before submit");
            return BatchOutcome::ServiceUnavailable;
        }
        Err(ClientError::Rejected { code }) => {
            warn!(%task, %code, "batch rejected at submit, treating as temporary");
            return BatchOutcome::TemporaryError;
        }
    };

    debug!(%task, %request, entries = numbers.len(), "batch submitted");
    let deadline = tokio::time::Instant::now() + subscription_expiry + EXPIRY_GRACE;

    loop {
        let signal = tokio::select! {
            signal = signal_rx.recv() => signal,
            () = shutdown.cancelled() => {
                debug!(%task, "shutdown during batch wait");
                return BatchOutcome::Incomplete;
            }
            () = tokio::time::sleep_until(deadline) => {
                debug!(%task, %request, "no terminal signal before expiry");
                return BatchOutcome::Incomplete;
            }
        };

        match signal {
            // Collaborator dropped the channel without a terminal signal.
            None => return BatchOutcome::Incomplete,
            Some(BatchSignal::Accepted { request: id }) => {
                // Informational; the wait continues.
                debug!(%task, request = %id, "batch accepted");
            }
            Some(BatchSignal::Failed { code }) => {
                return if code == ReasonCode::SUBSCRIBE_TEMPORARY {
                    BatchOutcome::TemporaryError
                } else {
                    BatchOutcome::Error { code }
                };
            }
            Some(BatchSignal::Complete { request: id }) if id == request => {
                return BatchOutcome::FullyUpdated;
            }
            Some(BatchSignal::Expired { request: id }) if id == request => {
                return BatchOutcome::Incomplete;
            }
            Some(other) => {
                trace!(%task, ?other, "signal for another request ignored");
            }
        }
    }
}
