//! Poll tasks and their retry/backoff state machine.

use std::fmt;
use std::time::Duration;

use presence_core::{ContactSnapshot, PhoneNumber};
use tokio::task::AbortHandle;

/// Priority class of a poll task.
///
/// `NewContacts` outranks `Normal`: brand-new contacts get a short backoff
/// unit and jump the queue ahead of routine refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PollKind {
    /// Routine staleness refresh.
    Normal,
    /// First poll for contacts that have never been answered.
    NewContacts,
}

impl PollKind {
    /// Queue ordering weight; higher runs first.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::NewContacts => 1,
        }
    }

    /// Retries granted before a task force-finishes incomplete.
    #[must_use]
    pub const fn total_retries(self) -> u32 {
        match self {
            Self::Normal => 5,
            Self::NewContacts => 4,
        }
    }

    /// Base unit of the exponential backoff sequence.
    #[must_use]
    pub const fn backoff_unit(self) -> Duration {
        match self {
            Self::Normal => Duration::from_secs(1_800),
            Self::NewContacts => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for PollKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::NewContacts => write!(f, "new-contacts"),
        }
    }
}

/// Process-lifetime-unique task identity. Not persisted across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-execute after this backoff delay.
    Backoff(Duration),
    /// Attempts exhausted: finish incomplete and refresh the records'
    /// timestamps so they are not immediately re-selected as most stale.
    Exhausted,
    /// Cancelled between attempts: finish incomplete now.
    Cancelled,
}

/// One unit of poll work: an ordered list of contact snapshots, a priority
/// class, and retry state.
///
/// Lifecycle: `Created → Executing → (RetryScheduled → Executing)* →
/// Finished | Cancelled`. The owning queue drives every transition; a task
/// never mutates itself from another thread.
#[derive(Debug)]
pub struct PollTask {
    id: TaskId,
    kind: PollKind,
    contacts: Vec<ContactSnapshot>,
    /// Retries consumed so far. Never exceeds `kind.total_retries()` while
    /// the task is live; the increment that would pass it forces completion.
    attempts: u32,
    cancelled: bool,
    /// Armed one-shot for the next retry, if any.
    retry_alarm: Option<AbortHandle>,
}

impl PollTask {
    #[must_use]
    pub fn new(id: TaskId, kind: PollKind, contacts: Vec<ContactSnapshot>) -> Self {
        Self {
            id,
            kind,
            contacts,
            attempts: 0,
            cancelled: false,
            retry_alarm: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> PollKind {
        self.kind
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    #[must_use]
    pub fn contacts(&self) -> &[ContactSnapshot] {
        &self.contacts
    }

    /// Numbers carried by this task, in batch order.
    #[must_use]
    pub fn numbers(&self) -> Vec<PhoneNumber> {
        self.contacts.iter().map(|c| c.number.clone()).collect()
    }

    #[must_use]
    pub fn contains_number(&self, number: &PhoneNumber) -> bool {
        self.contacts.iter().any(|c| &c.number == number)
    }

    /// Mark cancelled. Cooperative: an in-flight execution runs to its
    /// terminal signal; the flag is honored at the next retry decision.
    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Decide the fate of the task after a transient failure.
    pub fn next_retry(&mut self) -> RetryDecision {
        if self.cancelled {
            return RetryDecision::Cancelled;
        }
        self.attempts += 1;
        if self.attempts > self.kind.total_retries() {
            return RetryDecision::Exhausted;
        }
        // U, 2U, 4U, ... — pure exponential, no jitter at this layer.
        let factor = 1u32 << (self.attempts - 1);
        RetryDecision::Backoff(self.kind.backoff_unit().saturating_mul(factor))
    }

    /// Remember the armed retry alarm so completion or cancellation can
    /// disarm it.
    pub fn set_retry_alarm(&mut self, handle: AbortHandle) {
        debug_assert!(self.retry_alarm.is_none(), "{}: retry alarm already armed", self.id);
        self.retry_alarm = Some(handle);
    }

    #[must_use]
    pub fn has_retry_alarm(&self) -> bool {
        self.retry_alarm.is_some()
    }

    /// Disarm a pending retry alarm, if any.
    pub fn clear_retry_alarm(&mut self) {
        if let Some(handle) = self.retry_alarm.take() {
            handle.abort();
        }
    }

    /// Forget a retry alarm that already fired, without aborting it.
    pub fn take_fired_alarm(&mut self) {
        self.retry_alarm = None;
    }
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.clear_retry_alarm();
    }
}
