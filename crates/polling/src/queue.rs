//! Priority-ordered poll task queue.
//!
//! Turns a raw contact list into bounded-size tasks, drops contacts that are
//! already in flight, and serializes execution: at most one task executes at
//! a time, always the head. The queue is plain data owned by the scheduler
//! actor — operations mutate state synchronously and return [`QueueEffect`]s
//! for the actor to interpret (spawn an execution, arm a retry alarm,
//! schedule a verify pass), which keeps every ordering rule unit-testable
//! without a runtime.

use std::collections::HashSet;
use std::collections::VecDeque;

use presence_core::{ContactSnapshot, PhoneNumber};
use tracing::{debug, info, warn};

use crate::executor::BatchOutcome;
use crate::task::{PollKind, PollTask, RetryDecision, TaskId};

/// Instructions emitted by queue operations for the owning actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEffect {
    /// Spawn a batch execution for this task.
    Execute(TaskId),
    /// Arm a one-shot retry alarm for this task.
    ArmRetry {
        task: TaskId,
        delay: std::time::Duration,
    },
    /// Ask the scheduler for a confirmation pass; `count` is the verify
    /// counter value driving the exponential delay.
    ScheduleVerify { count: u32 },
    /// Refresh these records' last-update stamps so exhausted batches are
    /// not immediately re-selected as most stale.
    TouchRecords(Vec<PhoneNumber>),
}

/// Ordered multi-task queue with de-duplication and priority preemption.
#[derive(Debug)]
pub struct PollQueue {
    tasks: VecDeque<PollTask>,
    next_id: u64,
    /// Task currently running its batch, if any. Always the task that was
    /// at the head when execution started.
    executing: Option<TaskId>,
    max_entries: usize,
    /// Set when a task drained without a clean completion; consumed when
    /// the queue empties.
    verify_pending: bool,
    /// Grows with each incomplete drain, resets on a clean completion.
    verify_count: u32,
}

impl PollQueue {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            tasks: VecDeque::new(),
            next_id: 0,
            executing: None,
            max_entries,
            verify_pending: false,
            verify_count: 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn executing(&self) -> Option<TaskId> {
        self.executing
    }

    #[must_use]
    pub fn verify_count(&self) -> u32 {
        self.verify_count
    }

    /// Tasks in queue order.
    pub fn tasks(&self) -> impl Iterator<Item = &PollTask> {
        self.tasks.iter()
    }

    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<&PollTask> {
        self.tasks.iter().find(|t| t.id() == id)
    }

    /// The batch size cap follows configuration reloads.
    pub fn set_max_entries(&mut self, max_entries: usize) {
        if max_entries > 0 {
            self.max_entries = max_entries;
        }
    }

    /// Store the armed retry alarm on its task.
    pub fn set_retry_alarm(&mut self, id: TaskId, handle: tokio::task::AbortHandle) {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.id() == id) {
            task.set_retry_alarm(handle);
        } else {
            // The task finished between emitting ArmRetry and arming.
            handle.abort();
        }
    }

    /// Enqueue a contact batch.
    ///
    /// Contacts already queued (case-insensitive canonical-number equality)
    /// are dropped silently; a batch containing any never-polled record is
    /// upgraded to [`PollKind::NewContacts`]; the survivors are split into
    /// tasks of at most the configured batch size and inserted by priority.
    pub fn add(&mut self, kind: PollKind, contacts: Vec<ContactSnapshot>) -> Vec<QueueEffect> {
        let mut seen: HashSet<PhoneNumber> = self
            .tasks
            .iter()
            .flat_map(|t| t.contacts().iter().map(|c| c.number.clone()))
            .collect();

        let mut kind = kind;
        let mut fresh = Vec::new();
        for contact in contacts {
            if !seen.insert(contact.number.clone()) {
                debug!(number = %contact.number, "contact already in flight, dropped");
                continue;
            }
            if contact.last_update.is_zero() {
                // Brand-new contacts always get the faster-retry treatment.
                kind = PollKind::NewContacts;
            }
            fresh.push(contact);
        }
        if fresh.is_empty() {
            return Vec::new();
        }

        let was_empty = self.tasks.is_empty();
        let mut effects = Vec::new();
        let chunks: Vec<Vec<ContactSnapshot>> = fresh
            .chunks(self.max_entries)
            .map(<[ContactSnapshot]>::to_vec)
            .collect();
        for chunk in chunks {
            let id = self.allocate_id();
            let task = PollTask::new(id, kind, chunk);
            info!(task = %id, %kind, entries = task.contacts().len(), "task queued");
            effects.extend(self.insert_by_priority(task));
        }

        if was_empty {
            effects.extend(self.start_head());
        }
        effects
    }

    /// A task's batch execution reached its terminal outcome.
    pub fn on_batch_outcome(&mut self, id: TaskId, outcome: BatchOutcome) -> Vec<QueueEffect> {
        if self.task(id).is_none() {
            // Cleared while the batch was in flight.
            debug!(task = %id, ?outcome, "outcome for a task no longer queued, dropped");
            return Vec::new();
        }
        if self.executing == Some(id) {
            self.executing = None;
        }

        match outcome {
            BatchOutcome::FullyUpdated => self.finish(id, true),
            BatchOutcome::TemporaryError => self.retry(id),
            BatchOutcome::Incomplete
            | BatchOutcome::ServiceUnavailable
            | BatchOutcome::Error { .. } => {
                if let BatchOutcome::Error { code } = outcome {
                    warn!(task = %id, %code, "hard batch failure, finishing incomplete");
                }
                self.finish(id, false)
            }
        }
    }

    /// A retry alarm fired.
    pub fn retry_due(&mut self, id: TaskId) -> Vec<QueueEffect> {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id() == id) else {
            // A stale alarm racing a completed task. Guessing another task
            // to re-execute could double-poll a healthy batch; drop it and
            // let the verify pass cover anything genuinely missed.
            warn!(task = %id, "retry alarm for an unknown task, ignoring");
            return Vec::new();
        };
        task.take_fired_alarm();
        if task.is_cancelled() {
            return self.finish(id, false);
        }
        debug_assert_eq!(
            self.tasks.front().map(PollTask::id),
            Some(id),
            "retry target should be the head task"
        );
        self.executing = Some(id);
        vec![QueueEffect::Execute(id)]
    }

    /// Cancel one task. Cooperative: an executing task keeps its network
    /// wait and is finished when the outcome arrives; a retry-scheduled
    /// task finishes incomplete immediately.
    pub fn cancel(&mut self, id: TaskId) -> Vec<QueueEffect> {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id() == id) else {
            return Vec::new();
        };
        task.mark_cancelled();
        info!(task = %id, "task cancelled");
        if self.executing == Some(id) {
            // Free the execution slot; the in-flight outcome is discarded
            // when it lands.
            self.executing = None;
            Vec::new()
        } else if task.has_retry_alarm() {
            task.clear_retry_alarm();
            self.finish(id, false)
        } else {
            Vec::new()
        }
    }

    /// Empty the queue without running pending tasks.
    pub fn clear(&mut self) {
        if !self.tasks.is_empty() {
            info!(dropped = self.tasks.len(), "queue cleared");
        }
        // Dropping the tasks disarms their retry alarms.
        self.tasks.clear();
        self.executing = None;
        self.verify_pending = false;
    }

    fn allocate_id(&mut self) -> TaskId {
        self.next_id += 1;
        TaskId(self.next_id)
    }

    /// Insert ahead of the first strictly-lower-priority task. Displacing
    /// the head cancels whatever occupied it, so the newcomer runs next.
    fn insert_by_priority(&mut self, task: PollTask) -> Vec<QueueEffect> {
        let position = self
            .tasks
            .iter()
            .position(|queued| queued.kind().priority() < task.kind().priority())
            .unwrap_or(self.tasks.len());
        let id = task.id();
        self.tasks.insert(position, task);

        let mut effects = Vec::new();
        if position == 0 && self.tasks.len() > 1 {
            let displaced = self.tasks[1].id();
            debug!(new = %id, %displaced, "head displaced by higher priority task");
            effects.extend(self.cancel(displaced));
            effects.extend(self.start_head());
        }
        effects
    }

    /// Begin executing the head task if nothing is executing.
    fn start_head(&mut self) -> Vec<QueueEffect> {
        if self.executing.is_some() {
            return Vec::new();
        }
        match self.tasks.front() {
            Some(head) if !head.is_cancelled() => {
                let id = head.id();
                self.executing = Some(id);
                vec![QueueEffect::Execute(id)]
            }
            // A cancelled head still awaits its in-flight outcome; it will
            // advance the queue when that lands.
            _ => Vec::new(),
        }
    }

    /// Transient failure: consume a retry or force completion.
    fn retry(&mut self, id: TaskId) -> Vec<QueueEffect> {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id() == id) else {
            return Vec::new();
        };
        match task.next_retry() {
            RetryDecision::Backoff(delay) => {
                debug!(task = %id, attempt = task.attempts(), ?delay, "retry scheduled");
                vec![QueueEffect::ArmRetry { task: id, delay }]
            }
            RetryDecision::Exhausted => {
                info!(task = %id, "retries exhausted, finishing incomplete");
                let numbers = task.numbers();
                let mut effects = vec![QueueEffect::TouchRecords(numbers)];
                effects.extend(self.finish(id, false));
                effects
            }
            RetryDecision::Cancelled => self.finish(id, false),
        }
    }

    /// Remove a task and advance.
    ///
    /// A clean completion resets the verify counter; anything else flags a
    /// verify pass. When the queue drains with the flag set, the counter
    /// grows and the actor is asked to schedule a confirmation pass.
    fn finish(&mut self, id: TaskId, clean: bool) -> Vec<QueueEffect> {
        let Some(position) = self.tasks.iter().position(|t| t.id() == id) else {
            return Vec::new();
        };
        let Some(mut task) = self.tasks.remove(position) else {
            return Vec::new();
        };
        task.clear_retry_alarm();
        if self.executing == Some(id) {
            self.executing = None;
        }
        info!(task = %id, clean, "task finished");

        if clean {
            self.verify_pending = false;
            self.verify_count = 0;
        } else {
            self.verify_pending = true;
        }

        if self.tasks.is_empty() {
            if self.verify_pending {
                self.verify_pending = false;
                self.verify_count += 1;
                return vec![QueueEffect::ScheduleVerify {
                    count: self.verify_count,
                }];
            }
            return Vec::new();
        }
        self.start_head()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::{ReasonCode, Timestamp};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::time::Duration;

    fn snapshot(number: &str, last_update: i64) -> ContactSnapshot {
        ContactSnapshot {
            number: number.parse().unwrap(),
            last_update: Timestamp::from_millis(last_update),
            capability_updates: Default::default(),
        }
    }

    fn snapshots(count: usize) -> Vec<ContactSnapshot> {
        (0..count)
            .map(|i| snapshot(&format!("+1650555{i:04}"), 1))
            .collect()
    }

    fn queue() -> PollQueue {
        PollQueue::new(100)
    }

    #[test]
    fn adding_to_an_empty_queue_starts_execution() {
        let mut q = queue();
        let effects = q.add(PollKind::Normal, snapshots(3));
        assert_eq!(effects, vec![QueueEffect::Execute(TaskId(1))]);
        assert_eq!(q.executing(), Some(TaskId(1)));
    }

    #[test]
    fn empty_add_is_a_no_op() {
        let mut q = queue();
        assert_eq!(q.add(PollKind::Normal, Vec::new()), Vec::new());
        assert!(q.is_empty());
    }

    #[test]
    fn in_flight_contacts_are_not_enqueued_twice() {
        let mut q = queue();
        q.add(PollKind::Normal, vec![snapshot("+16505550100", 1)]);
        let effects = q.add(
            PollKind::Normal,
            vec![snapshot("+1 (650) 555-0100", 1), snapshot("+16505550101", 1)],
        );
        // Only the genuinely new contact formed a task.
        assert_eq!(q.len(), 2);
        let second = q.task(TaskId(2)).unwrap();
        assert_eq!(second.contacts().len(), 1);
        assert_eq!(second.contacts()[0].number.as_str(), "+16505550101");
        // Head keeps executing; no new execution started.
        assert_eq!(effects, Vec::new());
    }

    #[test]
    fn duplicates_within_one_add_collapse() {
        let mut q = queue();
        q.add(
            PollKind::Normal,
            vec![snapshot("+16505550100", 1), snapshot("650-555-0100", 1)],
        );
        assert_eq!(q.task(TaskId(1)).unwrap().contacts().len(), 1);
    }

    #[rstest]
    #[case(250, 100, 3)]
    #[case(100, 100, 1)]
    #[case(101, 100, 2)]
    #[case(1, 100, 1)]
    #[case(7, 3, 3)]
    fn oversized_batches_split(#[case] n: usize, #[case] cap: usize, #[case] tasks: usize) {
        let mut q = PollQueue::new(cap);
        q.add(PollKind::Normal, snapshots(n));
        assert_eq!(q.len(), tasks);
        let total: usize = q.tasks().map(|t| t.contacts().len()).sum();
        assert_eq!(total, n);
        assert!(q.tasks().all(|t| t.contacts().len() <= cap));
    }

    #[test]
    fn split_preserves_the_union_of_entries() {
        let mut q = PollQueue::new(2);
        let input = snapshots(5);
        let expected: HashSet<PhoneNumber> =
            input.iter().map(|c| c.number.clone()).collect();
        q.add(PollKind::Normal, input);
        let queued: HashSet<PhoneNumber> = q
            .tasks()
            .flat_map(|t| t.contacts().iter().map(|c| c.number.clone()))
            .collect();
        assert_eq!(queued, expected);
    }

    #[test]
    fn never_polled_record_upgrades_the_batch() {
        let mut q = queue();
        q.add(
            PollKind::Normal,
            vec![snapshot("+16505550100", 1), snapshot("+16505550101", 0)],
        );
        let task = q.task(TaskId(1)).unwrap();
        assert_eq!(task.kind(), PollKind::NewContacts);
        assert_eq!(task.kind().total_retries(), 4);
        assert_eq!(task.kind().backoff_unit(), Duration::from_secs(60));
    }

    #[test]
    fn queue_order_is_non_increasing_priority_and_fifo_within_equal() {
        let mut q = queue();
        q.add(PollKind::Normal, vec![snapshot("+16505550100", 1)]);
        q.add(PollKind::Normal, vec![snapshot("+16505550101", 1)]);
        q.add(PollKind::NewContacts, vec![snapshot("+16505550102", 0)]);
        q.add(PollKind::NewContacts, vec![snapshot("+16505550103", 0)]);
        q.add(PollKind::Normal, vec![snapshot("+16505550104", 1)]);

        let order: Vec<(PollKind, &str)> = q
            .tasks()
            .map(|t| (t.kind(), t.contacts()[0].number.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (PollKind::NewContacts, "+16505550102"),
                (PollKind::NewContacts, "+16505550103"),
                (PollKind::Normal, "+16505550100"),
                (PollKind::Normal, "+16505550101"),
                (PollKind::Normal, "+16505550104"),
            ]
        );
        let priorities: Vec<u8> = q.tasks().map(|t| t.kind().priority()).collect();
        assert!(priorities.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn higher_priority_add_preempts_the_executing_head() {
        let mut q = queue();
        q.add(PollKind::Normal, vec![snapshot("+16505550100", 1)]);
        assert_eq!(q.executing(), Some(TaskId(1)));

        let effects = q.add(PollKind::NewContacts, vec![snapshot("+16505550101", 0)]);
        // B runs immediately; A is cancelled but stays queued until its
        // in-flight outcome lands.
        assert_eq!(effects, vec![QueueEffect::Execute(TaskId(2))]);
        assert_eq!(q.executing(), Some(TaskId(2)));
        assert!(q.task(TaskId(1)).unwrap().is_cancelled());
        assert_eq!(q.len(), 2);

        // A's late outcome finishes it incomplete without advancing B.
        let effects = q.on_batch_outcome(TaskId(1), BatchOutcome::Incomplete);
        assert_eq!(effects, Vec::new());
        assert_eq!(q.len(), 1);
        assert_eq!(q.executing(), Some(TaskId(2)));
    }

    #[tokio::test]
    async fn preempting_a_retry_scheduled_head_finishes_it_immediately() {
        let mut q = queue();
        q.add(PollKind::Normal, vec![snapshot("+16505550100", 1)]);
        let effects = q.on_batch_outcome(TaskId(1), BatchOutcome::TemporaryError);
        assert_eq!(
            effects,
            vec![QueueEffect::ArmRetry {
                task: TaskId(1),
                delay: Duration::from_secs(1_800),
            }]
        );
        // Simulate the armed alarm.
        let armed = tokio::spawn(std::future::pending::<()>()).abort_handle();
        q.set_retry_alarm(TaskId(1), armed);

        let effects = q.add(PollKind::NewContacts, vec![snapshot("+16505550101", 0)]);
        // The displaced head had no in-flight batch; it finishes incomplete
        // on the spot and the newcomer executes.
        assert!(q.task(TaskId(1)).is_none());
        assert!(effects.contains(&QueueEffect::Execute(TaskId(2))));
        assert_eq!(q.executing(), Some(TaskId(2)));
    }

    #[test]
    fn clean_completion_advances_to_the_next_task() {
        let mut q = queue();
        q.add(PollKind::Normal, vec![snapshot("+16505550100", 1)]);
        q.add(PollKind::Normal, vec![snapshot("+16505550101", 1)]);

        let effects = q.on_batch_outcome(TaskId(1), BatchOutcome::FullyUpdated);
        assert_eq!(effects, vec![QueueEffect::Execute(TaskId(2))]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.verify_count(), 0);
    }

    #[test]
    fn incomplete_drain_schedules_a_verify_pass() {
        let mut q = queue();
        q.add(PollKind::Normal, vec![snapshot("+16505550100", 1)]);
        let effects = q.on_batch_outcome(TaskId(1), BatchOutcome::Incomplete);
        assert_eq!(effects, vec![QueueEffect::ScheduleVerify { count: 1 }]);
    }

    #[test]
    fn verify_counter_grows_until_a_clean_completion() {
        let mut q = queue();
        for round in 1..=3u32 {
            q.add(PollKind::Normal, vec![snapshot("+16505550100", 1)]);
            let id = TaskId(u64::from(round));
            let effects = q.on_batch_outcome(id, BatchOutcome::Incomplete);
            assert_eq!(effects, vec![QueueEffect::ScheduleVerify { count: round }]);
        }

        q.add(PollKind::Normal, vec![snapshot("+16505550100", 1)]);
        let effects = q.on_batch_outcome(TaskId(4), BatchOutcome::FullyUpdated);
        assert_eq!(effects, Vec::new());
        assert_eq!(q.verify_count(), 0);
    }

    #[test]
    fn temporary_error_walks_the_backoff_ladder_then_exhausts() {
        let mut q = queue();
        q.add(PollKind::NewContacts, vec![snapshot("+16505550100", 0)]);
        let unit = Duration::from_secs(60);

        for attempt in 0..4u32 {
            let effects = q.on_batch_outcome(TaskId(1), BatchOutcome::TemporaryError);
            assert_eq!(
                effects,
                vec![QueueEffect::ArmRetry {
                    task: TaskId(1),
                    delay: unit * (1u32 << attempt),
                }]
            );
            let effects = q.retry_due(TaskId(1));
            assert_eq!(effects, vec![QueueEffect::Execute(TaskId(1))]);
        }

        // Fifth failure exceeds the grant: timestamps refresh, task leaves.
        let effects = q.on_batch_outcome(TaskId(1), BatchOutcome::TemporaryError);
        assert_eq!(
            effects,
            vec![
                QueueEffect::TouchRecords(vec!["+16505550100".parse().unwrap()]),
                QueueEffect::ScheduleVerify { count: 1 },
            ]
        );
        assert!(q.is_empty());
    }

    #[test]
    fn hard_error_finishes_without_consuming_retries() {
        let mut q = queue();
        q.add(PollKind::Normal, vec![snapshot("+16505550100", 1)]);
        let effects = q.on_batch_outcome(
            TaskId(1),
            BatchOutcome::Error { code: ReasonCode::FORBIDDEN },
        );
        assert_eq!(effects, vec![QueueEffect::ScheduleVerify { count: 1 }]);
        assert!(q.is_empty());
    }

    #[test]
    fn service_unavailable_finishes_incomplete() {
        let mut q = queue();
        q.add(PollKind::Normal, vec![snapshot("+16505550100", 1)]);
        let effects = q.on_batch_outcome(TaskId(1), BatchOutcome::ServiceUnavailable);
        assert_eq!(effects, vec![QueueEffect::ScheduleVerify { count: 1 }]);
    }

    #[test]
    fn stale_retry_alarm_is_a_no_op() {
        let mut q = queue();
        q.add(PollKind::Normal, vec![snapshot("+16505550100", 1)]);
        assert_eq!(q.retry_due(TaskId(99)), Vec::new());
        assert_eq!(q.executing(), Some(TaskId(1)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn outcome_for_a_cleared_task_is_dropped() {
        let mut q = queue();
        q.add(PollKind::Normal, vec![snapshot("+16505550100", 1)]);
        q.clear();
        assert!(q.is_empty());
        let effects = q.on_batch_outcome(TaskId(1), BatchOutcome::FullyUpdated);
        assert_eq!(effects, Vec::new());
    }

    #[test]
    fn clear_forgets_verify_pending_but_keeps_the_counter() {
        let mut q = queue();
        q.add(PollKind::Normal, vec![snapshot("+16505550100", 1)]);
        q.on_batch_outcome(TaskId(1), BatchOutcome::Incomplete);
        assert_eq!(q.verify_count(), 1);

        q.add(PollKind::Normal, vec![snapshot("+16505550101", 1)]);
        q.clear();
        // Counter persists until a clean completion resets it.
        assert_eq!(q.verify_count(), 1);
    }

    #[test]
    fn task_ids_are_monotonic() {
        let mut q = PollQueue::new(1);
        q.add(PollKind::Normal, snapshots(3));
        let ids: Vec<u64> = q.tasks().map(|t| t.id().0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
