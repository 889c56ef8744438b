//! Task view state and optimistic start/stop reconciliation.
//!
//! Every write to a task (push, optimistic write, mutation resolution, and a
//! refetch of an idle task) stamps it with a fresh revision from a
//! board-wide counter. A mutation remembers the revision of its own
//! speculative write; when the confirming request resolves, the keep/revert
//! decision is applied only if the task still carries that revision. A
//! `task_status_changed` push written in between is authoritative and stays.
//! A refetch never supersedes an in-flight mutation.

use crate::api::{ApiError, MutationAck, TaskApi};
use crate::dispatch::{handler, EventDispatcher, Subscription};
use flip_core::{SyncEvent, Task, EVENT_CONNECT, EVENT_TASKS_UPDATED, EVENT_TASK_STATUS_CHANGED};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingOperation {
    #[default]
    None,
    Starting,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    Start,
    Stop,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::Start => "start",
            TaskAction::Stop => "stop",
        }
    }

    fn pending(self) -> PendingOperation {
        match self {
            TaskAction::Start => PendingOperation::Starting,
            TaskAction::Stop => PendingOperation::Stopping,
        }
    }

    fn speculative_value(self) -> bool {
        matches!(self, TaskAction::Start)
    }
}

/// A task as the dashboard renders it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskView {
    pub task: Task,
    pub pending: PendingOperation,
    pub revision: u64,
}

impl TaskView {
    pub fn id(&self) -> i64 {
        self.task.id
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running
    }
}

/// Handle for one in-flight mutation, returned by [`TaskBoard::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationTicket {
    pub id: i64,
    pub action: TaskAction,
    revision: u64,
    previous: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum MutationOutcome<'a> {
    Confirmed(&'a MutationAck),
    Failed,
    /// The caller went away before the request resolved. Treated like a
    /// failure: the speculative value is rolled back if still current.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Speculative value kept, or replaced by the value the response carried.
    Confirmed,
    /// Speculative value rolled back to the pre-mutation value.
    Reverted,
    /// A newer write landed mid-flight; only `pending` was cleared.
    Superseded,
    Abandoned,
    /// The task left the list while the request was in flight.
    Vanished,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error("task {id} already has an operation in flight")]
    Busy { id: i64 },
    #[error("task {id} is not in the task list")]
    UnknownTask { id: i64 },
    #[error("{0}")]
    Rejected(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl From<ApiError> for MutationError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Rejected { reason, .. } => MutationError::Rejected(reason),
            ApiError::Transport(reason) | ApiError::Decode(reason) => {
                MutationError::Request(reason)
            }
        }
    }
}

#[derive(Debug, Default)]
struct BoardState {
    entries: Vec<TaskView>,
    revision: u64,
}

impl BoardState {
    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn position(&self, id: i64) -> Option<usize> {
        self.entries.iter().position(|entry| entry.task.id == id)
    }
}

/// Shared task list. Cloning yields another handle to the same state.
#[derive(Debug, Clone, Default)]
pub struct TaskBoard {
    state: Arc<Mutex<BoardState>>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Vec<TaskView> {
        self.lock().entries.clone()
    }

    pub fn get(&self, id: i64) -> Option<TaskView> {
        let state = self.lock();
        state.position(id).map(|idx| state.entries[idx].clone())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Latest revision handed out by this board.
    pub fn current_revision(&self) -> u64 {
        self.lock().revision
    }

    /// Replace the list with a full refetch, in server order. Tasks with a
    /// mutation in flight keep `pending`, `is_running` and revision.
    pub fn replace_all(&self, tasks: Vec<Task>) {
        self.replace_all_since(tasks, None);
    }

    /// Like [`replace_all`](Self::replace_all), but tasks written after
    /// `fetched_at` (a value of [`current_revision`](Self::current_revision)
    /// taken when the fetch began) keep their newer local `is_running`.
    pub fn replace_all_since(&self, tasks: Vec<Task>, fetched_at: Option<u64>) {
        let mut state = self.lock();
        let mut previous: HashMap<i64, TaskView> = state
            .entries
            .drain(..)
            .map(|entry| (entry.task.id, entry))
            .collect();

        let mut entries = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            let prior = previous.remove(&task.id);
            let pending = prior.as_ref().map(|entry| entry.pending).unwrap_or_default();
            // A refetch is not a confirmation: an entry with a mutation in
            // flight keeps its value and revision so the response can still
            // settle it. Pushes bump the revision and stay authoritative.
            let newer_local = match (&prior, fetched_at) {
                (Some(entry), _) if entry.pending != PendingOperation::None => Some(entry),
                (Some(entry), Some(fetched_at)) if entry.revision > fetched_at => Some(entry),
                _ => None,
            };
            let revision = match newer_local {
                Some(entry) => {
                    task.is_running = entry.task.is_running;
                    entry.revision
                }
                None => state.bump(),
            };
            entries.push(TaskView {
                task,
                pending,
                revision,
            });
        }

        for (id, entry) in previous {
            if entry.pending != PendingOperation::None {
                debug!(event = "task_removed_while_pending", id);
            }
        }
        debug!(event = "task_list_replaced", count = entries.len());
        state.entries = entries;
    }

    /// Apply an authoritative `task_status_changed` push. Always wins over a
    /// speculative value, even while a mutation is in flight.
    pub fn apply_status(&self, id: i64, is_running: bool) -> bool {
        let mut state = self.lock();
        let Some(idx) = state.position(id) else {
            debug!(event = "task_status_for_unknown_task", id, is_running);
            return false;
        };
        let revision = state.bump();
        let entry = &mut state.entries[idx];
        if entry.pending != PendingOperation::None && entry.task.is_running != is_running {
            info!(
                event = "task_push_overrides_optimistic",
                id,
                is_running,
                pending = ?entry.pending
            );
        }
        entry.task.is_running = is_running;
        entry.revision = revision;
        true
    }

    /// Write the speculative value for `action` and mark the task pending.
    /// At most one mutation per task may be in flight.
    pub fn begin(&self, id: i64, action: TaskAction) -> Result<MutationTicket, MutationError> {
        let mut state = self.lock();
        let idx = state.position(id).ok_or(MutationError::UnknownTask { id })?;
        if state.entries[idx].pending != PendingOperation::None {
            return Err(MutationError::Busy { id });
        }
        let revision = state.bump();
        let entry = &mut state.entries[idx];
        let previous = entry.task.is_running;
        entry.pending = action.pending();
        entry.task.is_running = action.speculative_value();
        entry.revision = revision;
        Ok(MutationTicket {
            id,
            action,
            revision,
            previous,
        })
    }

    /// Settle a mutation. `pending` always returns to `None`; `is_running`
    /// is only touched when no newer write has landed since `begin`.
    pub fn resolve(&self, ticket: &MutationTicket, outcome: MutationOutcome<'_>) -> Resolution {
        let mut state = self.lock();
        let Some(idx) = state.position(ticket.id) else {
            return Resolution::Vanished;
        };
        let superseded = state.entries[idx].revision != ticket.revision;
        let revision = state.bump();
        let entry = &mut state.entries[idx];
        entry.pending = PendingOperation::None;
        entry.revision = revision;

        if superseded {
            return Resolution::Superseded;
        }
        match outcome {
            MutationOutcome::Confirmed(ack) => {
                if let Some(confirmed) = ack.is_running {
                    entry.task.is_running = confirmed;
                }
                Resolution::Confirmed
            }
            MutationOutcome::Failed => {
                entry.task.is_running = ticket.previous;
                Resolution::Reverted
            }
            MutationOutcome::Abandoned => {
                // Nobody will learn the outcome; drop the unconfirmed value.
                entry.task.is_running = ticket.previous;
                Resolution::Abandoned
            }
        }
    }
}

/// Clears `pending` if a mutation future is dropped before it resolves.
struct TicketGuard<'a> {
    board: &'a TaskBoard,
    ticket: Option<MutationTicket>,
}

impl TicketGuard<'_> {
    fn disarm(&mut self) {
        self.ticket = None;
    }
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.board.resolve(&ticket, MutationOutcome::Abandoned);
        }
    }
}

/// Runs start/stop mutations against the API and reconciles the board.
#[derive(Clone)]
pub struct TaskCoordinator {
    board: TaskBoard,
    api: Arc<dyn TaskApi>,
}

impl TaskCoordinator {
    pub fn new(board: TaskBoard, api: Arc<dyn TaskApi>) -> Self {
        Self { board, api }
    }

    pub fn board(&self) -> &TaskBoard {
        &self.board
    }

    pub async fn start_task(&self, id: i64) -> Result<(), MutationError> {
        self.mutate(id, TaskAction::Start).await
    }

    pub async fn stop_task(&self, id: i64) -> Result<(), MutationError> {
        self.mutate(id, TaskAction::Stop).await
    }

    async fn mutate(&self, id: i64, action: TaskAction) -> Result<(), MutationError> {
        let ticket = self.board.begin(id, action)?;
        let mut guard = TicketGuard {
            board: &self.board,
            ticket: Some(ticket.clone()),
        };

        let result = match action {
            TaskAction::Start => self.api.start_task(id).await,
            TaskAction::Stop => self.api.stop_task(id).await,
        };
        guard.disarm();

        match result {
            Ok(ack) => {
                let resolution = self.board.resolve(&ticket, MutationOutcome::Confirmed(&ack));
                info!(
                    event = "task_mutation_confirmed",
                    id,
                    action = action.as_str(),
                    resolution = ?resolution
                );
                Ok(())
            }
            Err(err) => {
                let resolution = self.board.resolve(&ticket, MutationOutcome::Failed);
                warn!(
                    event = "task_mutation_failed",
                    id,
                    action = action.as_str(),
                    error = %err,
                    resolution = ?resolution
                );
                Err(err.into())
            }
        }
    }

    /// Refetch the full task list into the board.
    pub async fn refresh(&self) -> Result<usize, ApiError> {
        let fetched_at = self.board.current_revision();
        let tasks = self.api.list_tasks().await?;
        let count = tasks.len();
        self.board.replace_all_since(tasks, Some(fetched_at));
        Ok(count)
    }

    /// Subscribe the board to push events: `task_status_changed` is applied
    /// directly; `tasks_updated` and `connect` queue a refetch. Refetch
    /// requests coalesce so at most one is waiting behind a running one.
    pub fn bind(&self, dispatcher: &EventDispatcher) -> TaskBindings {
        let (refresh_tx, mut refresh_rx) = mpsc::channel::<()>(1);

        let status_board = self.board.clone();
        let status = dispatcher.subscribe(
            EVENT_TASK_STATUS_CHANGED,
            handler(move |event| {
                if let SyncEvent::TaskStatusChanged(change) = event {
                    status_board.apply_status(change.id, change.is_running);
                }
            }),
        );

        let request_refresh = handler(move |_| {
            let _ = refresh_tx.try_send(());
        });
        let updated = dispatcher.subscribe(EVENT_TASKS_UPDATED, request_refresh.clone());
        let connected = dispatcher.subscribe(EVENT_CONNECT, request_refresh);

        let coordinator = self.clone();
        let refresher = tokio::spawn(async move {
            while refresh_rx.recv().await.is_some() {
                match coordinator.refresh().await {
                    Ok(count) => debug!(event = "task_refresh_done", count),
                    Err(err) => warn!(event = "task_refresh_failed", error = %err),
                }
            }
        });

        TaskBindings {
            _subscriptions: vec![status, updated, connected],
            refresher,
        }
    }
}

/// Keeps a board bound to a dispatcher; dropping it unbinds.
pub struct TaskBindings {
    _subscriptions: Vec<Subscription>,
    refresher: JoinHandle<()>,
}

impl Drop for TaskBindings {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flip_core::TaskStatusChanged;
    use tokio::sync::oneshot;

    type Reply = Result<MutationAck, ApiError>;

    #[derive(Default)]
    struct ScriptedApi {
        tasks: Mutex<Vec<Task>>,
        next_reply: Mutex<Option<oneshot::Receiver<Reply>>>,
        calls: Mutex<Vec<(TaskAction, i64)>>,
    }

    impl ScriptedApi {
        fn hold_reply(&self) -> oneshot::Sender<Reply> {
            let (tx, rx) = oneshot::channel();
            *self.next_reply.lock().expect("reply") = Some(rx);
            tx
        }

        async fn reply(&self, action: TaskAction, id: i64) -> Reply {
            self.calls.lock().expect("calls").push((action, id));
            let rx = self.next_reply.lock().expect("reply").take();
            match rx {
                Some(rx) => rx
                    .await
                    .unwrap_or_else(|_| Err(ApiError::Transport("reply dropped".to_string()))),
                None => Ok(MutationAck::default()),
            }
        }
    }

    #[async_trait]
    impl TaskApi for ScriptedApi {
        async fn list_tasks(&self) -> Result<Vec<Task>, ApiError> {
            Ok(self.tasks.lock().expect("tasks").clone())
        }

        async fn start_task(&self, id: i64) -> Reply {
            self.reply(TaskAction::Start, id).await
        }

        async fn stop_task(&self, id: i64) -> Reply {
            self.reply(TaskAction::Stop, id).await
        }
    }

    fn board_with(tasks: &[(i64, bool)]) -> TaskBoard {
        let board = TaskBoard::new();
        board.replace_all(
            tasks
                .iter()
                .map(|(id, running)| Task::new(*id, format!("task-{id}"), *running))
                .collect(),
        );
        board
    }

    async fn wait_for_pending(board: &TaskBoard, id: i64, expected: PendingOperation) {
        for _ in 0..1_000 {
            if board.get(id).map(|view| view.pending) == Some(expected) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("task {id} never reached {expected:?}");
    }

    fn coordinator(board: &TaskBoard) -> (TaskCoordinator, Arc<ScriptedApi>) {
        let api = Arc::new(ScriptedApi::default());
        (TaskCoordinator::new(board.clone(), api.clone()), api)
    }

    #[tokio::test]
    async fn start_applies_immediately_and_stays_after_success() {
        let board = board_with(&[(5, false)]);
        let (coordinator, api) = coordinator(&board);
        let reply = api.hold_reply();

        let in_flight = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.start_task(5).await }
        });
        wait_for_pending(&board, 5, PendingOperation::Starting).await;
        assert!(board.get(5).expect("task").is_running());

        reply.send(Ok(MutationAck::default())).expect("send reply");
        in_flight.await.expect("join").expect("start ok");

        let view = board.get(5).expect("task");
        assert!(view.is_running());
        assert_eq!(view.pending, PendingOperation::None);
        assert_eq!(*api.calls.lock().expect("calls"), vec![(TaskAction::Start, 5)]);
    }

    #[tokio::test]
    async fn failed_start_reverts_and_reports() {
        let board = board_with(&[(5, false)]);
        let (coordinator, api) = coordinator(&board);
        let reply = api.hold_reply();

        let in_flight = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.start_task(5).await }
        });
        wait_for_pending(&board, 5, PendingOperation::Starting).await;
        assert!(board.get(5).expect("task").is_running());

        reply
            .send(Err(ApiError::Rejected {
                status: 409,
                reason: "crawler quota exhausted".to_string(),
            }))
            .expect("send reply");
        let err = in_flight.await.expect("join").expect_err("start must fail");
        assert_eq!(
            err,
            MutationError::Rejected("crawler quota exhausted".to_string())
        );

        let view = board.get(5).expect("task");
        assert!(!view.is_running());
        assert_eq!(view.pending, PendingOperation::None);
    }

    #[tokio::test]
    async fn push_mid_flight_is_not_clobbered_by_stale_success() {
        let board = board_with(&[(5, false)]);
        let (coordinator, api) = coordinator(&board);
        let reply = api.hold_reply();

        let in_flight = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.start_task(5).await }
        });
        wait_for_pending(&board, 5, PendingOperation::Starting).await;

        assert!(board.apply_status(5, false));
        let during = board.get(5).expect("task");
        assert!(!during.is_running());
        assert_eq!(during.pending, PendingOperation::Starting);

        reply
            .send(Ok(MutationAck {
                is_running: Some(true),
                message: None,
            }))
            .expect("send reply");
        in_flight.await.expect("join").expect("start ok");

        let view = board.get(5).expect("task");
        assert!(!view.is_running());
        assert_eq!(view.pending, PendingOperation::None);
    }

    #[tokio::test]
    async fn failure_does_not_revert_past_a_confirming_push() {
        let board = board_with(&[(5, false)]);
        let (coordinator, api) = coordinator(&board);
        let reply = api.hold_reply();

        let in_flight = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.start_task(5).await }
        });
        wait_for_pending(&board, 5, PendingOperation::Starting).await;
        board.apply_status(5, true);

        reply
            .send(Err(ApiError::Transport("timeout".to_string())))
            .expect("send reply");
        let err = in_flight.await.expect("join").expect_err("start must fail");
        assert!(matches!(err, MutationError::Request(_)));

        let view = board.get(5).expect("task");
        assert!(view.is_running());
        assert_eq!(view.pending, PendingOperation::None);
    }

    #[tokio::test]
    async fn second_mutation_while_pending_is_rejected() {
        let board = board_with(&[(5, true)]);
        let (coordinator, api) = coordinator(&board);
        let reply = api.hold_reply();

        let in_flight = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.stop_task(5).await }
        });
        wait_for_pending(&board, 5, PendingOperation::Stopping).await;
        let revision = board.get(5).expect("task").revision;

        assert_eq!(
            coordinator.start_task(5).await,
            Err(MutationError::Busy { id: 5 })
        );
        let view = board.get(5).expect("task");
        assert!(!view.is_running());
        assert_eq!(view.revision, revision);

        reply.send(Ok(MutationAck::default())).expect("send reply");
        in_flight.await.expect("join").expect("stop ok");
        assert_eq!(api.calls.lock().expect("calls").len(), 1);
        assert!(!board.get(5).expect("task").is_running());
    }

    #[tokio::test]
    async fn unknown_task_is_rejected_without_request() {
        let board = board_with(&[(1, false)]);
        let (coordinator, api) = coordinator(&board);
        assert_eq!(
            coordinator.start_task(99).await,
            Err(MutationError::UnknownTask { id: 99 })
        );
        assert!(api.calls.lock().expect("calls").is_empty());
    }

    #[tokio::test]
    async fn dropped_mutation_future_rolls_back_unconfirmed_value() {
        let board = board_with(&[(5, false)]);
        let (coordinator, api) = coordinator(&board);
        let _reply = api.hold_reply();

        let in_flight = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.start_task(5).await }
        });
        wait_for_pending(&board, 5, PendingOperation::Starting).await;
        in_flight.abort();
        let _ = in_flight.await;

        let view = board.get(5).expect("task");
        assert_eq!(view.pending, PendingOperation::None);
        assert!(!view.is_running());
    }

    #[test]
    fn abandoned_mutation_keeps_a_value_pushed_mid_flight() {
        let board = board_with(&[(5, false)]);
        let ticket = board.begin(5, TaskAction::Start).expect("begin");
        board.apply_status(5, true);

        assert_eq!(
            board.resolve(&ticket, MutationOutcome::Abandoned),
            Resolution::Superseded
        );
        let view = board.get(5).expect("task");
        assert!(view.is_running());
        assert_eq!(view.pending, PendingOperation::None);
    }

    #[test]
    fn every_write_bumps_revision() {
        let board = board_with(&[(5, false)]);
        let r0 = board.get(5).expect("task").revision;

        let ticket = board.begin(5, TaskAction::Start).expect("begin");
        let r1 = board.get(5).expect("task").revision;
        board.apply_status(5, true);
        let r2 = board.get(5).expect("task").revision;
        let resolution = board.resolve(&ticket, MutationOutcome::Failed);
        let r3 = board.get(5).expect("task").revision;

        assert!(r0 < r1 && r1 < r2 && r2 < r3);
        assert_eq!(resolution, Resolution::Superseded);
        assert!(board.get(5).expect("task").is_running());
    }

    #[test]
    fn confirmed_response_value_applies_when_not_superseded() {
        let board = board_with(&[(5, false)]);
        let ticket = board.begin(5, TaskAction::Start).expect("begin");
        let ack = MutationAck {
            is_running: Some(false),
            message: Some("queued".to_string()),
        };
        assert_eq!(
            board.resolve(&ticket, MutationOutcome::Confirmed(&ack)),
            Resolution::Confirmed
        );
        assert!(!board.get(5).expect("task").is_running());
    }

    #[test]
    fn refetch_keeps_pending_and_drops_vanished_tasks() {
        let board = board_with(&[(1, false), (2, false)]);
        let ticket = board.begin(1, TaskAction::Start).expect("begin");

        board.replace_all(vec![Task::new(3, "new", false), Task::new(1, "task-1", false)]);
        let ids: Vec<i64> = board.snapshot().iter().map(TaskView::id).collect();
        assert_eq!(ids, vec![3, 1]);
        let view = board.get(1).expect("task");
        assert_eq!(view.pending, PendingOperation::Starting);
        assert!(view.is_running());
        assert!(board.get(2).is_none());

        assert_eq!(
            board.resolve(&ticket, MutationOutcome::Failed),
            Resolution::Reverted
        );
        assert!(!board.get(1).expect("task").is_running());

        let ticket = board.begin(3, TaskAction::Start).expect("begin");
        board.replace_all(Vec::new());
        assert_eq!(
            board.resolve(&ticket, MutationOutcome::Failed),
            Resolution::Vanished
        );
    }

    #[test]
    fn stale_refetch_mid_flight_does_not_discard_confirmed_start() {
        let board = board_with(&[(5, false)]);
        let ticket = board.begin(5, TaskAction::Start).expect("begin");
        let fetched_at = board.current_revision();

        board.replace_all_since(vec![Task::new(5, "task-5", false)], Some(fetched_at));
        let during = board.get(5).expect("task");
        assert!(during.is_running());
        assert_eq!(during.pending, PendingOperation::Starting);

        assert_eq!(
            board.resolve(&ticket, MutationOutcome::Confirmed(&MutationAck::default())),
            Resolution::Confirmed
        );
        let view = board.get(5).expect("task");
        assert!(view.is_running());
        assert_eq!(view.pending, PendingOperation::None);
    }

    #[test]
    fn push_after_refetch_still_wins_over_pending_mutation() {
        let board = board_with(&[(5, false)]);
        let ticket = board.begin(5, TaskAction::Start).expect("begin");
        board.replace_all(vec![Task::new(5, "task-5", false)]);
        board.apply_status(5, false);

        assert_eq!(
            board.resolve(&ticket, MutationOutcome::Confirmed(&MutationAck::default())),
            Resolution::Superseded
        );
        assert!(!board.get(5).expect("task").is_running());
    }

    #[test]
    fn refetch_does_not_undo_writes_newer_than_the_fetch() {
        let board = board_with(&[(5, false), (6, false)]);
        let fetched_at = board.current_revision();
        board.apply_status(5, true);

        board.replace_all_since(
            vec![Task::new(5, "task-5", false), Task::new(6, "task-6", true)],
            Some(fetched_at),
        );
        assert!(board.get(5).expect("task").is_running());
        assert!(board.get(6).expect("task").is_running());
    }

    #[tokio::test]
    async fn bound_board_follows_push_events_and_refetches() {
        let board = board_with(&[(5, false)]);
        let (coordinator, api) = coordinator(&board);
        *api.tasks.lock().expect("tasks") = vec![
            Task::new(5, "task-5", false),
            Task::new(8, "task-8", true),
        ];
        let dispatcher = EventDispatcher::new();
        let bindings = coordinator.bind(&dispatcher);

        dispatcher.emit(&SyncEvent::TaskStatusChanged(TaskStatusChanged {
            id: 5,
            is_running: true,
        }));
        assert!(board.get(5).expect("task").is_running());

        dispatcher.emit(&SyncEvent::TasksUpdated);
        for _ in 0..1_000 {
            if board.len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(board.len(), 2);
        assert!(board.get(8).expect("task").is_running());
        // The push landed before the fetch began, so the refetch value wins.
        assert!(!board.get(5).expect("task").is_running());

        drop(bindings);
        assert_eq!(dispatcher.handler_count(EVENT_TASK_STATUS_CHANGED), 0);
        assert_eq!(dispatcher.handler_count(EVENT_TASKS_UPDATED), 0);
        assert_eq!(dispatcher.handler_count(EVENT_CONNECT), 0);
    }
}
