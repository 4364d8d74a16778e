//! Operation queue and registry.
//!
//! Every request becomes an [`Operation`] with an id. Operations on the same
//! target run one at a time in submission order; operations on different
//! targets run side by side up to `max_concurrent`. Each dispatched operation
//! gets one supervising task that owns the child process, feeds its output
//! through the parser and publishes the resulting events.
//!
//! All bookkeeping lives behind one `std::sync::Mutex` which is never held
//! across an `.await` or while publishing to the bus.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{CoreEvent, EventBus};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::inventory::{Inventory, OutcomeDetails};
use crate::model::{
    Intent, Operation, OperationId, OperationStatus, PackageRecord, Progress, Target, TargetKey,
};
use crate::parser::{FailureKind, OutputParser, ParsedEvent};
use crate::process::{exit_code, CancelOutcome, OutputLine, ProcessHandle, ProcessRunner};
use crate::tools;

/// How long to keep reading after a cancel raced with a normal exit.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct OperationQueue {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    runner: ProcessRunner,
    bus: Arc<EventBus>,
    inventory: Arc<Inventory>,
    rt: Handle,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    ops: HashMap<OperationId, Entry>,
    /// Not yet dispatched, in submission order.
    queued: VecDeque<OperationId>,
    /// Targets with a dispatched operation.
    running: HashMap<TargetKey, OperationId>,
    /// Terminal operations, oldest first.
    finished: VecDeque<OperationId>,
}

struct Entry {
    op: Operation,
    key: TargetKey,
    /// `Queued` has been published. Not scheduled before that.
    announced: bool,
    dispatched: bool,
    cancel: CancellationToken,
    answer: Option<oneshot::Sender<String>>,
    /// Holds the final snapshot once the operation is terminal.
    done: watch::Sender<Option<Operation>>,
    search_sink: Option<mpsc::UnboundedSender<PackageRecord>>,
    search_hits: Vec<PackageRecord>,
}

struct Outcome {
    status: OperationStatus,
    summary: String,
    error: Option<CoreError>,
}

impl Outcome {
    fn succeeded(summary: String) -> Self {
        Self {
            status: OperationStatus::Succeeded,
            summary,
            error: None,
        }
    }

    fn failed(error: CoreError) -> Self {
        Self {
            status: OperationStatus::Failed,
            summary: error.to_string(),
            error: Some(error),
        }
    }

    fn cancelled(summary: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Cancelled,
            summary: summary.into(),
            error: Some(CoreError::Cancelled),
        }
    }
}

/// Events to publish once the state lock is released.
struct Notice {
    finished: CoreEvent,
    generation: Option<u64>,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("OperationQueue")
            .field("operations", &state.ops.len())
            .field("queued", &state.queued.len())
            .field("running", &state.running.len())
            .finish()
    }
}

impl OperationQueue {
    /// Must be called from within a tokio runtime; supervising tasks are
    /// spawned onto it.
    pub fn new(config: Config, bus: Arc<EventBus>, inventory: Arc<Inventory>) -> CoreResult<Self> {
        config.validate()?;
        let rt = Handle::try_current()
            .map_err(|_| CoreError::Config("the operation queue needs a tokio runtime".into()))?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                runner: ProcessRunner::new(),
                bus,
                inventory,
                rt,
                state: Mutex::new(QueueState::default()),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Register an intent.
    ///
    /// Install, update and remove are idempotent while pending: asking again
    /// returns the existing id. A mutation on a target whose operation is
    /// already running is rejected with `PackageConflict`. A mutation replaces
    /// a still-queued mutation of a different kind on the same target.
    pub fn submit(&self, intent: Intent) -> CoreResult<OperationId> {
        self.submit_with_sink(intent, None)
    }

    /// Like [`submit`](Self::submit) for a search, forwarding every hit into
    /// `sink`. The sender is dropped when the search ends.
    pub(crate) fn submit_search(
        &self,
        query: &str,
        sink: mpsc::UnboundedSender<PackageRecord>,
    ) -> CoreResult<OperationId> {
        self.submit_with_sink(
            Intent::Search {
                query: query.to_string(),
            },
            Some(sink),
        )
    }

    fn submit_with_sink(
        &self,
        intent: Intent,
        sink: Option<mpsc::UnboundedSender<PackageRecord>>,
    ) -> CoreResult<OperationId> {
        validate_intent(&intent)?;
        let kind = intent.kind();
        let target = intent.target();
        let key = target.key();

        let (id, superseded) = {
            let mut state = self.lock();

            if kind.is_idempotent() {
                let existing = state
                    .ops
                    .values()
                    .find(|e| !e.op.is_terminal() && e.op.kind() == kind && e.key == key)
                    .map(|e| e.op.id);
                if let Some(existing) = existing {
                    debug!(operation = %existing, %key, "returning pending operation");
                    return Ok(existing);
                }
            }

            if kind.is_mutation() {
                let active = state
                    .running
                    .iter()
                    .find(|(running, _)| running.overlaps(&key))
                    .map(|(_, id)| *id);
                if let Some(active) = active {
                    return Err(CoreError::PackageConflict { target: key, active });
                }
            }

            state.next_id += 1;
            let id = OperationId(state.next_id);

            let mut superseded = Vec::new();
            if kind.is_mutation() {
                let replaced: Vec<OperationId> = state
                    .queued
                    .iter()
                    .filter_map(|q| state.ops.get(q))
                    .filter(|e| {
                        e.announced && e.key == key && e.op.kind().is_mutation() && e.op.kind() != kind
                    })
                    .map(|e| e.op.id)
                    .collect();
                for old in replaced {
                    debug!(operation = %old, by = %id, "superseded");
                    let outcome = Outcome::cancelled(format!("superseded by {id}"));
                    if let Some(notice) = self.finish_locked(&mut state, old, outcome) {
                        superseded.push(notice);
                    }
                }
            }

            let (done, _) = watch::channel(None);
            state.ops.insert(
                id,
                Entry {
                    op: Operation::new(id, intent),
                    key: key.clone(),
                    announced: false,
                    dispatched: false,
                    cancel: CancellationToken::new(),
                    answer: None,
                    done,
                    search_sink: sink,
                    search_hits: Vec::new(),
                },
            );
            state.queued.push_back(id);
            (id, superseded)
        };

        debug!(operation = %id, %kind, %key, "queued");
        for notice in superseded {
            self.announce(notice);
        }
        self.shared.bus.publish(&CoreEvent::Queued { id, kind, target });
        if let Some(entry) = self.lock().ops.get_mut(&id) {
            entry.announced = true;
        }
        self.pump();
        Ok(id)
    }

    /// Cancel an operation and return its status at the time of the call.
    ///
    /// A queued operation becomes `Cancelled` right away and never starts. A
    /// running one is asked to stop; its final status arrives with the
    /// `Finished` event. Cancelling a terminal operation changes nothing.
    pub fn cancel(&self, id: OperationId) -> CoreResult<OperationStatus> {
        let notice = {
            let mut state = self.lock();
            let entry = state.ops.get(&id).ok_or(CoreError::UnknownOperation(id))?;
            if entry.op.is_terminal() {
                return Ok(entry.op.status);
            }
            if entry.dispatched {
                debug!(operation = %id, "cancellation requested");
                entry.cancel.cancel();
                return Ok(entry.op.status);
            }
            self.finish_locked(&mut state, id, Outcome::cancelled("cancelled before start"))
        };
        if let Some(notice) = notice {
            self.announce(notice);
        }
        Ok(OperationStatus::Cancelled)
    }

    /// Answer the confirmation an operation is waiting on.
    pub fn respond(&self, id: OperationId, answer: &str) -> CoreResult<()> {
        let mut state = self.lock();
        let entry = state.ops.get_mut(&id).ok_or(CoreError::UnknownOperation(id))?;
        let tx = entry.answer.take().ok_or(CoreError::NoPendingConfirmation(id))?;
        entry.op.confirmation = None;
        debug!(operation = %id, answer, "confirmation answered");
        // The supervisor only goes away after clearing `answer` itself.
        let _ = tx.send(answer.to_string());
        Ok(())
    }

    /// Forget a terminal operation. Returns `false` if it is still pending
    /// or unknown.
    pub fn acknowledge(&self, id: OperationId) -> bool {
        let mut state = self.lock();
        if !state.ops.get(&id).is_some_and(|e| e.op.is_terminal()) {
            return false;
        }
        state.ops.remove(&id);
        state.finished.retain(|f| *f != id);
        true
    }

    pub fn get(&self, id: OperationId) -> CoreResult<Operation> {
        self.lock()
            .ops
            .get(&id)
            .map(|e| e.op.clone())
            .ok_or(CoreError::UnknownOperation(id))
    }

    /// Every tracked operation, oldest first.
    pub fn operations(&self) -> Vec<Operation> {
        let state = self.lock();
        let mut ops: Vec<Operation> = state.ops.values().map(|e| e.op.clone()).collect();
        ops.sort_by_key(|op| op.id);
        ops
    }

    /// The pending operation for `target`, preferring the dispatched one.
    pub fn active_for(&self, target: &Target) -> Option<OperationId> {
        let key = target.key();
        let state = self.lock();
        state.running.get(&key).copied().or_else(|| {
            state
                .queued
                .iter()
                .find(|id| state.ops.get(*id).is_some_and(|e| e.key == key))
                .copied()
        })
    }

    /// Resolve with the terminal snapshot of `id`.
    pub async fn wait(&self, id: OperationId) -> CoreResult<Operation> {
        let mut done = self
            .lock()
            .ops
            .get(&id)
            .map(|e| e.done.subscribe())
            .ok_or(CoreError::UnknownOperation(id))?;
        let finished = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CoreError::UnknownOperation(id))?;
        finished.clone().ok_or(CoreError::UnknownOperation(id))
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatch whatever may start now.
    fn pump(&self) {
        let mut starting = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let limit = self.shared.config.max_concurrent;
            let mut busy: Vec<TargetKey> = state.running.keys().cloned().collect();
            let mut active = state.running.len();

            let queued: Vec<OperationId> = state.queued.iter().copied().collect();
            for id in queued {
                if active >= limit {
                    break;
                }
                let Some(entry) = state.ops.get_mut(&id) else {
                    continue;
                };
                // Anything earlier on an overlapping target keeps later ones waiting.
                if !entry.announced || busy.iter().any(|k| k.overlaps(&entry.key)) {
                    busy.push(entry.key.clone());
                    continue;
                }
                entry.dispatched = true;
                busy.push(entry.key.clone());
                starting.push((id, entry.op.intent.clone(), entry.cancel.clone()));
                state.running.insert(entry.key.clone(), id);
                active += 1;
            }

            let ops = &state.ops;
            state
                .queued
                .retain(|id| ops.get(id).is_some_and(|e| !e.dispatched));
        }

        for (id, intent, cancel) in starting {
            let queue = self.clone();
            self.shared
                .rt
                .spawn(async move { queue.supervise(id, intent, cancel).await });
        }
    }

    async fn supervise(self, id: OperationId, intent: Intent, cancel: CancellationToken) {
        let outcome = self.drive(id, &intent, &cancel).await;
        if let Some(notice) = self.finish(id, outcome) {
            self.announce(notice);
        }
    }

    async fn drive(&self, id: OperationId, intent: &Intent, cancel: &CancellationToken) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::cancelled("cancelled before start");
        }

        let spec = tools::command_for(intent, &self.shared.config);
        let elevated = tools::is_elevated(&spec);
        let mut handle = match self.shared.runner.start(&spec).await {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.bus.report_problem(&spec.program, err.to_string());
                return Outcome::failed(err);
            }
        };

        if let Some(entry) = self.lock().ops.get_mut(&id) {
            entry.op.status = OperationStatus::Running;
        }
        debug!(operation = %id, command = %spec, "running");
        self.shared.bus.publish(&CoreEvent::Started { id });

        let mut parser = OutputParser::new(intent.kind());
        let mut summary = None;
        let mut pending: Option<oneshot::Receiver<String>> = None;

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                answer = next_answer(&mut pending), if pending.is_some() => Step::Answer(answer.ok()),
                line = handle.read_line() => Step::Line(line),
            };
            match step {
                Step::Cancelled => {
                    return self.stop(id, &mut handle, &mut parser, &mut summary, elevated).await;
                }
                Step::Answer(answer) => {
                    pending = None;
                    if let Some(answer) = answer {
                        if let Err(e) = handle.write_line(&answer).await {
                            warn!(operation = %id, err = %e, "could not answer prompt");
                        }
                    }
                }
                Step::Line(Some(line)) => {
                    if let Some(rx) = self.consume(id, &line.text, &mut parser, &mut summary) {
                        pending = Some(rx);
                    }
                }
                Step::Line(None) => break,
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = handle.wait() => Some(status),
        };
        match status {
            None => self.stop(id, &mut handle, &mut parser, &mut summary, elevated).await,
            Some(Ok(status)) => self.evaluate(id, exit_code(status), &parser, summary, elevated),
            Some(Err(err)) => Outcome::failed(err),
        }
    }

    /// Terminate the child. If it already exited on its own, its real result
    /// stands.
    async fn stop(
        &self,
        id: OperationId,
        handle: &mut ProcessHandle,
        parser: &mut OutputParser,
        summary: &mut Option<String>,
        elevated: bool,
    ) -> Outcome {
        match handle.cancel(self.shared.config.cancel_grace()).await {
            Ok(CancelOutcome::AlreadyExited(status)) => {
                while let Ok(Some(line)) = tokio::time::timeout(DRAIN_TIMEOUT, handle.read_line()).await {
                    self.consume(id, &line.text, parser, summary);
                }
                self.evaluate(id, exit_code(status), parser, summary.take(), elevated)
            }
            Ok(outcome) => {
                debug!(operation = %id, ?outcome, "child stopped");
                Outcome::cancelled("cancelled")
            }
            Err(err) => {
                warn!(operation = %id, err = %err, "failed to stop child cleanly");
                Outcome::cancelled("cancelled")
            }
        }
    }

    /// Record one output line and publish what it means. Returns a receiver
    /// when the line asked a question.
    fn consume(
        &self,
        id: OperationId,
        text: &str,
        parser: &mut OutputParser,
        summary: &mut Option<String>,
    ) -> Option<oneshot::Receiver<String>> {
        let parsed = parser.feed(text);
        let mut events = vec![CoreEvent::Output {
            id,
            line: text.to_string(),
        }];
        let mut answer = None;

        {
            let mut state = self.lock();
            let limit = self.shared.config.log_limit;
            let entry = state.ops.get_mut(&id)?;
            entry.op.push_log(text.to_string(), limit);

            for event in parsed {
                match event {
                    ParsedEvent::Progress { progress, message } => {
                        entry.op.progress = progress;
                        entry.op.message = message.clone();
                        events.push(CoreEvent::Progress { id, progress, message });
                    }
                    ParsedEvent::ConfirmationRequired(confirmation) => {
                        let (tx, rx) = oneshot::channel();
                        entry.answer = Some(tx);
                        entry.op.confirmation = Some(confirmation.clone());
                        answer = Some(rx);
                        events.push(CoreEvent::ConfirmationRequired { id, confirmation });
                    }
                    ParsedEvent::Result {
                        success, summary: s, ..
                    } => {
                        // A failure message wins over a later success line.
                        if !success || summary.is_none() || parser.saw_result() == Some(true) {
                            *summary = Some(s);
                        }
                    }
                    ParsedEvent::SearchHit(record) => {
                        if let Some(sink) = &entry.search_sink {
                            let _ = sink.send(record.clone());
                        }
                        entry.search_hits.push(record);
                    }
                    ParsedEvent::Ambiguous { line, reason } => {
                        let err = CoreError::ParseAmbiguous(reason);
                        warn!(operation = %id, line = %line, %err, "ignoring output line");
                    }
                }
            }
        }

        for event in &events {
            self.shared.bus.publish(event);
        }
        answer
    }

    /// Decide the outcome from the exit code and what the parser saw.
    fn evaluate(
        &self,
        id: OperationId,
        code: i32,
        parser: &OutputParser,
        summary: Option<String>,
        elevated: bool,
    ) -> Outcome {
        let tail = self
            .lock()
            .ops
            .get(&id)
            .map(|e| e.op.log_tail(self.shared.config.log_tail_lines))
            .unwrap_or_default();

        if code == 0 && parser.saw_result() != Some(false) {
            return Outcome::succeeded(summary.unwrap_or_else(|| "completed".to_string()));
        }

        if code != 0 && elevated && tools::PKEXEC_DENIED.contains(&code) {
            return Outcome::failed(CoreError::PermissionDenied(
                "authorization was refused or dismissed".to_string(),
            ));
        }

        let summary = summary
            .or_else(|| tail.last().cloned())
            .unwrap_or_else(|| format!("exited with status {code}"));
        let failure = parser.failure_hint().unwrap_or(FailureKind::Other);
        Outcome::failed(failure.into_error(summary, code, tail))
    }

    fn finish(&self, id: OperationId, outcome: Outcome) -> Option<Notice> {
        let mut state = self.lock();
        self.finish_locked(&mut state, id, outcome)
    }

    /// The single terminal transition: registry, inventory, then the
    /// `Finished` notice for the caller to publish.
    fn finish_locked(&self, state: &mut QueueState, id: OperationId, outcome: Outcome) -> Option<Notice> {
        let entry = state.ops.get_mut(&id)?;
        if entry.op.is_terminal() {
            return None;
        }

        entry.op.status = outcome.status;
        entry.op.summary = Some(outcome.summary.clone());
        entry.op.error = outcome.error.clone();
        entry.op.confirmation = None;
        if outcome.status == OperationStatus::Succeeded {
            entry.op.progress = Progress::Fraction(1.0);
        }
        entry.answer = None;
        entry.search_sink = None;
        let details = OutcomeDetails {
            search_hits: std::mem::take(&mut entry.search_hits),
        };
        let snapshot = entry.op.clone();
        let key = entry.key.clone();
        entry.done.send_replace(Some(snapshot.clone()));

        if state.running.get(&key) == Some(&id) {
            state.running.remove(&key);
        }
        state.queued.retain(|q| *q != id);
        state.finished.push_back(id);

        let generation = self.shared.inventory.apply_outcome(&snapshot, &details);

        while state.finished.len() > self.shared.config.retain_terminal {
            if let Some(old) = state.finished.pop_front() {
                state.ops.remove(&old);
            }
        }

        info!(
            operation = %id,
            kind = %snapshot.kind(),
            %key,
            status = %snapshot.status,
            summary = %outcome.summary,
            "operation finished"
        );

        Some(Notice {
            finished: CoreEvent::Finished {
                id,
                kind: snapshot.kind(),
                target: snapshot.target(),
                status: outcome.status,
                summary: outcome.summary,
                error: outcome.error,
            },
            generation,
        })
    }

    fn announce(&self, notice: Notice) {
        self.shared.bus.publish(&notice.finished);
        if let Some(generation) = notice.generation {
            self.shared
                .bus
                .publish(&CoreEvent::InventoryChanged { generation });
        }
        self.pump();
    }
}

enum Step {
    Cancelled,
    Answer(Option<String>),
    Line(Option<OutputLine>),
}

async fn next_answer(
    pending: &mut Option<oneshot::Receiver<String>>,
) -> Result<String, oneshot::error::RecvError> {
    match pending {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}

fn validate_intent(intent: &Intent) -> CoreResult<()> {
    let empty = match intent {
        Intent::Search { query } => query.trim().is_empty(),
        Intent::CreateSandbox { name, image } => name.trim().is_empty() || image.trim().is_empty(),
        Intent::EnterSandbox { name, .. } | Intent::DeleteSandbox { name } => name.trim().is_empty(),
        Intent::Install { .. } | Intent::Update { .. } | Intent::Remove { .. } => false,
    };
    if empty {
        return Err(CoreError::Config(format!(
            "{} needs a non-empty target",
            intent.kind()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelListener;
    use crate::model::{InstallScope, OperationKind, PackageRef};
    use crate::test_support::{next_event, FakeTools};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        tools: FakeTools,
        queue: OperationQueue,
        inventory: Arc<Inventory>,
        events: UnboundedReceiver<CoreEvent>,
    }

    fn harness_with(tools: FakeTools, adjust: impl FnOnce(&mut Config)) -> Harness {
        let mut config = tools.config();
        adjust(&mut config);
        let bus = Arc::new(EventBus::new());
        let (listener, events) = ChannelListener::new();
        bus.subscribe(Arc::new(listener));
        let inventory = Arc::new(Inventory::new());
        let queue = OperationQueue::new(config, bus, inventory.clone()).unwrap();
        Harness {
            tools,
            queue,
            inventory,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeTools::new(), |_| {})
    }

    fn app(id: &str) -> PackageRef {
        PackageRef::new("flathub", id, "stable")
    }

    fn install(id: &str) -> Intent {
        Intent::Install {
            package: app(id),
            scope: InstallScope::User,
        }
    }

    fn remove(id: &str) -> Intent {
        Intent::Remove {
            package: app(id),
            scope: InstallScope::User,
        }
    }

    fn started(id: OperationId) -> impl FnMut(&CoreEvent) -> bool {
        move |e| matches!(e, CoreEvent::Started { id: s } if *s == id)
    }

    fn finished(id: OperationId) -> impl FnMut(&CoreEvent) -> bool {
        move |e| matches!(e, CoreEvent::Finished { id: f, .. } if *f == id)
    }

    fn busy_search(tools: &FakeTools) {
        tools.script("flatpak", "search", "sleep 30\n");
    }

    #[tokio::test]
    async fn install_runs_to_success_and_updates_inventory() {
        let mut h = harness();
        let id = h.queue.submit(install("org.example.App")).unwrap();

        let queued = next_event(&mut h.events, |_| true).await;
        assert!(matches!(queued, CoreEvent::Queued { kind: OperationKind::Install, .. }));
        next_event(&mut h.events, started(id)).await;
        next_event(&mut h.events, |e| matches!(e, CoreEvent::Progress { .. })).await;
        let done = next_event(&mut h.events, finished(id)).await;
        assert!(matches!(
            done,
            CoreEvent::Finished { status: OperationStatus::Succeeded, .. }
        ));
        let changed = next_event(&mut h.events, |_| true).await;
        assert_eq!(changed, CoreEvent::InventoryChanged { generation: 1 });

        assert!(h.inventory.is_installed(&app("org.example.App")));
        let op = h.queue.wait(id).await.unwrap();
        assert_eq!(op.summary.as_deref(), Some("Installation complete."));
        assert_eq!(op.progress, Progress::Fraction(1.0));
        assert!(h
            .tools
            .calls()
            .contains(&"flatpak install --user -y flathub org.example.App//stable".to_string()));
    }

    #[tokio::test]
    async fn duplicate_install_while_queued_returns_the_same_id() {
        let h = harness_with(FakeTools::new(), |c| c.max_concurrent = 1);
        busy_search(&h.tools);
        let search = h.queue.submit(Intent::Search { query: "busy".into() }).unwrap();

        let first = h.queue.submit(install("org.example.App")).unwrap();
        let second = h.queue.submit(install("org.example.App")).unwrap();
        assert_eq!(first, second);
        assert_eq!(h.queue.get(first).unwrap().status, OperationStatus::Queued);
        assert_eq!(h.queue.operations().len(), 2);

        h.queue.cancel(search).unwrap();
        h.queue.cancel(first).unwrap();
    }

    #[tokio::test]
    async fn cancelling_a_queued_operation_never_starts_it() {
        let mut h = harness_with(FakeTools::new(), |c| c.max_concurrent = 1);
        busy_search(&h.tools);
        let search = h.queue.submit(Intent::Search { query: "busy".into() }).unwrap();
        next_event(&mut h.events, started(search)).await;

        let id = h.queue.submit(install("org.example.App")).unwrap();
        assert_eq!(h.queue.cancel(id).unwrap(), OperationStatus::Cancelled);
        h.queue.cancel(search).unwrap();
        h.queue.wait(search).await.unwrap();

        let op = h.queue.wait(id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Cancelled);
        assert!(h.tools.calls().iter().all(|c| !c.contains("install")));
        assert!(!h.inventory.is_installed(&app("org.example.App")));
        // Terminal operations are left alone.
        assert_eq!(h.queue.cancel(id).unwrap(), OperationStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancelling_a_running_operation_kills_the_process() {
        let mut h = harness();
        h.tools.script(
            "flatpak",
            "install",
            "echo $$ > \"$dir/pid\"\necho 'Installing 1/1 org.example.App'\nsleep 30\n",
        );
        let id = h.queue.submit(install("org.example.App")).unwrap();
        next_event(&mut h.events, |e| matches!(e, CoreEvent::Progress { .. })).await;

        h.queue.cancel(id).unwrap();
        let op = h.queue.wait(id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Cancelled);
        assert_eq!(op.error, Some(CoreError::Cancelled));
        assert!(!h.inventory.is_installed(&app("org.example.App")));

        let pid: libc::pid_t = std::fs::read_to_string(h.tools.path().join("pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_ne!(unsafe { libc::kill(pid, 0) }, 0, "process should be gone");
    }

    #[tokio::test]
    async fn mutation_on_a_running_target_is_rejected() {
        let mut h = harness();
        h.tools.script("flatpak", "uninstall", "sleep 30\n");
        let removing = h.queue.submit(remove("org.example.App")).unwrap();
        next_event(&mut h.events, started(removing)).await;

        let err = h.queue.submit(install("org.example.App")).unwrap_err();
        assert_eq!(
            err,
            CoreError::PackageConflict {
                target: Target::Package(app("org.example.App")).key(),
                active: removing,
            }
        );
        // A different package is unaffected.
        let other = h.queue.submit(install("org.example.Other")).unwrap();
        assert_eq!(h.queue.wait(other).await.unwrap().status, OperationStatus::Succeeded);

        h.queue.cancel(removing).unwrap();
        h.queue.wait(removing).await.unwrap();
    }

    #[tokio::test]
    async fn queued_mutation_is_superseded_by_a_different_one() {
        let h = harness_with(FakeTools::new(), |c| c.max_concurrent = 1);
        busy_search(&h.tools);
        let search = h.queue.submit(Intent::Search { query: "busy".into() }).unwrap();

        let installing = h.queue.submit(install("org.example.App")).unwrap();
        let removing = h.queue.submit(remove("org.example.App")).unwrap();

        let superseded = h.queue.get(installing).unwrap();
        assert_eq!(superseded.status, OperationStatus::Cancelled);
        assert_eq!(superseded.summary, Some(format!("superseded by {removing}")));

        h.queue.cancel(search).unwrap();
        assert_eq!(h.queue.wait(removing).await.unwrap().status, OperationStatus::Succeeded);
        assert!(h.tools.calls().iter().all(|c| !c.contains("flatpak install")));
    }

    #[tokio::test]
    async fn same_target_runs_in_submission_order() {
        let mut h = harness();
        h.tools.script("flatpak", "search", "sleep 0.3\necho 'No matches found'\n");
        let first = h.queue.submit(Intent::Search { query: "gimp".into() }).unwrap();
        let second = h.queue.submit(Intent::Search { query: "GIMP ".into() }).unwrap();
        assert_ne!(first, second);
        assert_eq!(h.queue.active_for(&Target::Query("gimp".into())), Some(first));

        let mut order = Vec::new();
        while order.len() < 4 {
            match next_event(&mut h.events, |e| {
                matches!(e, CoreEvent::Started { .. } | CoreEvent::Finished { .. })
            })
            .await
            {
                CoreEvent::Started { id } => order.push(("start", id)),
                CoreEvent::Finished { id, .. } => order.push(("end", id)),
                _ => unreachable!(),
            }
        }
        assert_eq!(
            order,
            vec![("start", first), ("end", first), ("start", second), ("end", second)]
        );
    }

    #[tokio::test]
    async fn non_zero_exit_without_marker_fails_with_log_tail() {
        let h = harness();
        h.tools
            .script("flatpak", "install", "echo 'something odd happened'\nexit 3\n");
        let id = h.queue.submit(install("org.example.App")).unwrap();

        let op = h.queue.wait(id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        match op.error {
            Some(CoreError::ProcessNonZeroExit { code, summary, log_tail }) => {
                assert_eq!(code, 3);
                assert_eq!(summary, "something odd happened");
                assert_eq!(log_tail, vec!["something odd happened".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(h.inventory.list_installed().is_empty());
    }

    #[tokio::test]
    async fn error_marker_fails_even_with_zero_exit() {
        let h = harness();
        h.tools.script(
            "flatpak",
            "uninstall",
            "echo 'error: Nothing matches org.example.App in local repository'\nexit 0\n",
        );
        let id = h.queue.submit(remove("org.example.App")).unwrap();
        let op = h.queue.wait(id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(matches!(op.error, Some(CoreError::RemoteNotFound(_))));
    }

    #[tokio::test]
    async fn network_failure_during_search() {
        let h = harness();
        let installed = install("org.example.App");
        let id = h.queue.submit(installed).unwrap();
        h.queue.wait(id).await.unwrap();
        let before = h.inventory.snapshot();

        h.tools.script(
            "flatpak",
            "search",
            "echo 'error: Unable to load summary from remote flathub: Could not resolve hostname' >&2\nexit 1\n",
        );
        let search = h.queue.submit(Intent::Search { query: "gimp".into() }).unwrap();
        let op = h.queue.wait(search).await.unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(matches!(op.error, Some(CoreError::NetworkUnavailable(_))));
        assert_eq!(h.inventory.snapshot(), before);
    }

    #[tokio::test]
    async fn confirmation_suspends_until_answered() {
        let mut h = harness_with(FakeTools::new(), |c| c.auto_confirm = false);
        h.tools.script(
            "flatpak",
            "install",
            "printf 'Do you want to install it? [Y/n]: '\nread answer\n\
             if [ \"$answer\" = y ]; then echo 'Installation complete.'; else echo 'error: Aborted by user'; exit 1; fi\n",
        );
        let id = h.queue.submit(install("org.example.App")).unwrap();
        assert_eq!(
            h.queue.respond(id, "y"),
            Err(CoreError::NoPendingConfirmation(id))
        );

        let asked = next_event(&mut h.events, |e| {
            matches!(e, CoreEvent::ConfirmationRequired { .. })
        })
        .await;
        match asked {
            CoreEvent::ConfirmationRequired { confirmation, .. } => {
                assert_eq!(confirmation.options, vec!["y", "n"]);
            }
            _ => unreachable!(),
        }
        assert!(h.queue.get(id).unwrap().confirmation.is_some());

        h.queue.respond(id, "y").unwrap();
        let op = h.queue.wait(id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Succeeded);
        assert!(op.confirmation.is_none());
        assert!(h.inventory.is_installed(&app("org.example.App")));
    }

    #[tokio::test]
    async fn missing_tool_is_reported_once() {
        let mut h = harness_with(FakeTools::new(), |c| {
            c.flatpak_bin = "/nonexistent/flatpak".into();
        });
        let first = h.queue.submit(install("org.example.App")).unwrap();
        let op = h.queue.wait(first).await.unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(matches!(op.error, Some(CoreError::SpawnFailure { .. })));

        let second = h.queue.submit(install("org.example.Other")).unwrap();
        h.queue.wait(second).await.unwrap();

        let mut problems = 0;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, CoreEvent::ConfigurationProblem { .. }) {
                problems += 1;
            }
        }
        assert_eq!(problems, 1);
    }

    #[tokio::test]
    async fn search_hits_reach_the_sink() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = h.queue.submit_search("example", tx).unwrap();
        let hit = rx.recv().await.unwrap();
        assert_eq!(hit.reference, app("org.example.App"));
        assert_eq!(rx.recv().await, None);
        assert_eq!(h.queue.wait(id).await.unwrap().status, OperationStatus::Succeeded);
        assert!(h.inventory.catalog_entry(&app("org.example.App")).is_some());
        assert!(h.inventory.list_installed().is_empty());
    }

    #[tokio::test]
    async fn acknowledge_and_retention() {
        let h = harness_with(FakeTools::new(), |c| c.retain_terminal = 1);
        let first = h.queue.submit(install("org.example.A")).unwrap();
        h.queue.wait(first).await.unwrap();
        let second = h.queue.submit(install("org.example.B")).unwrap();
        h.queue.wait(second).await.unwrap();

        assert_eq!(h.queue.get(first).unwrap_err(), CoreError::UnknownOperation(first));
        assert!(h.queue.acknowledge(second));
        assert!(!h.queue.acknowledge(second));
        assert!(h.queue.operations().is_empty());
    }

    fn create(name: &str) -> Intent {
        Intent::CreateSandbox {
            name: name.into(),
            image: "fedora:40".into(),
        }
    }

    fn update_all() -> Intent {
        Intent::Update {
            package: None,
            scope: InstallScope::User,
        }
    }

    /// Start/finish order of `ids` until all of them have finished.
    async fn lifecycle(
        events: &mut UnboundedReceiver<CoreEvent>,
        ids: &[OperationId],
    ) -> Vec<(&'static str, OperationId)> {
        let mut order = Vec::new();
        while order.len() < ids.len() * 2 {
            match next_event(events, |e| {
                matches!(e, CoreEvent::Started { id } | CoreEvent::Finished { id, .. } if ids.contains(id))
            })
            .await
            {
                CoreEvent::Started { id } => order.push(("start", id)),
                CoreEvent::Finished { id, .. } => order.push(("end", id)),
                _ => unreachable!(),
            }
        }
        order
    }

    #[tokio::test]
    async fn running_update_all_conflicts_with_any_package() {
        let mut h = harness();
        h.tools.script("flatpak", "update", "sleep 30\n");
        let all = h.queue.submit(update_all()).unwrap();
        next_event(&mut h.events, started(all)).await;

        let err = h.queue.submit(install("org.example.App")).unwrap_err();
        assert_eq!(
            err,
            CoreError::PackageConflict {
                target: Target::Package(app("org.example.App")).key(),
                active: all,
            }
        );
        assert_eq!(h.queue.get(all).unwrap().status, OperationStatus::Running);

        // Sandboxes are not packages.
        let sandbox = h.queue.submit(Intent::DeleteSandbox { name: "dev".into() }).unwrap();
        assert_eq!(h.queue.wait(sandbox).await.unwrap().status, OperationStatus::Succeeded);

        h.queue.cancel(all).unwrap();
        assert_eq!(h.queue.wait(all).await.unwrap().status, OperationStatus::Cancelled);
    }

    #[tokio::test]
    async fn queued_update_all_holds_back_later_package_work() {
        let mut h = harness_with(FakeTools::new(), |c| c.max_concurrent = 2);
        busy_search(&h.tools);
        h.tools.script("flatpak", "update", "sleep 0.3\necho 'Nothing to do.'\n");
        let first = h.queue.submit(Intent::Search { query: "one".into() }).unwrap();
        next_event(&mut h.events, started(first)).await;
        let second = h.queue.submit(Intent::Search { query: "two".into() }).unwrap();
        next_event(&mut h.events, started(second)).await;

        let all = h.queue.submit(update_all()).unwrap();
        let installing = h.queue.submit(install("org.example.App")).unwrap();
        h.queue.cancel(first).unwrap();
        h.queue.cancel(second).unwrap();

        // A slot is free, but the install overlaps the update.
        assert_eq!(
            lifecycle(&mut h.events, &[all, installing]).await,
            vec![("start", all), ("end", all), ("start", installing), ("end", installing)]
        );
        assert!(h.inventory.is_installed(&app("org.example.App")));
    }

    #[tokio::test]
    async fn created_sandbox_lands_in_the_inventory() {
        let h = harness();
        let id = h.queue.submit(create("dev")).unwrap();
        let op = h.queue.wait(id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Succeeded);
        assert_eq!(op.summary.as_deref(), Some("Distrobox 'dev' successfully created."));

        let sandboxes = h.inventory.list_sandboxes();
        assert_eq!(sandboxes.len(), 1);
        assert_eq!(sandboxes[0].name, "dev");
        assert_eq!(sandboxes[0].image, "fedora:40");
        assert!(!sandboxes[0].created.is_empty());
        assert!(h
            .tools
            .calls()
            .contains(&"distrobox create --name dev --image fedora:40 --yes".to_string()));
    }

    #[tokio::test]
    async fn existing_sandbox_fails_creation() {
        let h = harness();
        h.tools.script("distrobox", "create", "echo 'Container dev already exists'\nexit 0\n");
        let id = h.queue.submit(create("dev")).unwrap();
        let op = h.queue.wait(id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(op.summary.unwrap().contains("already exists"));
        assert!(h.inventory.list_sandboxes().is_empty());
        assert_eq!(h.inventory.generation(), 0);
    }

    #[tokio::test]
    async fn deleted_sandbox_leaves_the_inventory() {
        let h = harness();
        let created = h.queue.submit(create("dev")).unwrap();
        h.queue.wait(created).await.unwrap();
        assert_eq!(h.inventory.list_sandboxes().len(), 1);

        let deleted = h.queue.submit(Intent::DeleteSandbox { name: "dev".into() }).unwrap();
        assert_eq!(h.queue.wait(deleted).await.unwrap().status, OperationStatus::Succeeded);
        assert!(h.inventory.list_sandboxes().is_empty());
        assert!(h.tools.calls().contains(&"distrobox rm --force dev".to_string()));
    }

    #[tokio::test]
    async fn enter_waits_for_create_and_leaves_inventory_alone() {
        let mut h = harness();
        h.tools.script(
            "distrobox",
            "create",
            "sleep 0.3\necho \"Distrobox 'dev' successfully created.\"\n",
        );
        let creating = h.queue.submit(create("dev")).unwrap();
        let entering = h
            .queue
            .submit(Intent::EnterSandbox {
                name: "dev".into(),
                command: vec!["echo".into(), "hi".into()],
            })
            .unwrap();

        assert_eq!(
            lifecycle(&mut h.events, &[creating, entering]).await,
            vec![("start", creating), ("end", creating), ("start", entering), ("end", entering)]
        );
        assert_eq!(h.queue.get(entering).unwrap().status, OperationStatus::Succeeded);
        assert_eq!(h.inventory.generation(), 1);
        assert_eq!(h.inventory.list_sandboxes().len(), 1);
        assert!(h
            .tools
            .calls()
            .contains(&"distrobox enter dev --no-tty -- echo hi".to_string()));
    }

    #[tokio::test]
    async fn empty_search_is_rejected() {
        let h = harness();
        assert!(matches!(
            h.queue.submit(Intent::Search { query: "  ".into() }),
            Err(CoreError::Config(_))
        ));
        assert_eq!(
            h.queue.cancel(OperationId(99)),
            Err(CoreError::UnknownOperation(OperationId(99)))
        );
    }
}
