use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::CoreError;
use crate::model::{Confirmation, OperationId, OperationKind, OperationStatus, Progress, Target};

#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Queued {
        id: OperationId,
        kind: OperationKind,
        target: Target,
    },
    Started {
        id: OperationId,
    },
    Output {
        id: OperationId,
        line: String,
    },
    Progress {
        id: OperationId,
        progress: Progress,
        message: String,
    },
    ConfirmationRequired {
        id: OperationId,
        confirmation: Confirmation,
    },
    Finished {
        id: OperationId,
        kind: OperationKind,
        target: Target,
        status: OperationStatus,
        summary: String,
        error: Option<CoreError>,
    },
    InventoryChanged {
        generation: u64,
    },
    /// A tool could not be started at all. Sent once per program.
    ConfigurationProblem {
        program: String,
        message: String,
    },
}

impl CoreEvent {
    pub fn operation(&self) -> Option<OperationId> {
        match self {
            CoreEvent::Queued { id, .. }
            | CoreEvent::Started { id }
            | CoreEvent::Output { id, .. }
            | CoreEvent::Progress { id, .. }
            | CoreEvent::ConfirmationRequired { id, .. }
            | CoreEvent::Finished { id, .. } => Some(*id),
            CoreEvent::InventoryChanged { .. } | CoreEvent::ConfigurationProblem { .. } => None,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &CoreEvent);
}

/// Adapts a closure to [`EventListener`].
pub struct FnListener<F>(pub F);

impl<F> EventListener for FnListener<F>
where
    F: Fn(&CoreEvent) + Send + Sync,
{
    fn on_event(&self, event: &CoreEvent) {
        (self.0)(event);
    }
}

/// Forwards every event into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: &CoreEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type Listeners = Vec<(SubscriptionHandle, Arc<dyn EventListener>)>;

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Listeners>,
    next: AtomicU64,
    /// Programs already reported through `ConfigurationProblem`.
    reported: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle, listener));
        handle
    }

    /// Returns `false` if the handle was not subscribed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(h, _)| *h != handle);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish `ConfigurationProblem` for `program` unless it was already
    /// reported this session. Returns whether the event went out.
    pub fn report_problem(&self, program: &str, message: String) -> bool {
        let first = self
            .reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(program.to_string());
        if first {
            self.publish(&CoreEvent::ConfigurationProblem {
                program: program.to_string(),
                message,
            });
        }
        first
    }

    /// Deliver to every listener subscribed at the time of the call. A
    /// listener that panics is logged and skipped; the others still run.
    pub fn publish(&self, event: &CoreEvent) {
        let snapshot: Listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (handle, listener) in snapshot {
            let delivered = catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            if delivered.is_err() {
                warn!(subscription = handle.0, ?event, "event listener panicked");
            }
        }
    }
}
