use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{CoreEvent, EventBus, EventListener, SubscriptionHandle};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::inventory::{merge_updates, Inventory};
use crate::model::{
    CatalogEntry, Intent, Operation, OperationId, OperationStatus, PackageRecord, SandboxRef,
};
use crate::parser::{self, classify_failure, guess_category, CATEGORIES};
use crate::process::{exit_code, CommandSpec, Completed, ProcessRunner};
use crate::queue::OperationQueue;
use crate::tools;

/// Listing attempts before a reconcile gives up on a moving inventory.
const RECONCILE_ATTEMPTS: usize = 3;

/// Versions of the external tools found on this system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStatus {
    pub flatpak: String,
    pub distrobox: Option<String>,
}

/// Entry point for front-ends: owns the queue, the inventory and the bus.
#[derive(Debug)]
pub struct Origami {
    config: Config,
    runner: ProcessRunner,
    bus: Arc<EventBus>,
    inventory: Arc<Inventory>,
    queue: OperationQueue,
}

impl Origami {
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config) -> CoreResult<Self> {
        let bus = Arc::new(EventBus::new());
        let inventory = Arc::new(Inventory::new());
        let queue = OperationQueue::new(config.clone(), bus.clone(), inventory.clone())?;
        Ok(Self {
            config,
            runner: ProcessRunner::new(),
            bus,
            inventory,
            queue,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> SubscriptionHandle {
        self.bus.subscribe(listener)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.bus.unsubscribe(handle)
    }

    pub fn submit(&self, intent: Intent) -> CoreResult<OperationId> {
        self.queue.submit(intent)
    }

    pub fn cancel(&self, id: OperationId) -> CoreResult<OperationStatus> {
        self.queue.cancel(id)
    }

    pub fn respond(&self, id: OperationId, answer: &str) -> CoreResult<()> {
        self.queue.respond(id, answer)
    }

    pub fn acknowledge(&self, id: OperationId) -> bool {
        self.queue.acknowledge(id)
    }

    pub fn get(&self, id: OperationId) -> CoreResult<Operation> {
        self.queue.get(id)
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.queue.operations()
    }

    pub async fn wait(&self, id: OperationId) -> CoreResult<Operation> {
        self.queue.wait(id).await
    }

    pub fn list_installed(&self) -> Vec<PackageRecord> {
        self.inventory.list_installed()
    }

    pub fn list_updates(&self) -> Vec<PackageRecord> {
        self.inventory.list_updates()
    }

    pub fn list_sandboxes(&self) -> Vec<SandboxRef> {
        self.inventory.list_sandboxes()
    }

    /// Search the remotes. Every call runs a fresh search operation; the
    /// stream yields its hits and ends with it.
    pub fn list_available(&self, query: &str) -> CoreResult<SearchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.queue.submit_search(query, tx)?;
        Ok(SearchStream {
            id,
            hits: rx,
            queue: self.queue.clone(),
        })
    }

    /// Everything the configured remote offers, grouped by category. With a
    /// `category`, only that category is kept; with a `term`, only entries
    /// whose id, name or description contain it. The listing also refreshes
    /// the metadata installs are described with.
    pub async fn list_catalog(
        &self,
        category: Option<&str>,
        term: Option<&str>,
    ) -> CoreResult<Vec<CatalogEntry>> {
        let category = match category {
            Some(wanted) => Some(
                CATEGORIES
                    .iter()
                    .find(|c| c.eq_ignore_ascii_case(wanted.trim()))
                    .ok_or_else(|| {
                        CoreError::Config(format!(
                            "unknown category `{wanted}`, expected one of {}",
                            CATEGORIES.join(", ")
                        ))
                    })?,
            ),
            None => None,
        };
        let term = term.map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty());

        let listed = self.list(&tools::list_catalog(&self.config)).await?;
        let records = parser::parse_catalog(
            &listed.stdout(),
            &self.config.default_remote,
            &self.config.default_branch,
        );
        self.inventory.replace_catalog(&records);
        debug!(entries = records.len(), "catalog listed");

        let mut entries: Vec<CatalogEntry> = records
            .into_iter()
            .map(|record| CatalogEntry {
                category: guess_category(&record.reference.id).to_string(),
                record,
            })
            .filter(|entry| category.map_or(true, |c| entry.category == *c))
            .filter(|entry| {
                term.as_deref().map_or(true, |t| {
                    entry.record.reference.id.to_lowercase().contains(t)
                        || entry.record.name.to_lowercase().contains(t)
                        || entry.record.description.to_lowercase().contains(t)
                })
            })
            .collect();
        entries.sort_by_cached_key(|entry| {
            let rank = CATEGORIES.iter().position(|c| *c == entry.category);
            (rank, entry.record.name.to_lowercase())
        });
        Ok(entries)
    }

    /// Re-list installed packages, pending updates and sandboxes and swap
    /// them in as one snapshot. Returns the resulting generation.
    ///
    /// If an operation finishes while the listing runs, the listing is
    /// repeated so that older data never replaces a newer outcome.
    pub async fn reconcile(&self) -> CoreResult<u64> {
        for attempt in 1..=RECONCILE_ATTEMPTS {
            let generation = self.inventory.generation();

            let installed = self.list(&tools::list_installed(&self.config)).await?;
            let mut packages = parser::parse_installed(&installed.stdout());
            let updates = self.list(&tools::list_updates(&self.config)).await?;
            merge_updates(&mut packages, &parser::parse_updates(&updates.stdout()));
            let sandboxes = self.sandboxes().await?;

            if let Some(next) = self
                .inventory
                .replace_if_unchanged(generation, packages, sandboxes)
            {
                info!(generation = next, "inventory reconciled");
                self.bus.publish(&CoreEvent::InventoryChanged { generation: next });
                return Ok(next);
            }
            debug!(attempt, "inventory changed while listing, listing again");
        }

        warn!("inventory kept changing, keeping the newer outcomes");
        Ok(self.inventory.generation())
    }

    /// Make sure the configured remote exists. Returns `true` if it had to
    /// be added.
    pub async fn ensure_remote(&self) -> CoreResult<bool> {
        let remotes = self.list(&tools::list_remotes(&self.config)).await?;
        if parser::parse_remotes(&remotes.stdout())
            .iter()
            .any(|name| *name == self.config.default_remote)
        {
            debug!(remote = %self.config.default_remote, "remote already configured");
            return Ok(false);
        }

        info!(
            remote = %self.config.default_remote,
            url = %self.config.remote_url,
            "adding remote"
        );
        self.list(&tools::add_remote(&self.config)).await?;
        Ok(true)
    }

    /// Start an installed application. It is not tracked as an operation.
    pub async fn launch(&self, app_id: &str) -> CoreResult<u32> {
        if app_id.trim().is_empty() {
            return Err(CoreError::Config("no application id given".into()));
        }
        self.runner
            .spawn_detached(&tools::run_app(&self.config, app_id.trim()))
            .await
    }

    /// Check that flatpak runs, and whether distrobox is available.
    pub async fn check_tools(&self) -> CoreResult<ToolStatus> {
        let flatpak = self.list(&tools::flatpak_version(&self.config)).await?;
        let distrobox = match self.execute(&tools::distrobox_version(&self.config)).await {
            Ok(done) => Some(first_line(&done.stdout())),
            Err(err) => {
                debug!(err = %err, "distrobox unavailable");
                None
            }
        };
        Ok(ToolStatus {
            flatpak: first_line(&flatpak.stdout()),
            distrobox,
        })
    }

    /// `distrobox list`, treating a missing distrobox as "no sandboxes"
    /// rather than a configuration problem.
    async fn sandboxes(&self) -> CoreResult<Vec<SandboxRef>> {
        match self.execute(&tools::list_sandboxes(&self.config)).await {
            Ok(done) => Ok(parser::parse_sandboxes(&done.stdout())),
            Err(CoreError::SpawnFailure { program, .. }) => {
                debug!(program = %program, "distrobox not installed, no sandboxes");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    /// [`execute`](Self::execute), reporting a tool that cannot be started
    /// as a configuration problem.
    async fn list(&self, spec: &CommandSpec) -> CoreResult<Completed> {
        self.execute(spec).await.map_err(|err| {
            if matches!(err, CoreError::SpawnFailure { .. } | CoreError::PermissionDenied(_)) {
                self.bus.report_problem(&spec.program, err.to_string());
            }
            err
        })
    }

    /// Run a short listing command and fail on a non-zero exit.
    async fn execute(&self, spec: &CommandSpec) -> CoreResult<Completed> {
        let done = self.runner.run_to_end(spec).await?;
        if done.status.success() {
            return Ok(done);
        }

        let code = exit_code(done.status);
        let stderr = done.stderr();
        let summary = stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(|l| l.trim_start_matches("error:").trim().to_string())
            .unwrap_or_else(|| format!("`{spec}` exited with status {code}"));
        let tail: Vec<String> = done
            .lines
            .iter()
            .rev()
            .take(self.config.log_tail_lines)
            .rev()
            .map(|l| l.text.clone())
            .collect();
        warn!(command = %spec, code, summary = %summary, "listing command failed");
        Err(classify_failure(&stderr).into_error(summary, code, tail))
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().trim().to_string()
}

/// Hits of one search, in the order the tool printed them. Not restartable:
/// search again for fresh results.
#[derive(Debug)]
pub struct SearchStream {
    id: OperationId,
    hits: mpsc::UnboundedReceiver<PackageRecord>,
    queue: OperationQueue,
}

impl SearchStream {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// The terminal state of the search operation.
    pub async fn outcome(&self) -> CoreResult<Operation> {
        self.queue.wait(self.id).await
    }
}

impl Stream for SearchStream {
    type Item = PackageRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().hits.poll_recv(cx)
    }
}
