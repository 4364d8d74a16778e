use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::sync::mpsc::UnboundedReceiver;

use origami::bus::{ChannelListener, CoreEvent};
use origami::config::Config;
use origami::model::{Confirmation, InstallScope, Intent, OperationId, OperationStatus, PackageRef};
use origami::Origami;

use crate::utils::{self, confirm};

#[derive(Parser)]
#[clap(name = "origami")]
#[clap(about = "Flatpak applications and distrobox sandboxes from one queue", long_about = "Flatpak applications and distrobox sandboxes from one queue.\n\nPackages are given as `id`, `id//branch` or `remote:id//branch`; the\nremote and branch default to the configured ones (flathub, stable).")]
pub struct Cli {
    /// Don't ask for confirmation
    #[clap(short, long, global = true)]
    pub yes: bool,
    /// Operate on the system-wide installation
    #[clap(long, global = true)]
    pub system: bool,
    /// Debug logging on stderr
    #[clap(short, long, global = true)]
    pub verbose: bool,
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Search the remotes
    Search {
        /// Search query
        query: String,
    },
    /// Browse everything the configured remote offers
    Browse {
        /// Only show this category (Network, Office, Graphics, ...)
        #[clap(short, long)]
        category: Option<String>,
        /// Only show applications whose id, name or description contain this
        #[clap(short, long)]
        filter: Option<String>,
    },
    /// Install packages
    Install {
        /// Packages to install
        #[clap(required = true)]
        packages: Vec<String>,
    },
    /// Remove packages
    Remove {
        /// Packages to remove
        #[clap(required = true)]
        packages: Vec<String>,
    },
    /// Update packages
    Update {
        /// Packages to update (if empty, update all)
        packages: Vec<String>,
    },
    /// List installed packages
    List {
        /// Show only packages with an update
        #[clap(short, long)]
        updates: bool,
    },
    /// Manage distrobox sandboxes
    Sandbox {
        #[clap(subcommand)]
        subcommand: SandboxSubcommand,
    },
    /// Launch an installed application
    Run {
        /// Application id
        app: String,
    },
    /// Re-read installed packages and sandboxes
    Reconcile,
    /// Manage flatpak remotes
    Remote {
        #[clap(subcommand)]
        subcommand: RemoteSubcommand,
    },
    /// Check that flatpak and distrobox are usable
    Check,
}

#[derive(Subcommand)]
pub enum SandboxSubcommand {
    /// Create a sandbox
    Create {
        /// Sandbox name
        name: String,
        /// Container image (defaults to the configured one)
        #[clap(short, long)]
        image: Option<String>,
    },
    /// Run a command inside a sandbox
    Enter {
        /// Sandbox name
        name: String,
        /// Command to run
        #[clap(last = true)]
        command: Vec<String>,
    },
    /// List sandboxes
    List,
    /// Delete a sandbox
    Rm {
        /// Sandbox name
        name: String,
    },
}

#[derive(Subcommand)]
pub enum RemoteSubcommand {
    /// Add the configured remote if it is missing
    Ensure,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let mut config = Config::load().context("failed to load configuration")?;
        if self.system {
            config.scope = InstallScope::System;
        }
        if self.yes {
            config.auto_confirm = true;
        }
        let core = Origami::new(config.clone())?;
        let (listener, mut events) = ChannelListener::new();
        core.subscribe(Arc::new(listener));
        let scope = config.scope;

        match self.command {
            Commands::Search { query } => {
                let mut hits = core.list_available(&query)?;
                let mut found = 0;
                while let Some(record) = hits.next().await {
                    utils::print_package(&record);
                    found += 1;
                }
                let op = hits.outcome().await?;
                if op.status != OperationStatus::Succeeded {
                    utils::print_outcome(&op);
                    anyhow::bail!("search failed");
                }
                if found == 0 {
                    utils::print_info(&format!("No matches for \"{}\"", query));
                }
            }
            Commands::Browse { category, filter } => {
                let entries = core
                    .list_catalog(category.as_deref(), filter.as_deref())
                    .await?;
                if entries.is_empty() {
                    utils::print_info("No applications found");
                }
                let mut current = None;
                for entry in &entries {
                    if current != Some(&entry.category) {
                        utils::print_category(&entry.category);
                        current = Some(&entry.category);
                    }
                    utils::print_package(&entry.record);
                }
            }
            Commands::Install { packages } => {
                let refs = parse_refs(&packages, &config)?;
                if !self.yes && !confirm(&format!("Install {} flatpak(s)?", refs.len()))? {
                    utils::print_info("Installation cancelled");
                    return Ok(());
                }
                let intents = refs
                    .into_iter()
                    .map(|package| Intent::Install { package, scope })
                    .collect();
                run_operations(&core, &mut events, intents, self.yes).await?;
            }
            Commands::Remove { packages } => {
                let refs = parse_refs(&packages, &config)?;
                if !self.yes && !confirm(&format!("Remove {} flatpak(s)?", refs.len()))? {
                    utils::print_info("Removal cancelled");
                    return Ok(());
                }
                let intents = refs
                    .into_iter()
                    .map(|package| Intent::Remove { package, scope })
                    .collect();
                run_operations(&core, &mut events, intents, self.yes).await?;
            }
            Commands::Update { packages } => {
                let intents = if packages.is_empty() {
                    vec![Intent::Update { package: None, scope }]
                } else {
                    parse_refs(&packages, &config)?
                        .into_iter()
                        .map(|package| Intent::Update {
                            package: Some(package),
                            scope,
                        })
                        .collect()
                };
                run_operations(&core, &mut events, intents, self.yes).await?;
            }
            Commands::List { updates } => {
                core.reconcile().await?;
                let records = if updates {
                    core.list_updates()
                } else {
                    core.list_installed()
                };
                if records.is_empty() {
                    utils::print_info(if updates {
                        "Everything is up to date"
                    } else {
                        "No applications installed"
                    });
                }
                for record in &records {
                    if updates {
                        utils::print_update(record);
                    } else {
                        utils::print_package(record);
                    }
                }
            }
            Commands::Sandbox { subcommand } => match subcommand {
                SandboxSubcommand::Create { name, image } => {
                    let image = image.unwrap_or_else(|| config.default_image.clone());
                    let intents = vec![Intent::CreateSandbox { name, image }];
                    run_operations(&core, &mut events, intents, self.yes).await?;
                }
                SandboxSubcommand::Enter { name, command } => {
                    let intents = vec![Intent::EnterSandbox { name, command }];
                    run_operations(&core, &mut events, intents, self.yes).await?;
                }
                SandboxSubcommand::List => {
                    core.reconcile().await?;
                    let sandboxes = core.list_sandboxes();
                    if sandboxes.is_empty() {
                        utils::print_info("No sandboxes");
                    }
                    for sandbox in &sandboxes {
                        utils::print_sandbox(sandbox);
                    }
                }
                SandboxSubcommand::Rm { name } => {
                    if !self.yes && !confirm(&format!("Delete sandbox {}?", name))? {
                        utils::print_info("Deletion cancelled");
                        return Ok(());
                    }
                    let intents = vec![Intent::DeleteSandbox { name }];
                    run_operations(&core, &mut events, intents, self.yes).await?;
                }
            },
            Commands::Run { app } => {
                let pid = core.launch(&app).await?;
                utils::print_success(&format!("Launched {} (pid {})", app, pid));
            }
            Commands::Reconcile => {
                let generation = core.reconcile().await?;
                utils::print_success(&format!(
                    "{} applications, {} sandboxes (generation {})",
                    core.list_installed().len(),
                    core.list_sandboxes().len(),
                    generation
                ));
            }
            Commands::Remote { subcommand } => match subcommand {
                RemoteSubcommand::Ensure => {
                    if core.ensure_remote().await? {
                        utils::print_success(&format!("Added remote {}", config.default_remote));
                    } else {
                        utils::print_info(&format!("Remote {} already configured", config.default_remote));
                    }
                }
            },
            Commands::Check => {
                let status = core.check_tools().await?;
                utils::print_success(&status.flatpak);
                match status.distrobox {
                    Some(version) => utils::print_success(&version),
                    None => utils::print_warning("distrobox not found, sandboxes are unavailable"),
                }
            }
        }
        Ok(())
    }
}

fn parse_refs(packages: &[String], config: &Config) -> Result<Vec<PackageRef>> {
    packages
        .iter()
        .map(|p| {
            PackageRef::parse(p, &config.default_remote, &config.default_branch)
                .map_err(anyhow::Error::from)
        })
        .collect()
}

/// Submit `intents` and render their events until every one has finished.
/// Ctrl-C cancels whatever is still pending.
async fn run_operations(
    core: &Origami,
    events: &mut UnboundedReceiver<CoreEvent>,
    intents: Vec<Intent>,
    yes: bool,
) -> Result<()> {
    let mut ids = Vec::new();
    let mut failed = 0;
    for intent in intents {
        let target = intent.target();
        match core.submit(intent) {
            Ok(id) if !ids.contains(&id) => ids.push(id),
            Ok(_) => {}
            Err(e) => {
                utils::print_error(&format!("{}: {}", target, e));
                failed += 1;
            }
        }
    }

    let echoed: HashSet<OperationId> = ids
        .iter()
        .copied()
        .filter(|id| {
            core.queue()
                .get(*id)
                .map(|op| !op.kind().is_mutation())
                .unwrap_or(false)
        })
        .collect();
    let mut pending: HashSet<OperationId> = ids.iter().copied().collect();

    while !pending.is_empty() {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                utils::print_warning("Cancelling...");
                for id in &pending {
                    core.cancel(*id)?;
                }
                continue;
            }
        };
        let Some(event) = event else { break };

        match event {
            CoreEvent::Output { id, line } if echoed.contains(&id) => println!("{}", line),
            CoreEvent::Progress { id, progress, message } if pending.contains(&id) => {
                utils::print_progress(progress, &message);
            }
            CoreEvent::ConfirmationRequired { id, confirmation } if pending.contains(&id) => {
                let answer = answer_prompt(confirmation, yes).await?;
                core.respond(id, &answer)?;
            }
            CoreEvent::ConfigurationProblem { program, message } => {
                utils::print_error(&format!("{}: {}", program, message));
            }
            CoreEvent::Finished { id, .. } => {
                pending.remove(&id);
            }
            _ => {}
        }
    }

    for id in ids {
        let op = core.wait(id).await?;
        utils::print_outcome(&op);
        if op.status != OperationStatus::Succeeded {
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} operation(s) did not succeed", failed);
    }
    Ok(())
}

async fn answer_prompt(confirmation: Confirmation, yes: bool) -> Result<String> {
    if yes {
        // Numbered choices start with 0, which aborts.
        let accept = confirmation
            .options
            .iter()
            .find(|o| *o == "y" || *o == "1")
            .or(confirmation.options.first())
            .cloned()
            .unwrap_or_else(|| "y".to_string());
        return Ok(accept);
    }
    tokio::task::spawn_blocking(move || utils::choose(&confirmation.prompt, &confirmation.options))
        .await
        .context("prompt task failed")?
}
