//! Orchestration core for a flatpak and distrobox front-end.
//!
//! [`Origami`] ties together the pieces: intents go into the
//! [`OperationQueue`], each running operation drives one child process
//! through the [`ProcessRunner`] and the [`OutputParser`], confirmed outcomes
//! land in the [`Inventory`], and everything observable is published on the
//! [`EventBus`].

pub mod bus;
pub mod config;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod model;
pub mod parser;
pub mod process;
pub mod queue;
pub mod service;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_support;

pub use crate::bus::{ChannelListener, CoreEvent, EventBus, EventListener, FnListener, SubscriptionHandle};
pub use crate::config::Config;
pub use crate::error::{CoreError, CoreResult};
pub use crate::inventory::{Inventory, Snapshot};
pub use crate::model::{
    CatalogEntry, Confirmation, InstallScope, Intent, Operation, OperationId, OperationKind, OperationStatus,
    PackageRecord, PackageRef, Progress, SandboxRef, Target, TargetKey,
};
pub use crate::parser::OutputParser;
pub use crate::process::ProcessRunner;
pub use crate::queue::OperationQueue;
pub use crate::service::{Origami, SearchStream, ToolStatus};
