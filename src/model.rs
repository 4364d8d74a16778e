use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Identity of a flatpak: remote, application id and branch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageRef {
    pub origin: String,
    pub id: String,
    pub branch: String,
}

impl PackageRef {
    pub fn new(origin: impl Into<String>, id: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            id: id.into(),
            branch: branch.into(),
        }
    }

    /// Parse `id`, `id//branch` or `origin:id//branch`, filling in the blanks
    /// from the given defaults.
    pub fn parse(input: &str, default_origin: &str, default_branch: &str) -> Result<Self, CoreError> {
        let input = input.trim();
        let (origin, rest) = match input.split_once(':') {
            Some((origin, rest)) => (origin.trim(), rest.trim()),
            None => (default_origin, input),
        };
        let (id, branch) = match rest.split_once("//") {
            Some((id, branch)) => (id.trim(), branch.trim()),
            None => (rest, default_branch),
        };
        if origin.is_empty() || id.is_empty() || branch.is_empty() || id.contains(char::is_whitespace) {
            return Err(CoreError::Config(format!("invalid package reference `{input}`")));
        }
        Ok(Self::new(origin, id, branch))
    }

    /// The `id//branch` form understood by `flatpak install/update/uninstall`.
    pub fn flatpak_ref(&self) -> String {
        format!("{}//{}", self.id, self.branch)
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}//{}", self.origin, self.id, self.branch)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallScope {
    #[default]
    User,
    System,
}

impl InstallScope {
    pub fn flag(self) -> &'static str {
        match self {
            InstallScope::User => "--user",
            InstallScope::System => "--system",
        }
    }

    /// Map the `installation` column of `flatpak list`.
    pub fn from_column(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("system") {
            InstallScope::System
        } else {
            InstallScope::User
        }
    }
}

/// Metadata for a package, installed or found by a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub reference: PackageRef,
    pub name: String,
    pub description: String,
    pub size: String,
    pub installed_version: Option<String>,
    pub available_version: Option<String>,
    pub scope: InstallScope,
}

impl PackageRecord {
    pub fn new(reference: PackageRef) -> Self {
        let name = reference.id.clone();
        Self {
            reference,
            name,
            description: String::new(),
            size: String::new(),
            installed_version: None,
            available_version: None,
            scope: InstallScope::User,
        }
    }

    pub fn has_update(&self) -> bool {
        match (&self.installed_version, &self.available_version) {
            (Some(installed), Some(available)) => installed != available,
            _ => false,
        }
    }
}

/// An application offered by a remote, filed under a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub category: String,
    pub record: PackageRecord,
}

/// A distrobox container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRef {
    pub name: String,
    pub image: String,
    pub created: String,
    pub status: String,
}

/// Identity used to serialize conflicting operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey(String);

/// Key of update-all, which touches every `package:` key.
const ALL_PACKAGES: &str = "package:*";

impl TargetKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether operations on the two keys may touch the same thing.
    pub fn overlaps(&self, other: &TargetKey) -> bool {
        let covers = |all: &TargetKey, key: &TargetKey| {
            all.0 == ALL_PACKAGES && key.0.starts_with("package:")
        };
        self == other || covers(self, other) || covers(other, self)
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Package(PackageRef),
    /// Every installed package, used by update-all.
    AllPackages,
    Sandbox(String),
    Query(String),
}

impl Target {
    pub fn key(&self) -> TargetKey {
        TargetKey(match self {
            Target::Package(reference) => format!("package:{reference}"),
            Target::AllPackages => ALL_PACKAGES.to_string(),
            Target::Sandbox(name) => format!("sandbox:{name}"),
            Target::Query(query) => format!("query:{}", query.trim().to_lowercase()),
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Package(reference) => write!(f, "{reference}"),
            Target::AllPackages => f.write_str("all packages"),
            Target::Sandbox(name) => write!(f, "sandbox {name}"),
            Target::Query(query) => write!(f, "\"{query}\""),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Search,
    Install,
    Update,
    Remove,
    CreateSandbox,
    EnterSandbox,
    DeleteSandbox,
}

impl OperationKind {
    pub fn is_mutation(self) -> bool {
        !matches!(self, OperationKind::Search | OperationKind::EnterSandbox)
    }

    /// Resubmitting one of these while it is still pending returns the
    /// existing operation.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            OperationKind::Install | OperationKind::Update | OperationKind::Remove
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Search => "search",
            OperationKind::Install => "install",
            OperationKind::Update => "update",
            OperationKind::Remove => "remove",
            OperationKind::CreateSandbox => "create-sandbox",
            OperationKind::EnterSandbox => "enter-sandbox",
            OperationKind::DeleteSandbox => "delete-sandbox",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::Queued => "queued",
            OperationStatus::Running => "running",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    Fraction(f32),
    Indeterminate,
}

impl Progress {
    /// Clamp into `[0, 1]`.
    pub fn fraction(value: f32) -> Self {
        Progress::Fraction(value.clamp(0.0, 1.0))
    }
}

/// Something the presentation layer asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Search {
        query: String,
    },
    Install {
        package: PackageRef,
        scope: InstallScope,
    },
    /// `package: None` updates everything installed in `scope`.
    Update {
        package: Option<PackageRef>,
        scope: InstallScope,
    },
    Remove {
        package: PackageRef,
        scope: InstallScope,
    },
    CreateSandbox {
        name: String,
        image: String,
    },
    EnterSandbox {
        name: String,
        command: Vec<String>,
    },
    DeleteSandbox {
        name: String,
    },
}

impl Intent {
    pub fn kind(&self) -> OperationKind {
        match self {
            Intent::Search { .. } => OperationKind::Search,
            Intent::Install { .. } => OperationKind::Install,
            Intent::Update { .. } => OperationKind::Update,
            Intent::Remove { .. } => OperationKind::Remove,
            Intent::CreateSandbox { .. } => OperationKind::CreateSandbox,
            Intent::EnterSandbox { .. } => OperationKind::EnterSandbox,
            Intent::DeleteSandbox { .. } => OperationKind::DeleteSandbox,
        }
    }

    pub fn target(&self) -> Target {
        match self {
            Intent::Search { query } => Target::Query(query.clone()),
            Intent::Install { package, .. } | Intent::Remove { package, .. } => {
                Target::Package(package.clone())
            }
            Intent::Update { package: Some(package), .. } => Target::Package(package.clone()),
            Intent::Update { package: None, .. } => Target::AllPackages,
            Intent::CreateSandbox { name, .. }
            | Intent::EnterSandbox { name, .. }
            | Intent::DeleteSandbox { name } => Target::Sandbox(name.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub prompt: String,
    pub options: Vec<String>,
}

/// A tracked unit of work. Clones handed out by the queue are snapshots.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OperationId,
    pub intent: Intent,
    pub status: OperationStatus,
    pub progress: Progress,
    pub message: String,
    pub log: VecDeque<String>,
    pub dropped_lines: usize,
    pub confirmation: Option<Confirmation>,
    pub summary: Option<String>,
    pub error: Option<CoreError>,
}

impl Operation {
    pub fn new(id: OperationId, intent: Intent) -> Self {
        Self {
            id,
            intent,
            status: OperationStatus::Queued,
            progress: Progress::Indeterminate,
            message: String::new(),
            log: VecDeque::new(),
            dropped_lines: 0,
            confirmation: None,
            summary: None,
            error: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.intent.kind()
    }

    pub fn target(&self) -> Target {
        self.intent.target()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append a raw output line, dropping the oldest once `limit` is reached.
    pub fn push_log(&mut self, line: String, limit: usize) {
        if limit == 0 {
            self.dropped_lines += 1;
            return;
        }
        while self.log.len() >= limit {
            self.log.pop_front();
            self.dropped_lines += 1;
        }
        self.log.push_back(line);
    }

    pub fn log_tail(&self, lines: usize) -> Vec<String> {
        let skip = self.log.len().saturating_sub(lines);
        self.log.iter().skip(skip).cloned().collect()
    }
}
