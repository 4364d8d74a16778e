//! Line-oriented parsing of `flatpak` and `distrobox` output.
//!
//! Streaming output goes through [`OutputParser`], one instance per
//! operation. Matching anchors on stable tokens (percent signs, bracketed
//! option lists, `error:` prefixes) and never decides an outcome from a line
//! it does not recognize. Tabular listings requested with `--columns` are
//! handled by the `parse_*` functions at the bottom.

use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::error::CoreError;
use crate::model::{
    Confirmation, InstallScope, OperationKind, PackageRecord, PackageRef, Progress, SandboxRef,
};

pub const SEARCH_COLUMNS: &str = "application,branch,remotes,version,name,description";
pub const INSTALLED_COLUMNS: &str =
    "application,branch,origin,version,name,description,installation,size";
pub const UPDATE_COLUMNS: &str = "application,branch,origin,version";
pub const CATALOG_COLUMNS: &str = "application,name,description";

/// Every value [`guess_category`] can return.
pub const CATEGORIES: [&str; 8] = [
    "Network",
    "Office",
    "Graphics",
    "AudioVideo",
    "Game",
    "Development",
    "Utility",
    "Other",
];

/// Why a tool said it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NetworkUnavailable,
    RemoteNotFound,
    PermissionDenied,
    Other,
}

impl FailureKind {
    /// The error a failed command is reported with. `Other` keeps the exit
    /// code and the captured output.
    pub fn into_error(self, summary: String, code: i32, log_tail: Vec<String>) -> CoreError {
        match self {
            FailureKind::NetworkUnavailable => CoreError::NetworkUnavailable(summary),
            FailureKind::RemoteNotFound => CoreError::RemoteNotFound(summary),
            FailureKind::PermissionDenied => CoreError::PermissionDenied(summary),
            FailureKind::Other => CoreError::ProcessNonZeroExit {
                code,
                summary,
                log_tail,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    Progress {
        progress: Progress,
        message: String,
    },
    ConfirmationRequired(Confirmation),
    Result {
        success: bool,
        summary: String,
        failure: Option<FailureKind>,
    },
    SearchHit(PackageRecord),
    /// Partially matched line. Logged, never fatal.
    Ambiguous {
        line: String,
        reason: String,
    },
}

struct Patterns {
    ansi: Regex,
    percent: Regex,
    step: Regex,
    phase: Regex,
    yes_no: Regex,
    choice: Regex,
    error: Regex,
    network: Regex,
    permission: Regex,
    not_found: Regex,
    success: Regex,
    no_matches: Regex,
    sandbox_exists: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("static pattern");
        Patterns {
            ansi: re(r"\x1b\[[0-9;?]*[A-Za-z]"),
            percent: re(r"(\d{1,4}(?:\.\d+)?)\s*%"),
            step: re(r"(?i)^\s*(?:installing|updating|uninstalling|downloading)\s+(\d+)/(\d+)"),
            phase: re(
                r"(?i)^\s*(looking for matches|looking for updates|downloading|installing|uninstalling|updating|creating|pulling|removing|starting|setting up)\b",
            ),
            yes_no: re(r"\[(?:Y/n|y/N|y/n|Y/N)\]"),
            choice: re(r"\[(\d+)-(\d+)\]"),
            error: re(r"(?i)^\s*error:\s*(.*)$"),
            network: re(
                r"(?i)(could not resolve|unable to connect|network is unreachable|could not connect|timeout was reached|no route to host|temporary failure in name resolution|failed to connect)",
            ),
            permission: re(
                r"(?i)(permission denied|not authorized|authentication|authorization|not allowed)",
            ),
            not_found: re(
                r"(?i)(no remote refs found|remote .* not found|nothing matches|no such remote|not found|does not exist|no such container|unknown remote)",
            ),
            success: re(
                r"(?i)(installation complete\.|uninstall complete\.|updates complete\.|changes complete\.|nothing to do\.|successfully created)",
            ),
            no_matches: re(r"(?i)^\s*no matches found"),
            sandbox_exists: re(r"(?i)container .* already exists"),
        }
    })
}

/// Classify a failure message by its most stable tokens.
pub fn classify_failure(text: &str) -> FailureKind {
    let p = patterns();
    if p.network.is_match(text) {
        FailureKind::NetworkUnavailable
    } else if p.permission.is_match(text) {
        FailureKind::PermissionDenied
    } else if p.not_found.is_match(text) {
        FailureKind::RemoteNotFound
    } else {
        FailureKind::Other
    }
}

pub fn strip_ansi(line: &str) -> String {
    patterns().ansi.replace_all(line, "").into_owned()
}

/// Per-operation streaming parser.
#[derive(Debug, Clone)]
pub struct OutputParser {
    kind: OperationKind,
    failure_hint: Option<FailureKind>,
    saw_result: Option<bool>,
}

impl OutputParser {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            failure_hint: None,
            saw_result: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Forget everything seen so far.
    pub fn reset(&mut self) {
        self.failure_hint = None;
        self.saw_result = None;
    }

    /// The most specific failure cause seen in the output, if any.
    pub fn failure_hint(&self) -> Option<FailureKind> {
        self.failure_hint
    }

    /// `Some(success)` once a terminal marker was recognized.
    pub fn saw_result(&self) -> Option<bool> {
        self.saw_result
    }

    pub fn feed(&mut self, raw: &str) -> Vec<ParsedEvent> {
        let line = strip_ansi(raw);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let p = patterns();

        if let Some(caps) = p.error.captures(trimmed) {
            let message = caps.get(1).map_or("", |m| m.as_str()).trim().to_string();
            let failure = classify_failure(&message);
            self.note_failure(failure);
            return vec![self.result(false, message, Some(failure))];
        }

        if self.kind == OperationKind::CreateSandbox && p.sandbox_exists.is_match(trimmed) {
            self.note_failure(FailureKind::Other);
            return vec![self.result(false, trimmed.to_string(), Some(FailureKind::Other))];
        }

        if let Some(confirmation) = parse_confirmation(trimmed) {
            return vec![ParsedEvent::ConfirmationRequired(confirmation)];
        }

        if self.kind == OperationKind::Search {
            if p.no_matches.is_match(trimmed) {
                return vec![self.result(true, "no matches found".to_string(), None)];
            }
            if line.contains('\t') {
                let hits: Vec<ParsedEvent> =
                    parse_search_row(&line).map(ParsedEvent::SearchHit).collect();
                if hits.is_empty() {
                    return vec![ParsedEvent::Ambiguous {
                        line: line.clone(),
                        reason: "search row with unexpected columns".to_string(),
                    }];
                }
                return hits;
            }
        }

        if p.success.is_match(trimmed) {
            return vec![self.result(true, trimmed.to_string(), None)];
        }

        // Error text that arrives without an `error:` prefix, typically on
        // stderr, only sharpens the diagnosis of a later non-zero exit.
        let failure = classify_failure(trimmed);
        if failure != FailureKind::Other && !p.phase.is_match(trimmed) {
            self.note_failure(failure);
            return Vec::new();
        }

        self.progress(trimmed)
    }

    fn progress(&self, line: &str) -> Vec<ParsedEvent> {
        let p = patterns();
        let percent = p
            .percent
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f32>().ok());

        if let Some(pct) = percent {
            if pct > 100.0 {
                return vec![ParsedEvent::Ambiguous {
                    line: line.to_string(),
                    reason: format!("percentage {pct} out of range"),
                }];
            }
            let mut fraction = pct / 100.0;
            if let Some((step, total)) = step_of(line) {
                fraction = ((step - 1) as f32 + fraction) / total as f32;
            }
            return vec![ParsedEvent::Progress {
                progress: Progress::fraction(fraction),
                message: line.to_string(),
            }];
        }

        if let Some((step, total)) = step_of(line) {
            return vec![ParsedEvent::Progress {
                progress: Progress::fraction((step - 1) as f32 / total as f32),
                message: line.to_string(),
            }];
        }

        if p.phase.is_match(line) {
            return vec![ParsedEvent::Progress {
                progress: Progress::Indeterminate,
                message: line.to_string(),
            }];
        }

        Vec::new()
    }

    fn note_failure(&mut self, failure: FailureKind) {
        // Keep the most specific cause seen.
        if self.failure_hint.is_none() || self.failure_hint == Some(FailureKind::Other) {
            self.failure_hint = Some(failure);
        }
    }

    fn result(&mut self, success: bool, summary: String, failure: Option<FailureKind>) -> ParsedEvent {
        // A failure marker sticks even if a success marker follows.
        self.saw_result = Some(self.saw_result.unwrap_or(true) && success);
        ParsedEvent::Result {
            success,
            summary,
            failure,
        }
    }
}

fn step_of(line: &str) -> Option<(u32, u32)> {
    let caps = patterns().step.captures(line)?;
    let step: u32 = caps.get(1)?.as_str().parse().ok()?;
    let total: u32 = caps.get(2)?.as_str().parse().ok()?;
    (step >= 1 && total >= step).then_some((step, total))
}

fn parse_confirmation(line: &str) -> Option<Confirmation> {
    let p = patterns();
    if p.yes_no.is_match(line) {
        return Some(Confirmation {
            prompt: line.to_string(),
            options: vec!["y".to_string(), "n".to_string()],
        });
    }
    let caps = p.choice.captures(line)?;
    let lo: u32 = caps.get(1)?.as_str().parse().ok()?;
    let hi: u32 = caps.get(2)?.as_str().parse().ok()?;
    if lo > hi || hi - lo > 64 {
        return None;
    }
    Some(Confirmation {
        prompt: line.to_string(),
        options: (lo..=hi).map(|n| n.to_string()).collect(),
    })
}

fn looks_like_app_id(id: &str) -> bool {
    id.contains('.') && !id.contains(char::is_whitespace)
}

/// One search row per remote it is available from.
pub fn parse_search_row(line: &str) -> impl Iterator<Item = PackageRecord> {
    let cols: Vec<String> = line.split('\t').map(|c| c.trim().to_string()).collect();
    let rows = if cols.len() >= 3 && looks_like_app_id(&cols[0]) {
        let branch = cols[1].clone();
        let version = cols.get(3).filter(|v| !v.is_empty()).cloned();
        let name = cols.get(4).filter(|n| !n.is_empty()).cloned().unwrap_or_else(|| cols[0].clone());
        let description = cols.get(5).cloned().unwrap_or_default();
        cols[2]
            .split(',')
            .map(str::trim)
            .filter(|remote| !remote.is_empty())
            .map(|remote| PackageRecord {
                reference: PackageRef::new(remote, cols[0].clone(), branch.clone()),
                name: name.clone(),
                description: description.clone(),
                size: String::new(),
                installed_version: None,
                available_version: version.clone(),
                scope: InstallScope::User,
            })
            .collect()
    } else {
        Vec::new()
    };
    rows.into_iter()
}

pub fn parse_search(output: &str) -> Vec<PackageRecord> {
    output
        .lines()
        .filter(|line| line.contains('\t'))
        .flat_map(parse_search_row)
        .collect()
}

/// Rows of `flatpak list --app --columns=INSTALLED_COLUMNS`.
pub fn parse_installed(output: &str) -> Vec<PackageRecord> {
    let mut records = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let cols: Vec<&str> = line.split('\t').map(str::trim).collect();
        if cols.len() < 3 || !looks_like_app_id(cols[0]) {
            warn!(line, "skipping unexpected row in installed list");
            continue;
        }
        let get = |i: usize| cols.get(i).copied().unwrap_or_default().to_string();
        let version = get(3);
        let name = get(4);
        records.push(PackageRecord {
            reference: PackageRef::new(cols[2], cols[0], cols[1]),
            name: if name.is_empty() { cols[0].to_string() } else { name },
            description: get(5),
            size: get(7),
            installed_version: (!version.is_empty()).then(|| version.clone()),
            available_version: (!version.is_empty()).then_some(version),
            scope: InstallScope::from_column(&get(6)),
        });
    }
    records
}

/// Rows of `flatpak remote-ls --updates --app --columns=UPDATE_COLUMNS`.
pub fn parse_updates(output: &str) -> Vec<(PackageRef, Option<String>)> {
    let mut updates = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let cols: Vec<&str> = line.split('\t').map(str::trim).collect();
        if cols.len() < 3 || !looks_like_app_id(cols[0]) {
            warn!(line, "skipping unexpected row in update list");
            continue;
        }
        let version = cols.get(3).filter(|v| !v.is_empty()).map(|v| (*v).to_string());
        updates.push((PackageRef::new(cols[2], cols[0], cols[1]), version));
    }
    updates
}

/// Rows of `flatpak remote-ls --app <remote> --columns=CATALOG_COLUMNS`. The
/// listing names neither remote nor branch, so the caller supplies them.
pub fn parse_catalog(output: &str, remote: &str, branch: &str) -> Vec<PackageRecord> {
    let mut records = Vec::new();
    for line in output.lines().filter(|l| l.contains('\t')) {
        let cols: Vec<&str> = line.split('\t').map(str::trim).collect();
        if !looks_like_app_id(cols[0]) {
            continue;
        }
        let mut record = PackageRecord::new(PackageRef::new(remote, cols[0], branch));
        if let Some(name) = cols.get(1).filter(|n| !n.is_empty()) {
            record.name = (*name).to_string();
        }
        record.description = cols.get(2).copied().unwrap_or_default().to_string();
        records.push(record);
    }
    records
}

/// Names from `flatpak remotes --columns=name`.
pub fn parse_remotes(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split('\t').next())
        .map(str::trim)
        .filter(|name| !name.is_empty() && !name.eq_ignore_ascii_case("name"))
        .map(str::to_string)
        .collect()
}

/// The `ID | NAME | STATUS | IMAGE` table of `distrobox list --no-color`.
pub fn parse_sandboxes(output: &str) -> Vec<SandboxRef> {
    let mut sandboxes = Vec::new();
    for line in output.lines().map(strip_ansi) {
        let cols: Vec<&str> = line.split('|').map(str::trim).collect();
        if cols.len() < 4 {
            if !line.trim().is_empty() {
                warn!(line = %line, "skipping unexpected row in sandbox list");
            }
            continue;
        }
        if cols[0].eq_ignore_ascii_case("id") && cols[1].eq_ignore_ascii_case("name") {
            continue;
        }
        if cols[1].is_empty() {
            continue;
        }
        sandboxes.push(SandboxRef {
            name: cols[1].to_string(),
            image: cols[3].to_string(),
            created: String::new(),
            status: cols[2].to_string(),
        });
    }
    sandboxes
}

/// Rough category from an application id, used when the remote offers none.
pub fn guess_category(app_id: &str) -> &'static str {
    let id = app_id.to_lowercase();
    let any = |terms: &[&str]| terms.iter().any(|t| id.contains(t));
    if any(&["firefox", "chrome", "telegram", "discord", "thunderbird"]) {
        "Network"
    } else if any(&["libreoffice", "writer", "calc"]) {
        "Office"
    } else if any(&["gimp", "inkscape", "blender", "krita"]) {
        "Graphics"
    } else if any(&["vlc", "audacity", "spotify"]) {
        "AudioVideo"
    } else if any(&["steam", "game", "chess", "puzzle"]) {
        "Game"
    } else if any(&["code", "atom", "eclipse", "git"]) {
        "Development"
    } else if any(&["calculator", "archive", "file"]) {
        "Utility"
    } else {
        "Other"
    }
}
