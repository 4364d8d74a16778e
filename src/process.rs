//! Child process plumbing: spawn, stream interleaved output, answer prompts,
//! and terminate with SIGTERM-then-SIGKILL escalation.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::{CoreError, CoreResult};

/// How long a partial line may sit in the buffer before it is checked for an
/// interactive prompt. Prompts are printed without a trailing newline.
const PROMPT_IDLE: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Pipe stdin so confirmation prompts can be answered.
    pub interactive: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            interactive: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// What `cancel` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The process had exited before it was signalled.
    AlreadyExited(ExitStatus),
    Terminated(ExitStatus),
    Killed(ExitStatus),
}

impl CancelOutcome {
    pub fn status(self) -> ExitStatus {
        match self {
            CancelOutcome::AlreadyExited(status)
            | CancelOutcome::Terminated(status)
            | CancelOutcome::Killed(status) => status,
        }
    }
}

/// Output and exit status of a command run to completion.
#[derive(Debug, Clone)]
pub struct Completed {
    pub status: ExitStatus,
    pub lines: Vec<OutputLine>,
}

impl Completed {
    pub fn stdout(&self) -> String {
        self.collect(Stream::Stdout)
    }

    pub fn stderr(&self) -> String {
        self.collect(Stream::Stderr)
    }

    fn collect(&self, stream: Stream) -> String {
        let mut out = String::new();
        for line in self.lines.iter().filter(|l| l.stream == stream) {
            out.push_str(&line.text);
            out.push('\n');
        }
        out
    }
}

/// Exit code, with signal deaths reported shell-style as `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    prompt_idle: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            prompt_idle: PROMPT_IDLE,
        }
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the command. Missing or unexecutable binaries fail here.
    pub async fn start(&self, spec: &CommandSpec) -> CoreResult<ProcessHandle> {
        debug!(command = %spec, "spawning child process");
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.interactive {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = spawn_retrying(&mut cmd, &spec.program).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_stream(stdout, Stream::Stdout, tx.clone(), self.prompt_idle));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_stream(stderr, Stream::Stderr, tx, self.prompt_idle));
        }

        Ok(ProcessHandle {
            program: spec.program.clone(),
            pid: child.id(),
            stdin: child.stdin.take(),
            child,
            lines: rx,
            exited: None,
        })
    }

    /// Start a program the user keeps running after we are gone. Its output
    /// is discarded and it is not tracked.
    pub async fn spawn_detached(&self, spec: &CommandSpec) -> CoreResult<u32> {
        debug!(command = %spec, "launching detached process");
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(false);
        let child = spawn_retrying(&mut cmd, &spec.program).await?;
        Ok(child.id().unwrap_or_default())
    }

    /// Run a command and collect everything it prints.
    pub async fn run_to_end(&self, spec: &CommandSpec) -> CoreResult<Completed> {
        let mut handle = self.start(spec).await?;
        let mut lines = Vec::new();
        while let Some(line) = handle.read_line().await {
            lines.push(line);
        }
        let status = handle.wait().await?;
        debug!(command = %spec, exit_code = exit_code(status), "command finished");
        Ok(Completed { status, lines })
    }
}

/// One live child process. Dropping the handle kills the child.
#[derive(Debug)]
pub struct ProcessHandle {
    program: String,
    pid: Option<u32>,
    child: Child,
    stdin: Option<ChildStdin>,
    lines: mpsc::UnboundedReceiver<OutputLine>,
    exited: Option<ExitStatus>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Next line from either stream, `None` once both are closed.
    pub async fn read_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    /// Answer a prompt on stdin.
    pub async fn write_line(&mut self, answer: &str) -> CoreResult<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            CoreError::Io(format!("stdin of `{}` is not connected", self.program))
        })?;
        stdin.write_all(answer.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    pub async fn wait(&mut self) -> CoreResult<ExitStatus> {
        if let Some(status) = self.exited {
            return Ok(status);
        }
        self.stdin.take();
        let status = self.child.wait().await?;
        self.exited = Some(status);
        Ok(status)
    }

    /// SIGTERM the process group, wait up to `grace`, then SIGKILL. The child
    /// is always reaped before this returns.
    pub async fn cancel(&mut self, grace: Duration) -> CoreResult<CancelOutcome> {
        if let Some(status) = self.exited {
            return Ok(CancelOutcome::AlreadyExited(status));
        }
        if let Some(status) = self.child.try_wait()? {
            self.exited = Some(status);
            return Ok(CancelOutcome::AlreadyExited(status));
        }
        self.stdin.take();

        if let Some(pid) = self.pid {
            debug!(pid, program = %self.program, "sending SIGTERM");
            signal_group(pid, libc::SIGTERM);
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                self.exited = Some(status);
                Ok(CancelOutcome::Terminated(status))
            }
            Err(_) => {
                warn!(
                    program = %self.program,
                    grace_ms = grace.as_millis() as u64,
                    "process ignored SIGTERM, killing"
                );
                if let Some(pid) = self.pid {
                    signal_group(pid, libc::SIGKILL);
                }
                self.child.kill().await?;
                let status = self.child.wait().await?;
                self.exited = Some(status);
                Ok(CancelOutcome::Killed(status))
            }
        }
    }
}

/// `ETXTBSY` shows up when an executable is exec'd right after being
/// written, while another thread's fork still holds the write handle.
const SPAWN_ATTEMPTS: u32 = 5;

/// Spawn, backing off on the runtime's timer between busy attempts.
async fn spawn_retrying(cmd: &mut Command, program: &str) -> CoreResult<Child> {
    let mut attempt = 1;
    loop {
        match cmd.spawn() {
            Ok(child) => return Ok(child),
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                debug!(program, attempt, "executable busy, retrying spawn");
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(e) => {
                error!(program, err = %e, "failed to spawn command");
                return Err(CoreError::from_spawn(program, &e));
            }
        }
    }
}

fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // Children were spawned as process group leaders, so the negative pid
    // reaches the helpers they start as well.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        let _ = unsafe { libc::kill(pid, signal) };
    }
}

async fn pump_stream<R>(
    mut reader: R,
    stream: Stream,
    tx: mpsc::UnboundedSender<OutputLine>,
    idle: Duration,
) where
    R: AsyncRead + Unpin,
{
    let mut pending = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let read = if pending.is_empty() {
            reader.read(&mut buf).await.map(Some)
        } else {
            match tokio::time::timeout(idle, reader.read(&mut buf)).await {
                Ok(result) => result.map(Some),
                Err(_) => Ok(None),
            }
        };

        match read {
            Ok(Some(0)) => break,
            Ok(Some(n)) => {
                for text in split_lines(&mut pending, &buf[..n]) {
                    if tx.send(OutputLine { stream, text }).is_err() {
                        return;
                    }
                }
            }
            Ok(None) => {
                let partial = String::from_utf8_lossy(&pending).into_owned();
                if looks_like_prompt(&partial) {
                    pending.clear();
                    if tx.send(OutputLine { stream, text: partial }).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(err = %e, ?stream, "read from child failed");
                break;
            }
        }
    }

    if !pending.is_empty() {
        let text = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(OutputLine { stream, text });
    }
}

/// Move complete lines out of `pending + chunk`. Both `\n` and `\r` end a
/// line so progress bars redrawn in place arrive as separate updates.
/// Empty lines are dropped.
pub(crate) fn split_lines(pending: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    let mut lines = Vec::new();
    for &byte in chunk {
        if byte == b'\n' || byte == b'\r' {
            if !pending.is_empty() {
                lines.push(String::from_utf8_lossy(pending).into_owned());
                pending.clear();
            }
        } else {
            pending.push(byte);
        }
    }
    lines
}

pub(crate) fn looks_like_prompt(partial: &str) -> bool {
    let trimmed = partial.trim_end();
    trimmed.ends_with(':') || trimmed.ends_with('?') || trimmed.ends_with(']')
}
