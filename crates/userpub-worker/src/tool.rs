//! External repository tool invocation.
//!
//! Every repository mutation goes through an external program: the publish
//! helper for tarballs and timestamps, and the repository server tool for
//! transactions and garbage collection. Invocations are built as plain
//! argument vectors (no shell), run synchronously, and their stdout and
//! stderr are read by two threads that feed one channel, so the log sees
//! lines in the order they arrive from either stream.

use std::ffi::OsString;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;

use thiserror::Error;
use tracing::{info, warn};
use userpub_protocol::{Cid, ConfigSnapshot, TIMESTAMP_DIR};

/// Errors from starting or supervising a tool process.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// A fully specified tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: OsString,
    pub args: Vec<OsString>,
    /// Short description used in the success/failure log line.
    pub label: String,
}

impl ToolInvocation {
    pub fn new(program: impl Into<OsString>, label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            label: label.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Arguments as lossy strings, for logging and assertions.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Publish staged tarballs (`pubdir` = prefix) or touch timestamps
    /// (`pubdir` = `ts`). `cids` is comma-joined for timestamp batches.
    pub fn publish(
        snapshot: &ConfigSnapshot,
        repo: &str,
        pubdir: &str,
        cids: &str,
        principal: &str,
    ) -> Self {
        Self::new(snapshot.publish_cmd.as_os_str(), format!("publish {}", cids))
            .arg(repo)
            .arg(snapshot.queue_dir.as_os_str())
            .arg(pubdir)
            .arg(cids)
            .arg(principal)
    }

    /// Publish one staged tarball into the content prefix.
    pub fn publish_tarball(snapshot: &ConfigSnapshot, repo: &str, cid: &Cid, principal: &str) -> Self {
        Self::publish(snapshot, repo, &snapshot.prefix, cid.as_str(), principal)
    }

    /// Touch the timestamps of a batch of CIDs.
    pub fn publish_timestamps(snapshot: &ConfigSnapshot, repo: &str, cids: &[Cid], principal: &str) -> Self {
        let joined = cids.iter().map(Cid::as_str).collect::<Vec<_>>().join(",");
        Self::publish(snapshot, repo, TIMESTAMP_DIR, &joined, principal)
    }

    /// Open a mutating transaction on a repository.
    pub fn transaction(snapshot: &ConfigSnapshot, repo: &str) -> Self {
        Self::new(snapshot.server_cmd.as_os_str(), format!("start transaction {}", repo))
            .arg("transaction")
            .arg(repo)
    }

    /// Publish the open transaction.
    pub fn commit(snapshot: &ConfigSnapshot, repo: &str) -> Self {
        Self::new(snapshot.server_cmd.as_os_str(), format!("publishing deletes {}", repo))
            .arg("publish")
            .arg(repo)
    }

    /// Run the repository garbage collector.
    pub fn gc(snapshot: &ConfigSnapshot, repo: &str) -> Self {
        Self::new(snapshot.server_cmd.as_os_str(), format!("gc {}", repo))
            .arg("gc")
            .arg("-f")
            .arg(repo)
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// How a tool process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolOutcome {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
}

impl ToolOutcome {
    pub fn exited(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ToolOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code {}", code),
            None => write!(f, "signal"),
        }
    }
}

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One line of tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Runs tool invocations. The worker only talks to the store through this.
pub trait ToolRunner: Send + Sync {
    /// Run to completion, logging output as it is produced.
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutcome, ToolError>;
}

/// Runs invocations as child processes.
#[derive(Debug, Default, Clone)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run to completion, handing every output line to `sink` in arrival
    /// order. Returns once both streams are closed and the child has exited.
    pub fn run_with_sink(
        &self,
        invocation: &ToolInvocation,
        sink: &mut dyn FnMut(OutputLine),
    ) -> Result<ToolOutcome, ToolError> {
        let program = invocation.program.to_string_lossy().into_owned();

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: program.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, OutputStream::Stderr, tx.clone()));
        }
        drop(tx);

        // Ends when both readers hit EOF and drop their senders.
        for line in rx {
            sink(line);
        }
        for reader in readers {
            join_reader(reader, &program);
        }

        let status = child.wait().map_err(|source| ToolError::Wait { program, source })?;
        Ok(ToolOutcome {
            code: status.code(),
        })
    }
}

impl ToolRunner for CommandRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutcome, ToolError> {
        info!("{}", invocation);
        let outcome = self.run_with_sink(invocation, &mut |line| {
            info!(stream = line.stream.as_str(), "{}", line.text);
        })?;

        if outcome.success() {
            info!("{} succeeded", invocation.label);
        } else {
            warn!("{} failed with {}", invocation.label, outcome);
        }
        Ok(outcome)
    }
}

/// Wait for an output reader. Returns false, with a warning, if it panicked
/// and the captured output may be incomplete.
fn join_reader(reader: thread::JoinHandle<()>, program: &str) -> bool {
    match reader.join() {
        Ok(()) => true,
        Err(_) => {
            warn!(program, "output reader panicked, output may be incomplete");
            false
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    source: R,
    stream: OutputStream,
    tx: mpsc::Sender<OutputLine>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(source);
        for chunk in reader.split(b'\n') {
            let Ok(bytes) = chunk else {
                break;
            };
            let text = String::from_utf8_lossy(&bytes).trim_end_matches('\r').to_string();
            if tx.send(OutputLine { stream, text }).is_err() {
                break;
            }
        }
    })
}
