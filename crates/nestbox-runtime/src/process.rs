//! Subprocess runner used for every runtime invocation.
//!
//! Programs are always started from an argument vector, never through a
//! shell. Each child gets its own process group so that a timeout can take
//! down the whole tree it spawned, and every child is reaped before
//! [`Invocation::run`] returns.

use crate::error::{Phase, Result, RuntimeError};
use std::ffi::{OsStr, OsString};
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Standard output, or the combined stream when output was merged.
    pub stdout: String,
    /// Standard error (empty when output was merged).
    pub stderr: String,
    /// Exit code; `-N` when the process was killed by signal `N`.
    pub exit_code: i32,
}

impl ProcessOutput {
    /// Whether the process exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Best human-readable explanation of a failure: stderr if present,
    /// stdout otherwise.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        let detail = if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        };
        if detail.is_empty() {
            format!("exit code {}", self.exit_code)
        } else {
            format!("exit code {}: {}", self.exit_code, detail)
        }
    }
}

/// A single external program invocation with a mandatory timeout.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<OsString>,
    phase: Phase,
    timeout: Duration,
    merge_output: bool,
    input: Option<Vec<u8>>,
}

impl Invocation {
    /// Create an invocation of `program` for the given phase.
    pub fn new(program: impl Into<PathBuf>, phase: Phase, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            phase,
            timeout,
            merge_output: false,
            input: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Send stdout and stderr through one pipe, preserving their interleaving.
    pub fn merge_output(mut self) -> Self {
        self.merge_output = true;
        self
    }

    /// Feed `input` to the child's stdin, then close it.
    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Program to execute.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments passed to the program.
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Phase this invocation is accounted to.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Timeout budget.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the program to completion.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::Config`] if the timeout is zero.
    /// - [`RuntimeError::Launch`] if the program cannot be started.
    /// - [`RuntimeError::Timeout`] if the budget expires; the process group
    ///   has been killed and the child reaped by then.
    ///
    /// A non-zero exit code is not an error.
    pub async fn run(self) -> Result<ProcessOutput> {
        let Invocation {
            program,
            args,
            phase,
            timeout,
            merge_output,
            input,
        } = self;

        if timeout.is_zero() {
            return Err(RuntimeError::Config(format!("{phase} timeout must be > 0")));
        }

        let program_name = program.display().to_string();
        let start = Instant::now();
        tracing::debug!(
            program = %program_name,
            phase = %phase,
            args = ?args,
            timeout_ms = timeout.as_millis() as u64,
            "Spawning process"
        );

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .process_group(0)
            .kill_on_drop(true);

        let merged = if merge_output {
            let (reader, writer) = std::io::pipe()?;
            cmd.stdout(writer.try_clone()?).stderr(writer);
            Some(reader)
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            None
        };

        let spawned = cmd.spawn();
        // Release our copy of the merged writer so EOF arrives when the child exits.
        drop(cmd);
        let mut child = spawned.map_err(|source| {
            tracing::debug!(program = %program_name, error = %source, "Spawn failed");
            RuntimeError::Launch {
                program: program_name.clone(),
                source,
            }
        })?;
        let pid = child.id();

        let (stdout, stderr): (Option<BoxedReader>, Option<BoxedReader>) = match merged {
            Some(reader) => {
                match tokio::net::unix::pipe::Receiver::from_owned_fd(OwnedFd::from(reader)) {
                    Ok(receiver) => (Some(Box::new(receiver)), None),
                    Err(e) => {
                        terminate(&mut child, pid).await;
                        return Err(e.into());
                    }
                }
            }
            None => (
                child.stdout.take().map(|s| Box::new(s) as BoxedReader),
                child.stderr.take().map(|s| Box::new(s) as BoxedReader),
            ),
        };
        let stdin = child.stdin.take();

        let collect = async {
            let feed = async {
                if let (Some(mut stdin), Some(input)) = (stdin, input) {
                    if let Err(e) = stdin.write_all(&input).await {
                        // The child may exit without reading everything.
                        if e.kind() != std::io::ErrorKind::BrokenPipe {
                            return Err(e);
                        }
                    }
                }
                Ok(())
            };
            let (status, out, err, ()) =
                tokio::try_join!(child.wait(), drain(stdout), drain(stderr), feed)?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        let outcome = tokio::time::timeout(timeout, collect).await;
        match outcome {
            Ok(Ok((status, out, err))) => {
                let output = ProcessOutput {
                    stdout: String::from_utf8_lossy(&out).into_owned(),
                    stderr: String::from_utf8_lossy(&err).into_owned(),
                    exit_code: exit_code(status),
                };
                tracing::debug!(
                    program = %program_name,
                    phase = %phase,
                    exit_code = output.exit_code,
                    stdout_len = output.stdout.len(),
                    stderr_len = output.stderr.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Process finished"
                );
                tracing::trace!(stdout = %output.stdout, stderr = %output.stderr, "Process output");
                Ok(output)
            }
            Ok(Err(e)) => {
                tracing::warn!(program = %program_name, phase = %phase, error = %e, "Process I/O failed");
                terminate(&mut child, pid).await;
                Err(e.into())
            }
            Err(_) => {
                tracing::warn!(
                    program = %program_name,
                    phase = %phase,
                    timeout_ms = timeout.as_millis() as u64,
                    "Process timed out, killing process group"
                );
                terminate(&mut child, pid).await;
                Err(RuntimeError::Timeout { phase, timeout })
            }
        }
    }
}

async fn drain(reader: Option<BoxedReader>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

/// Kill the child's process group and reap the child.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) {
        // SAFETY: plain kill(2) on the group created for this child via
        // process_group(0); a vanished group only yields ESRCH.
        let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
        if rc != 0 {
            tracing::trace!(
                pgid = pid,
                error = %std::io::Error::last_os_error(),
                "Process group already gone"
            );
        }
    }
    if let Err(e) = child.kill().await {
        tracing::trace!(error = %e, "Child already reaped");
    }
}
