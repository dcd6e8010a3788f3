//! Delivering a message by piping it to a program.
use crate::{DeliveryError, MessageReceiver};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tern_clock::Clock;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

/// How long a program has to exit once it has seen the whole message
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);

/// How a child process ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match status.code() {
            Some(code) => Self::Exited(code),
            None => Self::Signaled(status.signal().unwrap_or_default()),
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(fmt, "exited with status {code}"),
            Self::Signaled(signal) => match nix::sys::signal::Signal::try_from(*signal) {
                Ok(signal) => write!(fmt, "was killed by {}", signal.as_str()),
                Err(_) => write!(fmt, "was killed by signal {signal}"),
            },
        }
    }
}

/// A running child process
#[async_trait]
pub trait ProcessHandle: Send {
    /// Write `line` and a newline to the child's input
    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()>;

    /// Close the child's input so that it sees end of file
    fn close_input(&mut self);

    /// The exit outcome, if the child has already exited
    fn try_exit(&mut self) -> std::io::Result<Option<ExitOutcome>>;

    /// Wait for the child to exit. Dropping the future before it
    /// completes must leave the handle usable.
    async fn wait(&mut self) -> std::io::Result<ExitOutcome>;

    /// Send SIGKILL to the child
    fn kill(&mut self) -> std::io::Result<()>;
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, program: &str, args: &[String]) -> std::io::Result<Box<dyn ProcessHandle>>;
}

/// Spawns real processes. Their output is discarded.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, program: &str, args: &[String]) -> std::io::Result<Box<dyn ProcessHandle>> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take();
        Ok(Box::new(TokioProcess { child, stdin }))
    }
}

struct TokioProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl ProcessHandle for TokioProcess {
    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line);
        data.push(b'\n');
        stdin.write_all(&data).await
    }

    fn close_input(&mut self) {
        self.stdin.take();
    }

    fn try_exit(&mut self) -> std::io::Result<Option<ExitOutcome>> {
        Ok(self.child.try_wait()?.map(ExitOutcome::from))
    }

    async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
        Ok(self.child.wait().await?.into())
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}

/// Feeds the message to a program's standard input.
///
/// The program must exit with status 0 within the completion timeout
/// of the end of the message; if it is still running at that point it
/// is killed. The same timeout bounds each write to its input, so a
/// program that stops reading without exiting is killed too, and the
/// failure is reported at the end of the message.
pub struct ProcessReceiver {
    program: String,
    handle: Option<Box<dyn ProcessHandle>>,
    clock: Arc<dyn Clock>,
    completion_timeout: Duration,
    /// The program stopped reading; further lines are dropped
    input_closed: bool,
    /// A write blocked for the whole timeout and the program was killed
    stalled: bool,
}

impl ProcessReceiver {
    pub fn spawn(
        spawner: &dyn ProcessSpawner,
        program: &str,
        args: &[String],
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DeliveryError> {
        let handle = spawner
            .spawn(program, args)
            .map_err(DeliveryError::io(format!("failed to spawn {program}")))?;
        Ok(Self::with_handle(program, handle, clock))
    }

    pub fn with_handle<S: Into<String>>(
        program: S,
        handle: Box<dyn ProcessHandle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            program: program.into(),
            handle: Some(handle),
            clock,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            input_closed: false,
            stalled: false,
        }
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn completion_timeout(&self) -> Duration {
        self.completion_timeout
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl MessageReceiver for ProcessReceiver {
    async fn line_received(&mut self, line: &[u8]) -> Result<(), DeliveryError> {
        let handle = self
            .handle
            .as_mut()
            .ok_or(DeliveryError::AlreadyComplete)?;
        if self.input_closed {
            return Ok(());
        }

        let deadline = self.clock.sleep(self.completion_timeout);
        let written = tokio::select! {
            result = handle.write_line(line) => Some(result),
            _ = deadline => None,
        };

        match written {
            None => {
                tracing::warn!(
                    "{} has not read its input for {}, killing it",
                    self.program,
                    humantime::format_duration(self.completion_timeout)
                );
                if let Err(err) = handle.kill() {
                    tracing::error!("failed to kill {}: {err:#}", self.program);
                }
                self.input_closed = true;
                self.stalled = true;
                Ok(())
            }
            Some(Ok(())) => Ok(()),
            Some(Err(err)) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                // The exit status is reported at the end of the message
                tracing::debug!("{} stopped reading its input: {err:#}", self.program);
                self.input_closed = true;
                Ok(())
            }
            Some(Err(err)) => Err(DeliveryError::io(format!(
                "failed to write to {}",
                self.program
            ))(err)),
        }
    }

    fn eom_received(&mut self) -> BoxFuture<'static, Result<(), DeliveryError>> {
        let Some(mut handle) = self.handle.take() else {
            return futures::future::ready(Err(DeliveryError::AlreadyComplete)).boxed();
        };
        let program = self.program.clone();

        if self.stalled {
            let timeout = self.completion_timeout;
            return async move {
                handle.wait().await.ok();
                Err(DeliveryError::ProcessAliasTimeout { program, timeout })
            }
            .boxed();
        }

        match handle.try_exit() {
            Ok(Some(outcome)) => {
                return futures::future::ready(Err(DeliveryError::ProcessExitedEarly {
                    program,
                    outcome,
                }))
                .boxed();
            }
            Ok(None) => {}
            Err(err) => {
                return futures::future::ready(Err(DeliveryError::io(format!(
                    "failed to check on {program}"
                ))(err)))
                .boxed();
            }
        }

        handle.close_input();
        let timeout = self.completion_timeout;
        let deadline = self.clock.sleep(timeout);

        async move {
            let finished = tokio::select! {
                status = handle.wait() => Some(status),
                _ = deadline => None,
            };

            match finished {
                Some(Ok(outcome)) if outcome.success() => {
                    tracing::debug!("{program} completed");
                    Ok(())
                }
                Some(Ok(outcome)) => Err(DeliveryError::ProcessTerminated { program, outcome }),
                Some(Err(err)) => Err(DeliveryError::io(format!("failed to wait for {program}"))(err)),
                None => {
                    tracing::warn!(
                        "{program} did not complete within {}, killing it",
                        humantime::format_duration(timeout)
                    );
                    match handle.kill() {
                        Ok(()) => {
                            handle.wait().await.ok();
                        }
                        Err(err) => tracing::error!("failed to kill {program}: {err:#}"),
                    }
                    Err(DeliveryError::ProcessAliasTimeout { program, timeout })
                }
            }
        }
        .boxed()
    }

    fn connection_lost(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(err) = handle.kill() {
                tracing::debug!("failed to kill {}: {err:#}", self.program);
            }
        }
    }
}
