//! Process execution: spawns the child and wires each descriptor's raw
//! OS stream into its composed pipeline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::aggregate::Aggregated;
use crate::compose::{compose, ComposedPipeline, FastPath, TargetRegistry};
use crate::error::PipeError;
use crate::pipeline::{
    live_channel, AbortSignal, DescriptorResult, InputPipeline, OutputPipeline, RawItem,
    StdioStream, RAW_CHANNEL_CAPACITY,
};
use crate::stdio::{Descriptor, StdioSpec};

#[derive(Debug)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub stdin: StdioSpec,
    pub stdout: StdioSpec,
    pub stderr: StdioSpec,
}

/// Final result of a subprocess run. A `None` descriptor value means
/// buffering was disabled or the descriptor was not piped — distinct
/// from an empty value.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Option<Aggregated>,
    pub stderr: Option<Aggregated>,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Signal(i32),
    Timeout,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            _ => None,
        }
    }
}

pub type StatusFuture = futures::future::BoxFuture<'static, Result<ProcessOutput, PipeError>>;

/// Handles for a running subprocess: live per-descriptor chunk streams
/// plus the future resolving to the final aggregated output.
pub struct ProcessStream {
    pub stdout: Option<StdioStream>,
    pub stderr: Option<StdioStream>,
    pub status: StatusFuture,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, PipeError>;
    async fn run_streaming(&self, command: ProcessCommand) -> Result<ProcessStream, PipeError>;
}

pub struct TokioProcessRunner;

impl TokioProcessRunner {
    fn log_command_start(command: &ProcessCommand) {
        tracing::debug!(
            "Executing subprocess: {} {}",
            command.program,
            command.args.join(" ")
        );
        if let Some(ref dir) = command.working_dir {
            tracing::trace!("Working directory: {:?}", dir);
        }
    }

    fn log_result(output: &ProcessOutput, command: &ProcessCommand) {
        let command_str = format!("{} {}", command.program, command.args.join(" "));
        match &output.status {
            ExitStatus::Success => {
                tracing::debug!(
                    "Subprocess completed successfully in {:?}: {}",
                    output.duration,
                    command_str
                );
            }
            ExitStatus::Error(code) => {
                tracing::debug!(
                    "Subprocess failed with exit code {} in {:?}: {}",
                    code,
                    output.duration,
                    command_str
                );
            }
            ExitStatus::Signal(signal) => {
                tracing::warn!(
                    "Subprocess terminated by signal {} in {:?}: {}",
                    signal,
                    output.duration,
                    command_str
                );
            }
            ExitStatus::Timeout => {
                tracing::warn!(
                    "Subprocess timed out after {:?}: {}",
                    output.duration,
                    command_str
                );
            }
        }
    }

    fn configure_command(command: &ProcessCommand) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&command.program);

        // Keep the whole process group killable together on Unix.
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        cmd.args(&command.args);
        cmd.envs(&command.env);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    fn stdio_for(composed: &ComposedPipeline) -> Result<std::process::Stdio, PipeError> {
        match composed.fast_path {
            Some(FastPath::Ignore) => Ok(std::process::Stdio::null()),
            Some(FastPath::Inherit) => Ok(std::process::Stdio::inherit()),
            Some(FastPath::Fd(n)) => fd_stdio(composed.descriptor, n),
            Some(FastPath::Pipe) | None => Ok(std::process::Stdio::piped()),
        }
    }

    /// Whether the descriptor needs a pipeline task at all.
    fn is_piped(composed: &ComposedPipeline) -> bool {
        matches!(composed.fast_path, Some(FastPath::Pipe) | None)
    }

    fn map_spawn_error(error: std::io::Error, command: &ProcessCommand) -> PipeError {
        if error.kind() == std::io::ErrorKind::NotFound {
            PipeError::CommandNotFound(command.program.clone())
        } else {
            PipeError::SpawnFailed {
                command: format!("{} {}", command.program, command.args.join(" ")),
                source: error,
            }
        }
    }

    fn extract_stream<T>(stream: Option<T>, descriptor: Descriptor) -> Result<T, PipeError> {
        stream.ok_or_else(|| {
            PipeError::stream(
                descriptor,
                std::io::Error::other(format!("failed to capture {descriptor}")),
            )
        })
    }

    /// Pump raw bytes from the child's output descriptor into the
    /// pipeline's bounded channel.
    fn spawn_reader<R>(mut stream: R, tx: mpsc::Sender<RawItem>)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(8192);
            loop {
                match stream.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(Ok(buf.split().freeze())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });
    }

    /// Write pipeline-produced bytes to the child's stdin, then shut it
    /// down so the child sees EOF.
    fn spawn_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<bytes::Bytes>) {
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if stdin.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            let _ = stdin.shutdown().await;
        });
    }

    fn parse_exit_status(status: std::process::ExitStatus) -> ExitStatus {
        if status.success() {
            ExitStatus::Success
        } else if let Some(code) = status.code() {
            ExitStatus::Error(code)
        } else {
            Self::parse_signal_status(status)
        }
    }

    #[cfg(unix)]
    fn parse_signal_status(status: std::process::ExitStatus) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            ExitStatus::Signal(signal)
        } else {
            ExitStatus::Error(1)
        }
    }

    #[cfg(not(unix))]
    fn parse_signal_status(_status: std::process::ExitStatus) -> ExitStatus {
        ExitStatus::Error(1)
    }

    async fn join_result(
        descriptor: Descriptor,
        handle: Option<JoinHandle<DescriptorResult>>,
    ) -> DescriptorResult {
        match handle {
            None => DescriptorResult::absent(descriptor),
            Some(handle) => handle.await.unwrap_or_else(|e| DescriptorResult {
                descriptor,
                value: None,
                cause: Some(PipeError::Io {
                    command: descriptor.to_string(),
                    source: std::io::Error::other(e),
                }),
            }),
        }
    }
}

#[cfg(unix)]
fn fd_stdio(_descriptor: Descriptor, fd: i32) -> Result<std::process::Stdio, PipeError> {
    use std::os::unix::io::FromRawFd;
    // Ownership of the descriptor transfers to the child's stdio slot.
    Ok(unsafe { std::process::Stdio::from_raw_fd(fd) })
}

#[cfg(not(unix))]
fn fd_stdio(descriptor: Descriptor, _fd: i32) -> Result<std::process::Stdio, PipeError> {
    Err(PipeError::UnsupportedOption {
        descriptor,
        option: "fd",
        message: "fd endpoints are only supported on Unix".to_string(),
    })
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, PipeError> {
        let ProcessStream {
            stdout,
            stderr,
            status,
        } = self.run_streaming(command).await?;
        // No live listeners: the pipelines detach on their own.
        drop(stdout);
        drop(stderr);
        status.await
    }

    async fn run_streaming(&self, command: ProcessCommand) -> Result<ProcessStream, PipeError> {
        let start = Instant::now();
        Self::log_command_start(&command);

        let mut command = command;
        let stdin_spec = std::mem::take(&mut command.stdin);
        let stdout_spec = std::mem::take(&mut command.stdout);
        let stderr_spec = std::mem::take(&mut command.stderr);

        // All configuration errors surface here, before the child exists.
        let mut registry = TargetRegistry::default();
        let stdin_composed = compose(Descriptor::Stdin, stdin_spec, &mut registry)?;
        let stdout_composed = compose(Descriptor::Stdout, stdout_spec, &mut registry)?;
        let stderr_composed = compose(Descriptor::Stderr, stderr_spec, &mut registry)?;

        let mut cmd = Self::configure_command(&command);
        cmd.stdin(Self::stdio_for(&stdin_composed)?);
        cmd.stdout(Self::stdio_for(&stdout_composed)?);
        cmd.stderr(Self::stdio_for(&stderr_composed)?);

        let mut child = cmd
            .spawn()
            .map_err(|e| Self::map_spawn_error(e, &command))?;

        // Stdin: either a pipeline feeds the writer task, or the pipe is
        // dropped so the child sees EOF at once.
        let stdin_task: Option<JoinHandle<DescriptorResult>> = if Self::is_piped(&stdin_composed) {
            let handle = Self::extract_stream(child.stdin.take(), Descriptor::Stdin)?;
            if stdin_composed.stages.is_empty() {
                drop(handle);
                None
            } else {
                let (_abort_tx, abort_rx) = watch::channel::<AbortSignal>(None);
                let (tx, rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
                Self::spawn_writer(handle, rx);
                let pipeline = InputPipeline::new(stdin_composed, abort_rx);
                Some(tokio::spawn(pipeline.run(tx)))
            }
        } else {
            None
        };

        let wire_output = |composed: ComposedPipeline,
                               handle: Option<Box<dyn tokio::io::AsyncRead + Unpin + Send>>|
         -> (Option<JoinHandle<DescriptorResult>>, Option<StdioStream>) {
            match handle {
                Some(handle) => {
                    let descriptor = composed.descriptor;
                    let (abort_tx, abort_rx) = watch::channel::<AbortSignal>(None);
                    let (live_tx, stream) = live_channel(descriptor, Arc::new(abort_tx));
                    let (tx, rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
                    Self::spawn_reader(handle, tx);
                    let pipeline = OutputPipeline::new(composed, abort_rx, Some(live_tx));
                    (Some(tokio::spawn(pipeline.run(rx))), Some(stream))
                }
                None => (None, None),
            }
        };

        let stdout_handle: Option<Box<dyn tokio::io::AsyncRead + Unpin + Send>> =
            if Self::is_piped(&stdout_composed) {
                Some(Box::new(Self::extract_stream(
                    child.stdout.take(),
                    Descriptor::Stdout,
                )?))
            } else {
                None
            };
        let stderr_handle: Option<Box<dyn tokio::io::AsyncRead + Unpin + Send>> =
            if Self::is_piped(&stderr_composed) {
                Some(Box::new(Self::extract_stream(
                    child.stderr.take(),
                    Descriptor::Stderr,
                )?))
            } else {
                None
            };

        let (stdout_task, stdout_stream) = wire_output(stdout_composed, stdout_handle);
        let (stderr_task, stderr_stream) = wire_output(stderr_composed, stderr_handle);

        let status: StatusFuture = Box::pin(async move {
            let status = match command.timeout {
                Some(duration) => match tokio::time::timeout(duration, child.wait()).await {
                    Ok(Ok(status)) => Self::parse_exit_status(status),
                    Ok(Err(e)) => {
                        return Err(PipeError::Io {
                            command: format!("{} {}", command.program, command.args.join(" ")),
                            source: e,
                        })
                    }
                    Err(_) => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        ExitStatus::Timeout
                    }
                },
                None => match child.wait().await {
                    Ok(status) => Self::parse_exit_status(status),
                    Err(e) => {
                        return Err(PipeError::Io {
                            command: format!("{} {}", command.program, command.args.join(" ")),
                            source: e,
                        })
                    }
                },
            };

            let stdin_result = Self::join_result(Descriptor::Stdin, stdin_task).await;
            let stdout_result = Self::join_result(Descriptor::Stdout, stdout_task).await;
            let stderr_result = Self::join_result(Descriptor::Stderr, stderr_task).await;

            let output = ProcessOutput {
                status,
                stdout: stdout_result.value,
                stderr: stderr_result.value,
                duration: start.elapsed(),
            };
            Self::log_result(&output, &command);

            let cause = stdin_result
                .cause
                .or(stdout_result.cause)
                .or(stderr_result.cause);
            match cause {
                Some(cause) => Err(PipeError::Failed {
                    output: Box::new(output),
                    cause: Box::new(cause),
                }),
                None => Ok(output),
            }
        });

        Ok(ProcessStream {
            stdout: stdout_stream,
            stderr: stderr_stream,
            status,
        })
    }
}
