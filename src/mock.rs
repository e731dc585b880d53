//! Scriptable process runner for tests that must not spawn real
//! children.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::aggregate::Aggregated;
use crate::chunk::Chunk;
use crate::error::PipeError;
use crate::pipeline::live_channel;
use crate::runner::{ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner, ProcessStream};
use crate::stdio::Descriptor;

/// A recorded invocation, kept lightweight so history stays cloneable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalledCommand {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Clone)]
pub struct MockProcessRunner {
    expectations: Arc<Mutex<Vec<MockExpectation>>>,
    call_history: Arc<Mutex<Vec<CalledCommand>>>,
}

struct MockExpectation {
    program: String,
    #[allow(clippy::type_complexity)]
    args_matcher: Option<Box<dyn Fn(&[String]) -> bool + Send + Sync>>,
    response: ProcessOutput,
    times_called: usize,
    expected_times: Option<usize>,
}

pub struct MockCommandConfig {
    runner: MockProcessRunner,
    expectation: MockExpectation,
}

impl MockProcessRunner {
    pub fn new() -> Self {
        Self {
            expectations: Arc::new(Mutex::new(Vec::new())),
            call_history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn expect_command(&mut self, program: &str) -> MockCommandConfig {
        MockCommandConfig {
            runner: self.clone(),
            expectation: MockExpectation {
                program: program.to_string(),
                args_matcher: None,
                response: ProcessOutput {
                    status: ExitStatus::Success,
                    stdout: Some(Aggregated::Text(String::new())),
                    stderr: Some(Aggregated::Text(String::new())),
                    duration: Duration::from_millis(10),
                },
                times_called: 0,
                expected_times: None,
            },
        }
    }

    pub fn verify_called(&self, program: &str, times: usize) -> bool {
        let history = self.call_history.lock().unwrap();
        history.iter().filter(|cmd| cmd.program == program).count() == times
    }

    pub fn get_call_history(&self) -> Vec<CalledCommand> {
        self.call_history.lock().unwrap().clone()
    }

    pub fn reset(&mut self) {
        self.expectations.lock().unwrap().clear();
        self.call_history.lock().unwrap().clear();
    }
}

impl Default for MockProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRunner for MockProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, PipeError> {
        self.call_history.lock().unwrap().push(CalledCommand {
            program: command.program.clone(),
            args: command.args.clone(),
        });

        let mut expectations = self.expectations.lock().unwrap();
        for expectation in expectations.iter_mut() {
            if expectation.program != command.program {
                continue;
            }
            if let Some(ref args_matcher) = expectation.args_matcher {
                if !(args_matcher)(&command.args) {
                    continue;
                }
            }

            expectation.times_called += 1;
            if let Some(expected) = expectation.expected_times {
                if expectation.times_called > expected {
                    return Err(PipeError::MockExpectationNotMet(format!(
                        "Command '{}' called {} times, expected {}",
                        command.program, expectation.times_called, expected
                    )));
                }
            }
            return Ok(expectation.response.clone());
        }

        Err(PipeError::MockExpectationNotMet(format!(
            "No expectation found for command: {} {:?}",
            command.program, command.args
        )))
    }

    async fn run_streaming(&self, command: ProcessCommand) -> Result<ProcessStream, PipeError> {
        let output = self.run(command).await?;

        let stdout = mock_stream(Descriptor::Stdout, output.stdout.as_ref()).await;
        let stderr = mock_stream(Descriptor::Stderr, output.stderr.as_ref()).await;

        Ok(ProcessStream {
            stdout: Some(stdout),
            stderr: Some(stderr),
            status: Box::pin(async move { Ok(output) }),
        })
    }
}

/// Pre-load a live stream with the scripted value, already closed.
async fn mock_stream(
    descriptor: Descriptor,
    value: Option<&Aggregated>,
) -> crate::pipeline::StdioStream {
    let (abort_tx, _abort_rx) = watch::channel(None);
    let (tx, stream) = live_channel(descriptor, Arc::new(abort_tx));
    if let Some(Aggregated::Text(text)) = value {
        if !text.is_empty() {
            let _ = tx.send(Chunk::Text(text.clone())).await;
        }
    }
    stream
}

impl MockCommandConfig {
    pub fn with_args<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.expectation.args_matcher = Some(Box::new(matcher));
        self
    }

    pub fn returns_stdout(mut self, stdout: &str) -> Self {
        self.expectation.response.stdout = Some(Aggregated::Text(stdout.to_string()));
        self
    }

    pub fn returns_stderr(mut self, stderr: &str) -> Self {
        self.expectation.response.stderr = Some(Aggregated::Text(stderr.to_string()));
        self
    }

    pub fn returns_exit_code(mut self, code: i32) -> Self {
        self.expectation.response.status = if code == 0 {
            ExitStatus::Success
        } else {
            ExitStatus::Error(code)
        };
        self
    }

    pub fn returns_success(mut self) -> Self {
        self.expectation.response.status = ExitStatus::Success;
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.expectation.expected_times = Some(n);
        self
    }

    pub fn finish(self) {
        self.runner
            .expectations
            .lock()
            .unwrap()
            .push(self.expectation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProcessCommandBuilder;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_mock_scripted_response() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("status"))
            .returns_stdout("clean")
            .finish();

        let command = ProcessCommandBuilder::new("git").arg("status").build();
        let output = mock.run(command).await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.unwrap().as_text(), Some("clean"));
        assert!(mock.verify_called("git", 1));
    }

    #[tokio::test]
    async fn test_mock_unexpected_command_fails() {
        let mock = MockProcessRunner::new();
        let command = ProcessCommandBuilder::new("rm").build();
        let err = mock.run(command).await.unwrap_err();
        assert!(matches!(err, PipeError::MockExpectationNotMet(_)));
    }

    #[tokio::test]
    async fn test_mock_times_limit() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("ls").times(1).finish();

        let first = mock.run(ProcessCommandBuilder::new("ls").build()).await;
        assert_ok!(first);
        let second = mock.run(ProcessCommandBuilder::new("ls").build()).await;
        assert_err!(second);
    }

    #[tokio::test]
    async fn test_mock_streaming_delivers_scripted_chunks() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("echo").returns_stdout("hello").finish();

        let command = ProcessCommandBuilder::new("echo").build();
        let mut stream = mock.run_streaming(command).await.unwrap();
        let mut stdout = stream.stdout.take().unwrap();
        assert_eq!(
            stdout.next_chunk().await,
            Some(Chunk::Text("hello".to_string()))
        );
        assert_eq!(stdout.next_chunk().await, None);
        let output = stream.status.await.unwrap();
        assert!(output.status.success());
    }
}
