//! # stdpipe
//!
//! Transform pipelines for child process stdio: staged chunk transforms,
//! line-aware streaming, and buffered aggregation.
//!
//! Each descriptor of a spawned child (stdin, stdout, stderr) gets an
//! ordered chain of transform stages, file redirections and an in-memory
//! aggregator, all agreeing on one data representation (text, binary, or
//! structured values) at every stage boundary. Text re-chunks on line
//! boundaries without corrupting multi-byte characters split across I/O
//! chunks, and the raw stream stays consumable live while the final
//! result is accumulated.
//!
//! ## Modules
//!
//! - `encoding` - Encoding registry: alias canonicalization and codecs
//! - `chunk` - The tagged data unit flowing through pipelines
//! - `split` - Line splitter and the multi-byte boundary guard
//! - `stdio` - Per-descriptor configuration surface
//! - `stage` - Stage adapters: mapping, two-way, and endpoint stages
//! - `compose` - Chain validation and mode resolution
//! - `aggregate` - Buffered aggregation into the final result value
//! - `pipeline` - Per-descriptor runtime drivers and live stream handles
//! - `runner` - Process spawning and OS wiring
//! - `builder` - Fluent command construction
//! - `mock` - Scriptable runner for tests

pub mod aggregate;
pub mod builder;
pub mod chunk;
pub mod compose;
pub mod encoding;
pub mod error;
pub mod mock;
pub mod pipeline;
pub mod runner;
pub mod split;
pub mod stage;
pub mod stdio;

pub use aggregate::Aggregated;
pub use builder::ProcessCommandBuilder;
pub use chunk::{Chunk, Repr, StageMode};
pub use encoding::Encoding;
pub use error::{PipeError, Result};
pub use mock::{CalledCommand, MockCommandConfig, MockProcessRunner};
pub use pipeline::StdioStream;
pub use runner::{
    ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner, ProcessStream, TokioProcessRunner,
};
pub use stage::{DuplexTransform, FlushStep, FnStep, StageStep};
pub use stdio::{
    Descriptor, InputValue, StageOptions, StdioItem, StdioSpec, DEFAULT_MAX_BUFFER,
};

use std::sync::Arc;

/// Entry point holding the runner implementation, so call sites stay
/// testable against the mock.
#[derive(Clone)]
pub struct ProcessManager {
    runner: Arc<dyn ProcessRunner>,
}

impl ProcessManager {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    pub fn production() -> Self {
        Self::new(Arc::new(TokioProcessRunner))
    }

    #[cfg(test)]
    pub fn mock() -> (Self, MockProcessRunner) {
        let mock = MockProcessRunner::new();
        let runner = Arc::new(mock.clone()) as Arc<dyn ProcessRunner>;
        (Self::new(runner), mock)
    }

    pub fn runner(&self) -> Arc<dyn ProcessRunner> {
        Arc::clone(&self.runner)
    }

    pub async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput> {
        self.runner.run(command).await
    }

    pub async fn run_streaming(&self, command: ProcessCommand) -> Result<ProcessStream> {
        self.runner.run_streaming(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manager_delegates_to_mock() {
        let (manager, mut mock) = ProcessManager::mock();
        mock.expect_command("true").returns_success().finish();
        let output = manager
            .run(ProcessCommandBuilder::new("true").build())
            .await
            .unwrap();
        assert!(output.status.success());
    }
}
