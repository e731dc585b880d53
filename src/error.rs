use std::time::Duration;

use crate::runner::ProcessOutput;
use crate::stdio::Descriptor;

pub type Result<T> = std::result::Result<T, PipeError>;

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("Unknown encoding: {0}")]
    UnknownEncoding(String),

    #[error("Incompatible stdio configuration on {descriptor}: {message}")]
    IncompatibleStdio {
        descriptor: Descriptor,
        message: String,
    },

    #[error("Unsupported option `{option}` on {descriptor}: {message}")]
    UnsupportedOption {
        descriptor: Descriptor,
        option: &'static str,
        message: String,
    },

    #[error("Duplicate stdio target: {0}")]
    DuplicateStdioTarget(String),

    #[error("Invalid generator output on {descriptor}: {message}")]
    InvalidGeneratorOutput {
        descriptor: Descriptor,
        message: String,
    },

    #[error("Max buffer size of {limit} exceeded on {descriptor}")]
    MaxBufferExceeded { descriptor: Descriptor, limit: u64 },

    #[error("Stage {index} on {descriptor} failed: {source}")]
    Stage {
        descriptor: Descriptor,
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("Stream error on {descriptor}: {source}")]
    Stream {
        descriptor: Descriptor,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Process timed out after {0:?}")]
    Timeout(Duration),

    #[error("Process pipeline failed: {cause}")]
    Failed {
        output: Box<ProcessOutput>,
        #[source]
        cause: Box<PipeError>,
    },

    #[error("Mock expectation not met: {0}")]
    MockExpectationNotMet(String),
}

impl PipeError {
    /// Wrap an application error raised by a stage's push or flush step.
    pub fn stage(descriptor: Descriptor, index: usize, source: anyhow::Error) -> Self {
        Self::Stage {
            descriptor,
            index,
            source,
        }
    }

    pub fn stream(descriptor: Descriptor, source: std::io::Error) -> Self {
        Self::Stream { descriptor, source }
    }

    pub fn incompatible(descriptor: Descriptor, message: impl Into<String>) -> Self {
        Self::IncompatibleStdio {
            descriptor,
            message: message.into(),
        }
    }

    pub fn invalid_output(descriptor: Descriptor, message: impl Into<String>) -> Self {
        Self::InvalidGeneratorOutput {
            descriptor,
            message: message.into(),
        }
    }

    /// True for errors raised while building a pipeline, before any OS work.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownEncoding(_)
                | Self::IncompatibleStdio { .. }
                | Self::UnsupportedOption { .. }
                | Self::DuplicateStdioTarget(_)
        )
    }
}
