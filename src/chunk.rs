//! The unit of data flowing through a descriptor pipeline.

use bytes::Bytes;
use serde_json::Value;

use crate::encoding::Encoding;
use crate::error::PipeError;
use crate::stdio::Descriptor;

/// One unit of data in a pipeline.
///
/// Text and Binary convert losslessly into each other through the
/// descriptor's active encoding. Structured chunks never convert
/// implicitly.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Text(String),
    Binary(Bytes),
    Structured(Value),
}

/// The representation a stage accepts or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repr {
    Text,
    Binary,
    Structured,
}

/// A stage's declared mode. `terminal` marks the stage whose output shape
/// drives the declared result type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageMode {
    pub repr: Repr,
    pub terminal: bool,
}

impl StageMode {
    pub fn of(repr: Repr) -> Self {
        Self {
            repr,
            terminal: false,
        }
    }

    pub fn terminal(repr: Repr) -> Self {
        Self {
            repr,
            terminal: true,
        }
    }
}

impl Chunk {
    pub fn repr(&self) -> Repr {
        match self {
            Chunk::Text(_) => Repr::Text,
            Chunk::Binary(_) => Repr::Binary,
            Chunk::Structured(_) => Repr::Structured,
        }
    }

    /// Accounting size: bytes for text/binary, one item for structured.
    pub fn size(&self) -> u64 {
        match self {
            Chunk::Text(s) => s.len() as u64,
            Chunk::Binary(b) => b.len() as u64,
            Chunk::Structured(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Chunk::Text(s) => s.is_empty(),
            Chunk::Binary(b) => b.is_empty(),
            Chunk::Structured(_) => false,
        }
    }

    /// Convert to text through the active encoding.
    pub fn into_text(self, descriptor: Descriptor, encoding: Encoding) -> Result<String, PipeError> {
        match self {
            Chunk::Text(s) => Ok(s),
            Chunk::Binary(b) => Ok(encoding.decode(&b)),
            Chunk::Structured(_) => Err(PipeError::invalid_output(
                descriptor,
                "structured chunk cannot convert to text",
            )),
        }
    }

    /// Convert to bytes through the active encoding.
    pub fn into_binary(
        self,
        descriptor: Descriptor,
        encoding: Encoding,
    ) -> Result<Bytes, PipeError> {
        match self {
            Chunk::Text(s) => encoding.encode(descriptor, &s),
            Chunk::Binary(b) => Ok(b),
            Chunk::Structured(_) => Err(PipeError::invalid_output(
                descriptor,
                "structured chunk cannot convert to bytes",
            )),
        }
    }
}

impl From<&str> for Chunk {
    fn from(s: &str) -> Self {
        Chunk::Text(s.to_string())
    }
}

impl From<String> for Chunk {
    fn from(s: String) -> Self {
        Chunk::Text(s)
    }
}

impl From<Bytes> for Chunk {
    fn from(b: Bytes) -> Self {
        Chunk::Binary(b)
    }
}

impl From<Value> for Chunk {
    fn from(v: Value) -> Self {
        Chunk::Structured(v)
    }
}
