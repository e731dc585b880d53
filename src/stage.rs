//! Stage adapters: the closed set of stage kinds behind one
//! push/flush/abort contract.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::chunk::{Chunk, Repr, StageMode};
use crate::encoding::Encoding;
use crate::error::PipeError;
use crate::stdio::{Descriptor, InputValue, SharedDuplex, SharedReader, SharedWriter};

/// A user-supplied transform step.
///
/// Application errors are reported as `anyhow::Error` and abort the whole
/// descriptor chain, surfacing as the subprocess failure cause.
#[async_trait]
pub trait StageStep: Send {
    /// Process one chunk, producing zero or more output chunks.
    async fn push(&mut self, chunk: Chunk) -> anyhow::Result<Vec<Chunk>>;

    /// Called exactly once when upstream is exhausted.
    async fn flush(&mut self) -> anyhow::Result<Vec<Chunk>> {
        Ok(Vec::new())
    }
}

/// Adapts a synchronous closure into a [`StageStep`].
pub struct FnStep<F>(F);

impl<F> FnStep<F>
where
    F: FnMut(Chunk) -> anyhow::Result<Vec<Chunk>> + Send,
{
    pub fn new(func: F) -> Box<Self> {
        Box::new(Self(func))
    }
}

#[async_trait]
impl<F> StageStep for FnStep<F>
where
    F: FnMut(Chunk) -> anyhow::Result<Vec<Chunk>> + Send,
{
    async fn push(&mut self, chunk: Chunk) -> anyhow::Result<Vec<Chunk>> {
        (self.0)(chunk)
    }
}

/// A step that only emits at end of stream; pushes pass through untouched.
pub struct FlushStep<F>(Option<F>);

impl<F> FlushStep<F>
where
    F: FnOnce() -> anyhow::Result<Vec<Chunk>> + Send,
{
    pub fn new(func: F) -> Box<Self> {
        Box::new(Self(Some(func)))
    }
}

#[async_trait]
impl<F> StageStep for FlushStep<F>
where
    F: FnOnce() -> anyhow::Result<Vec<Chunk>> + Send,
{
    async fn push(&mut self, chunk: Chunk) -> anyhow::Result<Vec<Chunk>> {
        Ok(vec![chunk])
    }

    async fn flush(&mut self) -> anyhow::Result<Vec<Chunk>> {
        match self.0.take() {
            Some(func) => func(),
            None => Ok(Vec::new()),
        }
    }
}

/// An externally constructed bidirectional transform. Its structured-ness
/// is read from the object's own mode flags rather than configuration.
#[async_trait]
pub trait DuplexTransform: Send {
    /// `(input, output)` structured-mode flags.
    fn object_mode(&self) -> (bool, bool);

    async fn push(&mut self, chunk: Chunk) -> anyhow::Result<Vec<Chunk>>;

    async fn flush(&mut self) -> anyhow::Result<Vec<Chunk>> {
        Ok(Vec::new())
    }

    async fn abort(&mut self, _cause: &PipeError) {}
}

pub(crate) enum StageKind {
    Map {
        step: Box<dyn StageStep>,
        flush_only: bool,
    },
    Duplex {
        transform: SharedDuplex,
    },
    FileSink {
        path: PathBuf,
        file: Option<tokio::fs::File>,
    },
    WriterSink {
        writer: SharedWriter,
    },
    IgnoreSink,
    FileSource {
        path: PathBuf,
        file: Option<tokio::fs::File>,
    },
    ReaderSource {
        reader: SharedReader,
    },
    LiteralSource {
        value: Option<InputValue>,
    },
}

const SOURCE_READ_CAPACITY: usize = 64 * 1024;

/// One link in a descriptor's transform chain, with its resolved modes.
pub struct StageAdapter {
    index: usize,
    descriptor: Descriptor,
    encoding: Encoding,
    input_mode: StageMode,
    output_mode: StageMode,
    kind: StageKind,
    closed: bool,
}

impl StageAdapter {
    pub(crate) fn new(
        index: usize,
        descriptor: Descriptor,
        encoding: Encoding,
        input_mode: StageMode,
        output_mode: StageMode,
        kind: StageKind,
    ) -> Self {
        Self {
            index,
            descriptor,
            encoding,
            input_mode,
            output_mode,
            kind,
            closed: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn input_mode(&self) -> StageMode {
        self.input_mode
    }

    pub fn output_mode(&self) -> StageMode {
        self.output_mode
    }

    pub(crate) fn is_source(&self) -> bool {
        matches!(
            self.kind,
            StageKind::FileSource { .. }
                | StageKind::ReaderSource { .. }
                | StageKind::LiteralSource { .. }
        )
    }

    /// Open endpoint resources. Runs after all validation has passed, so
    /// a rejected configuration never creates a file.
    pub(crate) async fn open(&mut self) -> Result<(), PipeError> {
        match &mut self.kind {
            StageKind::FileSink { path, file } => {
                tracing::debug!("Opening file sink for {}: {}", self.descriptor, path.display());
                let created = tokio::fs::File::create(&path)
                    .await
                    .map_err(|e| PipeError::stream(self.descriptor, e))?;
                *file = Some(created);
            }
            StageKind::FileSource { path, file } => {
                tracing::debug!(
                    "Opening file source for {}: {}",
                    self.descriptor,
                    path.display()
                );
                let opened = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| PipeError::stream(self.descriptor, e))?;
                *file = Some(opened);
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) async fn push(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, PipeError> {
        if self.closed {
            return Ok(Vec::new());
        }
        match &mut self.kind {
            StageKind::Map { step, flush_only } => {
                if *flush_only {
                    return Ok(vec![chunk]);
                }
                let input = coerce(chunk, self.input_mode.repr, self.descriptor, self.encoding)?;
                let outputs = step
                    .push(input)
                    .await
                    .map_err(|e| PipeError::stage(self.descriptor, self.index, e))?;
                self.check_outputs(outputs)
            }
            StageKind::Duplex { transform } => {
                let input = coerce(chunk, self.input_mode.repr, self.descriptor, self.encoding)?;
                let outputs = transform
                    .lock()
                    .await
                    .push(input)
                    .await
                    .map_err(|e| PipeError::stage(self.descriptor, self.index, e))?;
                self.check_outputs(outputs)
            }
            StageKind::FileSink { file, .. } => {
                let bytes = chunk
                    .clone()
                    .into_binary(self.descriptor, self.encoding)?;
                if let Some(file) = file {
                    file.write_all(&bytes)
                        .await
                        .map_err(|e| PipeError::stream(self.descriptor, e))?;
                }
                Ok(vec![chunk])
            }
            StageKind::WriterSink { writer } => {
                let bytes = chunk
                    .clone()
                    .into_binary(self.descriptor, self.encoding)?;
                writer
                    .lock()
                    .await
                    .write_all(&bytes)
                    .await
                    .map_err(|e| PipeError::stream(self.descriptor, e))?;
                Ok(vec![chunk])
            }
            StageKind::IgnoreSink => Ok(vec![chunk]),
            StageKind::FileSource { .. }
            | StageKind::ReaderSource { .. }
            | StageKind::LiteralSource { .. } => Ok(vec![chunk]),
        }
    }

    pub(crate) async fn flush(&mut self) -> Result<Vec<Chunk>, PipeError> {
        if self.closed {
            return Ok(Vec::new());
        }
        match &mut self.kind {
            StageKind::Map { step, .. } => {
                let outputs = step
                    .flush()
                    .await
                    .map_err(|e| PipeError::stage(self.descriptor, self.index, e))?;
                self.check_outputs(outputs)
            }
            StageKind::Duplex { transform } => {
                let outputs = transform
                    .lock()
                    .await
                    .flush()
                    .await
                    .map_err(|e| PipeError::stage(self.descriptor, self.index, e))?;
                self.check_outputs(outputs)
            }
            StageKind::FileSink { file, .. } => {
                if let Some(file) = file {
                    file.flush()
                        .await
                        .map_err(|e| PipeError::stream(self.descriptor, e))?;
                }
                Ok(Vec::new())
            }
            StageKind::WriterSink { writer } => {
                writer
                    .lock()
                    .await
                    .flush()
                    .await
                    .map_err(|e| PipeError::stream(self.descriptor, e))?;
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Stop consuming and release resources on a best-effort basis.
    pub(crate) async fn abort(&mut self, cause: &PipeError) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::debug!(
            "Aborting stage {} on {}: {}",
            self.index,
            self.descriptor,
            cause
        );
        match &mut self.kind {
            StageKind::Duplex { transform } => {
                transform.lock().await.abort(cause).await;
            }
            StageKind::FileSink { file, .. } => {
                if let Some(file) = file {
                    let _ = file.flush().await;
                }
            }
            StageKind::WriterSink { writer } => {
                let _ = writer.lock().await.flush().await;
            }
            _ => {}
        }
    }

    /// Produce the next chunk from a source endpoint, or `None` when
    /// exhausted.
    pub(crate) async fn pull(&mut self) -> Result<Option<Chunk>, PipeError> {
        if self.closed {
            return Ok(None);
        }
        match &mut self.kind {
            StageKind::LiteralSource { value } => Ok(value.take().map(|v| match v {
                InputValue::Text(s) => Chunk::Text(s),
                InputValue::Bytes(b) => Chunk::Binary(b),
            })),
            StageKind::FileSource { file, .. } => match file {
                Some(file) => read_source_chunk(file, self.descriptor).await,
                None => Ok(None),
            },
            StageKind::ReaderSource { reader } => {
                let mut reader = reader.lock().await;
                read_source_chunk(&mut *reader, self.descriptor).await
            }
            _ => Ok(None),
        }
    }

    fn check_outputs(&self, outputs: Vec<Chunk>) -> Result<Vec<Chunk>, PipeError> {
        if self.output_mode.repr != Repr::Structured {
            if let Some(bad) = outputs.iter().find(|c| c.repr() == Repr::Structured) {
                return Err(PipeError::invalid_output(
                    self.descriptor,
                    format!(
                        "stage {} emitted a structured chunk ({bad:?}) on a non-structured descriptor",
                        self.index
                    ),
                ));
            }
        }
        Ok(outputs)
    }
}

/// Convert a chunk to the representation a stage declared for its input.
/// Structured chunks pass through untouched; they never convert.
fn coerce(
    chunk: Chunk,
    repr: Repr,
    descriptor: Descriptor,
    encoding: Encoding,
) -> Result<Chunk, PipeError> {
    if chunk.repr() == Repr::Structured {
        return Ok(chunk);
    }
    match repr {
        Repr::Text => Ok(Chunk::Text(chunk.into_text(descriptor, encoding)?)),
        Repr::Binary => Ok(Chunk::Binary(chunk.into_binary(descriptor, encoding)?)),
        Repr::Structured => Ok(chunk),
    }
}

async fn read_source_chunk<R>(
    mut reader: R,
    descriptor: Descriptor,
) -> Result<Option<Chunk>, PipeError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = bytes::BytesMut::with_capacity(SOURCE_READ_CAPACITY);
    let n = reader
        .read_buf(&mut buf)
        .await
        .map_err(|e| PipeError::stream(descriptor, e))?;
    if n == 0 {
        Ok(None)
    } else {
        Ok(Some(Chunk::Binary(buf.freeze())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn text_mode() -> StageMode {
        StageMode::of(Repr::Text)
    }

    fn map_adapter(step: Box<dyn StageStep>) -> StageAdapter {
        StageAdapter::new(
            0,
            Descriptor::Stdout,
            Encoding::Utf8,
            text_mode(),
            text_mode(),
            StageKind::Map {
                step,
                flush_only: false,
            },
        )
    }

    #[tokio::test]
    async fn test_map_stage_transforms_chunks() {
        let step = FnStep::new(|chunk: Chunk| {
            let text = match chunk {
                Chunk::Text(s) => s,
                other => panic!("expected text, got {other:?}"),
            };
            Ok(vec![Chunk::Text(text.to_uppercase())])
        });
        let mut stage = map_adapter(step);
        let out = stage.push(Chunk::Text("abc".into())).await.unwrap();
        assert_eq!(out, vec![Chunk::Text("ABC".into())]);
    }

    #[tokio::test]
    async fn test_binary_input_coerced_to_text() {
        let step = FnStep::new(|chunk: Chunk| Ok(vec![chunk]));
        let mut stage = map_adapter(step);
        let out = stage
            .push(Chunk::Binary(Bytes::from_static(b"abc")))
            .await
            .unwrap();
        assert_eq!(out, vec![Chunk::Text("abc".into())]);
    }

    #[tokio::test]
    async fn test_structured_output_rejected_in_text_mode() {
        let step = FnStep::new(|_| Ok(vec![Chunk::Structured(serde_json::json!(1))]));
        let mut stage = map_adapter(step);
        let err = stage.push(Chunk::Text("x".into())).await.unwrap_err();
        assert!(matches!(err, PipeError::InvalidGeneratorOutput { .. }));
    }

    #[tokio::test]
    async fn test_stage_error_carries_index_and_source() {
        let step = FnStep::new(|_| Err(anyhow::anyhow!("boom")));
        let mut stage = map_adapter(step);
        let err = stage.push(Chunk::Text("x".into())).await.unwrap_err();
        match err {
            PipeError::Stage { index, source, .. } => {
                assert_eq!(index, 0);
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("expected Stage error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_flush_only_stage_passes_through_then_emits() {
        let step = FlushStep::new(|| Ok(vec![Chunk::Text("tail".into())]));
        let mut stage = StageAdapter::new(
            0,
            Descriptor::Stdout,
            Encoding::Utf8,
            text_mode(),
            text_mode(),
            StageKind::Map {
                step,
                flush_only: true,
            },
        );
        let through = stage.push(Chunk::Text("body".into())).await.unwrap();
        assert_eq!(through, vec![Chunk::Text("body".into())]);
        let tail = stage.flush().await.unwrap();
        assert_eq!(tail, vec![Chunk::Text("tail".into())]);
    }

    #[tokio::test]
    async fn test_aborted_stage_stops_consuming() {
        let step = FnStep::new(|chunk| Ok(vec![chunk]));
        let mut stage = map_adapter(step);
        let cause = PipeError::stream(
            Descriptor::Stdout,
            std::io::Error::other("stream destroyed"),
        );
        stage.abort(&cause).await;
        let out = stage.push(Chunk::Text("late".into())).await.unwrap();
        assert!(out.is_empty());
        assert!(stage.flush().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_literal_source_yields_once() {
        let mut stage = StageAdapter::new(
            0,
            Descriptor::Stdin,
            Encoding::Utf8,
            text_mode(),
            text_mode(),
            StageKind::LiteralSource {
                value: Some(InputValue::Text("payload".into())),
            },
        );
        assert_eq!(
            stage.pull().await.unwrap(),
            Some(Chunk::Text("payload".into()))
        );
        assert_eq!(stage.pull().await.unwrap(), None);
    }
}
