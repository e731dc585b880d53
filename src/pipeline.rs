//! Per-descriptor pipeline execution.
//!
//! Each descriptor runs as its own tokio task. Within a chain, stages run
//! strictly in order and every push is awaited before the next upstream
//! chunk is delivered, which bounds in-flight work to a small constant per
//! stage. Raw OS bytes arrive through a small bounded channel.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::aggregate::{Aggregated, Aggregator};
use crate::chunk::Chunk;
use crate::compose::ComposedPipeline;
use crate::encoding::Encoding;
use crate::error::PipeError;
use crate::split::{DecodeGuard, LineSplitter};
use crate::stage::StageAdapter;
use crate::stdio::Descriptor;

/// Bound for the raw-byte channel between the OS reader/writer task and
/// the pipeline.
pub(crate) const RAW_CHANNEL_CAPACITY: usize = 2;
/// Bound for the live chunk stream handed to the caller.
const LIVE_CHANNEL_CAPACITY: usize = 16;

pub(crate) type AbortSignal = Option<Arc<PipeError>>;
pub(crate) type RawItem = Result<Bytes, std::io::Error>;

/// Outcome of one descriptor's pipeline.
#[derive(Debug)]
pub(crate) struct DescriptorResult {
    pub descriptor: Descriptor,
    pub value: Option<Aggregated>,
    pub cause: Option<PipeError>,
}

impl DescriptorResult {
    pub(crate) fn absent(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            value: None,
            cause: None,
        }
    }
}

/// Live handle on one descriptor's chunk stream.
///
/// Every chunk the terminal stage emits is delivered here exactly once,
/// in production order, alongside (not instead of) aggregation. Dropping
/// the handle detaches the listener; [`StdioStream::destroy`] aborts the
/// whole chain.
pub struct StdioStream {
    descriptor: Descriptor,
    rx: mpsc::Receiver<Chunk>,
    abort: Arc<watch::Sender<AbortSignal>>,
}

impl StdioStream {
    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub async fn next_chunk(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    /// Abort every stage on this descriptor's chain immediately. The
    /// signal does not wait behind in-flight chunks.
    pub fn destroy(&self, reason: impl Into<String>) {
        let cause = Arc::new(PipeError::stream(
            self.descriptor,
            std::io::Error::other(reason.into()),
        ));
        let _ = self.abort.send(Some(cause));
    }
}

impl tokio_stream::Stream for StdioStream {
    type Item = Chunk;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Chunk>> {
        self.rx.poll_recv(cx)
    }
}

pub(crate) fn live_channel(
    descriptor: Descriptor,
    abort: Arc<watch::Sender<AbortSignal>>,
) -> (mpsc::Sender<Chunk>, StdioStream) {
    let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
    (
        tx,
        StdioStream {
            descriptor,
            rx,
            abort,
        },
    )
}

/// Wait until an abort cause is published. Never resolves if the abort
/// sender is gone.
async fn wait_abort(rx: &mut watch::Receiver<AbortSignal>) -> Arc<PipeError> {
    loop {
        if let Some(cause) = rx.borrow_and_update().clone() {
            return cause;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn abort_to_error(descriptor: Descriptor, cause: &PipeError) -> PipeError {
    PipeError::stream(descriptor, std::io::Error::other(cause.to_string()))
}

/// Drives one output-direction descriptor: raw bytes in, aggregated
/// result and live chunks out.
pub(crate) struct OutputPipeline {
    descriptor: Descriptor,
    guard: Option<DecodeGuard>,
    splitter: Option<LineSplitter>,
    stages: Vec<StageAdapter>,
    aggregator: Aggregator,
    live: Option<mpsc::Sender<Chunk>>,
    abort: watch::Receiver<AbortSignal>,
}

impl OutputPipeline {
    pub(crate) fn new(
        composed: ComposedPipeline,
        abort: watch::Receiver<AbortSignal>,
        live: Option<mpsc::Sender<Chunk>>,
    ) -> Self {
        let guard = composed
            .encoding
            .is_text()
            .then(|| DecodeGuard::new(composed.encoding));
        let splitter = composed
            .lines
            .then(|| LineSplitter::new(composed.preserve_newlines));
        let aggregator = Aggregator::new(
            composed.descriptor,
            composed.encoding,
            composed.terminal_mode,
            composed.buffer,
            composed.max_buffer,
            composed.strip_final_newline,
        );
        Self {
            descriptor: composed.descriptor,
            guard,
            splitter,
            stages: composed.stages,
            aggregator,
            live,
            abort,
        }
    }

    pub(crate) async fn run(mut self, mut raw: mpsc::Receiver<RawItem>) -> DescriptorResult {
        for stage in &mut self.stages {
            if let Err(e) = stage.open().await {
                return self.fail(e).await;
            }
        }
        let mut abort = self.abort.clone();
        loop {
            tokio::select! {
                cause = wait_abort(&mut abort) => {
                    let err = abort_to_error(self.descriptor, &cause);
                    return self.fail(err).await;
                }
                item = raw.recv() => match item {
                    Some(Ok(bytes)) => {
                        if let Err(e) = self.feed(bytes).await {
                            return self.fail(e).await;
                        }
                    }
                    Some(Err(io)) => {
                        let err = PipeError::stream(self.descriptor, io);
                        return self.fail(err).await;
                    }
                    None => break,
                }
            }
        }
        match self.drain().await {
            Ok(()) => DescriptorResult {
                descriptor: self.descriptor,
                value: self.aggregator.finish(),
                cause: None,
            },
            Err(e) => self.fail(e).await,
        }
    }

    async fn feed(&mut self, bytes: Bytes) -> Result<(), PipeError> {
        let chunks = self.ingest(bytes);
        self.dispatch(chunks, 0).await
    }

    fn ingest(&mut self, bytes: Bytes) -> Vec<Chunk> {
        match &mut self.guard {
            Some(guard) => {
                let text = guard.push(&bytes);
                if text.is_empty() {
                    return Vec::new();
                }
                match &mut self.splitter {
                    Some(splitter) => {
                        splitter.push(&text).into_iter().map(Chunk::Text).collect()
                    }
                    None => vec![Chunk::Text(text)],
                }
            }
            None => vec![Chunk::Binary(bytes)],
        }
    }

    async fn dispatch(&mut self, chunks: Vec<Chunk>, start: usize) -> Result<(), PipeError> {
        let mut batch = chunks;
        for index in start..self.stages.len() {
            if batch.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for chunk in batch {
                next.extend(self.stages[index].push(chunk).await?);
            }
            batch = next;
        }
        for chunk in batch {
            self.emit(chunk).await?;
        }
        Ok(())
    }

    async fn emit(&mut self, chunk: Chunk) -> Result<(), PipeError> {
        self.aggregator.push(&chunk)?;
        let Some(tx) = self.live.clone() else {
            return Ok(());
        };
        let mut abort = self.abort.clone();
        tokio::select! {
            sent = tx.send(chunk) => {
                if sent.is_err() {
                    // Listener went away; keep aggregating.
                    self.live = None;
                }
                Ok(())
            }
            cause = wait_abort(&mut abort) => {
                Err(abort_to_error(self.descriptor, &cause))
            }
        }
    }

    /// End of stream: flush the decode guard, the splitter remainder,
    /// then every stage in order, cascading each flush's output through
    /// the rest of the chain.
    async fn drain(&mut self) -> Result<(), PipeError> {
        let tail = match &mut self.guard {
            Some(guard) => guard.flush(),
            None => String::new(),
        };
        let mut chunks = Vec::new();
        match &mut self.splitter {
            Some(splitter) => {
                if !tail.is_empty() {
                    chunks.extend(splitter.push(&tail).into_iter().map(Chunk::Text));
                }
                if let Some(remainder) = splitter.flush() {
                    chunks.push(Chunk::Text(remainder));
                }
            }
            None => {
                if !tail.is_empty() {
                    chunks.push(Chunk::Text(tail));
                }
            }
        }
        self.dispatch(chunks, 0).await?;
        for index in 0..self.stages.len() {
            let outputs = self.stages[index].flush().await?;
            if !outputs.is_empty() {
                self.dispatch(outputs, index + 1).await?;
            }
        }
        Ok(())
    }

    async fn fail(mut self, cause: PipeError) -> DescriptorResult {
        tracing::warn!("Pipeline on {} aborted: {}", self.descriptor, cause);
        for stage in &mut self.stages {
            stage.abort(&cause).await;
        }
        // Dropping the live sender ends the listener's stream.
        self.live = None;
        DescriptorResult {
            descriptor: self.descriptor,
            value: self.aggregator.finish(),
            cause: Some(cause),
        }
    }
}

/// Drives one input-direction descriptor: source endpoints in, encoded
/// bytes out to the OS writer task.
pub(crate) struct InputPipeline {
    descriptor: Descriptor,
    encoding: Encoding,
    splitter: Option<LineSplitter>,
    stages: Vec<StageAdapter>,
    abort: watch::Receiver<AbortSignal>,
    sink_open: bool,
}

impl InputPipeline {
    pub(crate) fn new(composed: ComposedPipeline, abort: watch::Receiver<AbortSignal>) -> Self {
        let splitter = composed
            .lines
            .then(|| LineSplitter::new(composed.preserve_newlines));
        Self {
            descriptor: composed.descriptor,
            encoding: composed.encoding,
            splitter,
            stages: composed.stages,
            abort,
            sink_open: true,
        }
    }

    pub(crate) async fn run(mut self, tx: mpsc::Sender<Bytes>) -> DescriptorResult {
        for stage in &mut self.stages {
            if let Err(e) = stage.open().await {
                return self.fail(e).await;
            }
        }
        for index in 0..self.stages.len() {
            if !self.stages[index].is_source() {
                continue;
            }
            loop {
                let abort_cause = self.abort.borrow_and_update().clone();
                if let Some(cause) = abort_cause {
                    let err = abort_to_error(self.descriptor, &cause);
                    return self.fail(err).await;
                }
                let pulled = match self.stages[index].pull().await {
                    Ok(pulled) => pulled,
                    Err(e) => return self.fail(e).await,
                };
                match pulled {
                    Some(chunk) => {
                        if let Err(e) = self.forward(chunk, &tx).await {
                            return self.fail(e).await;
                        }
                    }
                    None => break,
                }
            }
        }
        if let Err(e) = self.drain(&tx).await {
            return self.fail(e).await;
        }
        DescriptorResult::absent(self.descriptor)
    }

    /// Push one source chunk through the transform stages and hand the
    /// encoded bytes to the OS writer.
    async fn forward(&mut self, chunk: Chunk, tx: &mpsc::Sender<Bytes>) -> Result<(), PipeError> {
        let chunks = match (&mut self.splitter, chunk) {
            (Some(splitter), Chunk::Text(text)) => splitter
                .push(&text)
                .into_iter()
                .map(Chunk::Text)
                .collect(),
            (_, chunk) => vec![chunk],
        };
        self.transform_and_send(chunks, 0, tx).await
    }

    async fn transform_and_send(
        &mut self,
        chunks: Vec<Chunk>,
        start: usize,
        tx: &mpsc::Sender<Bytes>,
    ) -> Result<(), PipeError> {
        let mut batch = chunks;
        for index in start..self.stages.len() {
            if self.stages[index].is_source() {
                continue;
            }
            if batch.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for chunk in batch {
                next.extend(self.stages[index].push(chunk).await?);
            }
            batch = next;
        }
        for chunk in batch {
            if !self.sink_open {
                return Ok(());
            }
            let bytes = chunk.into_binary(self.descriptor, self.encoding)?;
            if tx.send(bytes).await.is_err() {
                // Child closed its end; stop writing without failing.
                tracing::debug!("{} writer closed early", self.descriptor);
                self.sink_open = false;
            }
        }
        Ok(())
    }

    async fn drain(&mut self, tx: &mpsc::Sender<Bytes>) -> Result<(), PipeError> {
        let mut chunks = Vec::new();
        if let Some(splitter) = &mut self.splitter {
            if let Some(remainder) = splitter.flush() {
                chunks.push(Chunk::Text(remainder));
            }
        }
        self.transform_and_send(chunks, 0, tx).await?;
        for index in 0..self.stages.len() {
            if self.stages[index].is_source() {
                continue;
            }
            let outputs = self.stages[index].flush().await?;
            if !outputs.is_empty() {
                self.transform_and_send(outputs, index + 1, tx).await?;
            }
        }
        Ok(())
    }

    async fn fail(mut self, cause: PipeError) -> DescriptorResult {
        tracing::warn!("Pipeline on {} aborted: {}", self.descriptor, cause);
        for stage in &mut self.stages {
            stage.abort(&cause).await;
        }
        DescriptorResult {
            descriptor: self.descriptor,
            value: None,
            cause: Some(cause),
        }
    }
}
