//! Aggregation of a pipeline's output chunks into the final result value.

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::chunk::{Chunk, Repr, StageMode};
use crate::encoding::Encoding;
use crate::error::PipeError;
use crate::split::strip_newline;
use crate::stdio::Descriptor;

/// The final aggregated value for one descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregated {
    Text(String),
    Binary(Bytes),
    Structured(Vec<Value>),
}

impl Aggregated {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Aggregated::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Aggregated::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_structured(&self) -> Option<&[Value]> {
        match self {
            Aggregated::Structured(v) => Some(v),
            _ => None,
        }
    }
}

/// Accumulates the terminal stage's chunks, enforcing the size limit
/// mid-stream. Text/binary chunks concatenate; structured chunks collect
/// as an ordered sequence of values.
pub struct Aggregator {
    descriptor: Descriptor,
    encoding: Encoding,
    enabled: bool,
    limit: u64,
    size: u64,
    repr: Repr,
    strip_final_newline: bool,
    text: String,
    bytes: BytesMut,
    values: Vec<Value>,
}

impl Aggregator {
    pub fn new(
        descriptor: Descriptor,
        encoding: Encoding,
        terminal: StageMode,
        enabled: bool,
        limit: u64,
        strip_final_newline: bool,
    ) -> Self {
        Self {
            descriptor,
            encoding,
            enabled,
            limit,
            size: 0,
            repr: terminal.repr,
            strip_final_newline,
            text: String::new(),
            bytes: BytesMut::new(),
            values: Vec::new(),
        }
    }

    /// Account one chunk. Crossing the limit aborts with
    /// `MaxBufferExceeded` and discards the partial accumulation; exactly
    /// reaching it succeeds.
    pub fn push(&mut self, chunk: &Chunk) -> Result<(), PipeError> {
        if !self.enabled {
            return Ok(());
        }
        let add = chunk.size();
        if self.size + add > self.limit {
            self.discard();
            return Err(PipeError::MaxBufferExceeded {
                descriptor: self.descriptor,
                limit: self.limit,
            });
        }
        self.size += add;
        match (self.repr, chunk) {
            (Repr::Structured, Chunk::Structured(v)) => self.values.push(v.clone()),
            (Repr::Structured, Chunk::Text(s)) => self.values.push(Value::String(s.clone())),
            (Repr::Structured, Chunk::Binary(b)) => self
                .values
                .push(Value::String(self.encoding.decode(b))),
            (Repr::Text, chunk) => self
                .text
                .push_str(&chunk.clone().into_text(self.descriptor, self.encoding)?),
            (Repr::Binary, chunk) => self.bytes.extend_from_slice(
                &chunk.clone().into_binary(self.descriptor, self.encoding)?,
            ),
        }
        Ok(())
    }

    /// Produce the final value. `None` means buffering was disabled (or
    /// the accumulation was discarded on overflow) — distinct from an
    /// empty value.
    pub fn finish(self) -> Option<Aggregated> {
        if !self.enabled {
            return None;
        }
        Some(match self.repr {
            Repr::Structured => Aggregated::Structured(self.values),
            Repr::Text => {
                let text = if self.strip_final_newline {
                    strip_newline(self.text)
                } else {
                    self.text
                };
                Aggregated::Text(text)
            }
            Repr::Binary => {
                // Binary-like codecs render to text once, over the whole
                // accumulation, so chunk boundaries cannot misalign the
                // output.
                if !self.encoding.is_text() && self.encoding != Encoding::Raw {
                    Aggregated::Text(self.encoding.decode(&self.bytes))
                } else {
                    Aggregated::Binary(self.bytes.freeze())
                }
            }
        })
    }

    fn discard(&mut self) {
        self.enabled = false;
        self.size = 0;
        self.text = String::new();
        self.bytes = BytesMut::new();
        self.values = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_aggregator(limit: u64, strip: bool) -> Aggregator {
        Aggregator::new(
            Descriptor::Stdout,
            Encoding::Utf8,
            StageMode::terminal(Repr::Text),
            true,
            limit,
            strip,
        )
    }

    #[test]
    fn test_concatenates_text_chunks() {
        let mut agg = text_aggregator(1024, false);
        agg.push(&Chunk::Text("aaa\n".into())).unwrap();
        agg.push(&Chunk::Text("bbb".into())).unwrap();
        assert_eq!(
            agg.finish(),
            Some(Aggregated::Text("aaa\nbbb".to_string()))
        );
    }

    #[test]
    fn test_strip_final_newline_applied_once_overall() {
        let mut agg = text_aggregator(1024, true);
        agg.push(&Chunk::Text("aaa\n".into())).unwrap();
        agg.push(&Chunk::Text("bbb\n".into())).unwrap();
        assert_eq!(
            agg.finish(),
            Some(Aggregated::Text("aaa\nbbb".to_string()))
        );
    }

    #[test]
    fn test_exactly_max_buffer_succeeds() {
        let mut agg = text_aggregator(6, false);
        agg.push(&Chunk::Text("abc".into())).unwrap();
        agg.push(&Chunk::Text("def".into())).unwrap();
        assert_eq!(agg.finish(), Some(Aggregated::Text("abcdef".to_string())));
    }

    #[test]
    fn test_one_past_max_buffer_fails_and_discards() {
        let mut agg = text_aggregator(6, false);
        agg.push(&Chunk::Text("abc".into())).unwrap();
        let err = agg.push(&Chunk::Text("defg".into())).unwrap_err();
        assert!(matches!(
            err,
            PipeError::MaxBufferExceeded { limit: 6, .. }
        ));
        assert_eq!(agg.finish(), None);
    }

    #[test]
    fn test_disabled_buffering_yields_absent_value() {
        let mut agg = Aggregator::new(
            Descriptor::Stdout,
            Encoding::Utf8,
            StageMode::terminal(Repr::Text),
            false,
            1024,
            true,
        );
        agg.push(&Chunk::Text("ignored".into())).unwrap();
        assert_eq!(agg.finish(), None);
    }

    #[test]
    fn test_structured_chunks_collect_in_order() {
        let mut agg = Aggregator::new(
            Descriptor::Stdout,
            Encoding::Utf8,
            StageMode::terminal(Repr::Structured),
            true,
            1024,
            true,
        );
        agg.push(&Chunk::Structured(json!({"n": 1}))).unwrap();
        agg.push(&Chunk::Structured(json!({"n": 2}))).unwrap();
        assert_eq!(
            agg.finish(),
            Some(Aggregated::Structured(vec![
                json!({"n": 1}),
                json!({"n": 2})
            ]))
        );
    }

    #[test]
    fn test_structured_limit_counts_items() {
        let mut agg = Aggregator::new(
            Descriptor::Stdout,
            Encoding::Utf8,
            StageMode::terminal(Repr::Structured),
            true,
            2,
            true,
        );
        agg.push(&Chunk::Structured(json!(1))).unwrap();
        agg.push(&Chunk::Structured(json!(2))).unwrap();
        let err = agg.push(&Chunk::Structured(json!(3))).unwrap_err();
        assert!(matches!(err, PipeError::MaxBufferExceeded { .. }));
    }

    #[test]
    fn test_hex_result_rendered_once() {
        let mut agg = Aggregator::new(
            Descriptor::Stdout,
            Encoding::Hex,
            StageMode::terminal(Repr::Binary),
            true,
            1024,
            false,
        );
        agg.push(&Chunk::Binary(Bytes::from_static(&[0xde])))
            .unwrap();
        agg.push(&Chunk::Binary(Bytes::from_static(&[0xad])))
            .unwrap();
        assert_eq!(agg.finish(), Some(Aggregated::Text("dead".to_string())));
    }
}
