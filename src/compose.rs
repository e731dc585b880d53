//! Pipeline composition: validates and links a descriptor's stage chain,
//! resolving mode transitions and rejecting incompatible configurations
//! before any OS-level work begins.

use std::collections::HashMap;

use crate::chunk::{Repr, StageMode};
use crate::encoding::Encoding;
use crate::error::PipeError;
use crate::stage::{StageAdapter, StageKind};
use crate::stdio::{ConfiguredItem, Descriptor, Direction, StdioItem, StdioSpec, TargetKey};

/// A plain endpoint that needs no stage chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPath {
    Pipe,
    Ignore,
    Inherit,
    Fd(i32),
}

/// The validated, linked chain for one descriptor and direction.
pub struct ComposedPipeline {
    pub descriptor: Descriptor,
    pub direction: Direction,
    pub encoding: Encoding,
    pub lines: bool,
    pub preserve_newlines: bool,
    pub buffer: bool,
    pub max_buffer: u64,
    pub strip_final_newline: bool,
    pub stages: Vec<StageAdapter>,
    pub terminal_mode: StageMode,
    pub fast_path: Option<FastPath>,
}

impl std::fmt::Debug for ComposedPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComposedPipeline")
            .field("descriptor", &self.descriptor)
            .field("direction", &self.direction)
            .field("encoding", &self.encoding)
            .field("lines", &self.lines)
            .field("preserve_newlines", &self.preserve_newlines)
            .field("buffer", &self.buffer)
            .field("max_buffer", &self.max_buffer)
            .field("strip_final_newline", &self.strip_final_newline)
            .field("stages", &self.stages.len())
            .field("terminal_mode", &self.terminal_mode)
            .field("fast_path", &self.fast_path)
            .finish()
    }
}

/// Tracks endpoint target identity across every descriptor of one
/// command, so conflicting reuse is rejected at composition time.
#[derive(Default)]
pub struct TargetRegistry {
    seen: HashMap<TargetKey, (Descriptor, Direction)>,
}

enum Registered {
    New,
    /// Same target, same role: the duplicate is dropped.
    Duplicate,
}

impl TargetRegistry {
    fn register(
        &mut self,
        key: TargetKey,
        shared_object: bool,
        descriptor: Descriptor,
        direction: Direction,
    ) -> Result<Registered, PipeError> {
        match self.seen.get(&key) {
            None => {
                self.seen.insert(key, (descriptor, direction));
                Ok(Registered::New)
            }
            Some(&(prev_desc, prev_dir)) => {
                if prev_desc == descriptor && prev_dir == direction {
                    return Ok(Registered::Duplicate);
                }
                // A shared stream object has a mutable cursor: any reuse
                // conflicts. Plain file/fd targets only conflict when the
                // directions disagree.
                if shared_object || prev_dir != direction {
                    return Err(PipeError::DuplicateStdioTarget(format!(
                        "{key:?} is already in use on {prev_desc}"
                    )));
                }
                Ok(Registered::New)
            }
        }
    }
}

/// Validate and link one descriptor's configuration.
pub fn compose(
    descriptor: Descriptor,
    spec: StdioSpec,
    registry: &mut TargetRegistry,
) -> Result<ComposedPipeline, PipeError> {
    let direction = descriptor.direction();
    let encoding = spec.encoding;
    let ambient = if encoding.is_text() {
        Repr::Text
    } else {
        Repr::Binary
    };

    if spec.is_plain() {
        let fast_path = match spec.items[0].item {
            StdioItem::Pipe => FastPath::Pipe,
            StdioItem::Ignore => FastPath::Ignore,
            StdioItem::Inherit => FastPath::Inherit,
            StdioItem::Fd(n) => {
                registry.register(TargetKey::Fd(n), false, descriptor, direction)?;
                FastPath::Fd(n)
            }
            _ => unreachable!("is_plain only matches plain endpoints"),
        };
        return Ok(ComposedPipeline {
            descriptor,
            direction,
            encoding,
            lines: spec.lines && encoding.is_text(),
            preserve_newlines: true,
            buffer: spec.buffer,
            max_buffer: spec.max_buffer,
            strip_final_newline: spec.strip_final_newline,
            stages: Vec::new(),
            terminal_mode: StageMode::terminal(ambient),
            fast_path: Some(fast_path),
        });
    }

    validate_items(descriptor, &spec)?;

    let mut stages: Vec<StageAdapter> = Vec::new();
    let mut preserve_newlines = true;
    let mut current = ambient;

    for configured in spec.items {
        let ConfiguredItem { item, options } = configured;
        if let Some(key) = item.target_key() {
            let shared = matches!(key, TargetKey::Object(_));
            match registry.register(key, shared, descriptor, direction)? {
                Registered::New => {}
                Registered::Duplicate => continue,
            }
        }
        let index = stages.len();
        match item {
            // The OS connection is implicit; a pipe marker in a staged
            // chain carries no stage of its own.
            StdioItem::Pipe => {}
            StdioItem::Ignore | StdioItem::Inherit | StdioItem::Fd(_) => {
                return Err(PipeError::incompatible(
                    descriptor,
                    format!("cannot combine `{item:?}` with transform stages or redirections"),
                ));
            }
            StdioItem::Transform(step) => {
                if let Some(p) = options.preserve_newlines {
                    preserve_newlines = p;
                }
                let binary = options.binary.unwrap_or(false);
                let input_repr = if current == Repr::Structured {
                    Repr::Structured
                } else if binary {
                    Repr::Binary
                } else {
                    ambient
                };
                let output_repr = if options.object_mode.unwrap_or(false) {
                    Repr::Structured
                } else if binary {
                    Repr::Binary
                } else {
                    ambient
                };
                stages.push(StageAdapter::new(
                    index,
                    descriptor,
                    encoding,
                    StageMode::of(input_repr),
                    StageMode::of(output_repr),
                    StageKind::Map {
                        step,
                        flush_only: options.flush_only.unwrap_or(false),
                    },
                ));
                current = output_repr;
            }
            StdioItem::Duplex(transform) => {
                // The object's own mode flags decide structured-ness. A
                // lock held elsewhere means the object is already wired
                // into another chain.
                let (_, object_out) = transform
                    .try_lock()
                    .map(|guard| guard.object_mode())
                    .map_err(|_| {
                        PipeError::DuplicateStdioTarget(
                            "duplex transform is already in use".to_string(),
                        )
                    })?;
                let input_repr = current;
                let output_repr = if object_out {
                    Repr::Structured
                } else {
                    ambient
                };
                stages.push(StageAdapter::new(
                    index,
                    descriptor,
                    encoding,
                    StageMode::of(input_repr),
                    StageMode::of(output_repr),
                    StageKind::Duplex { transform },
                ));
                current = output_repr;
            }
            StdioItem::File(path) => {
                stages.push(file_endpoint(
                    index, descriptor, direction, encoding, current, path,
                )?);
            }
            StdioItem::FileUrl(url) => {
                let path = url.to_file_path().map_err(|_| {
                    PipeError::incompatible(descriptor, format!("not a file URL: {url}"))
                })?;
                stages.push(file_endpoint(
                    index, descriptor, direction, encoding, current, path,
                )?);
            }
            StdioItem::Writer(writer) => {
                if direction != Direction::Output {
                    return Err(PipeError::incompatible(
                        descriptor,
                        "writable endpoint on an input descriptor",
                    ));
                }
                if current == Repr::Structured {
                    return Err(PipeError::incompatible(
                        descriptor,
                        "cannot use both streams and transforms in objectMode",
                    ));
                }
                stages.push(StageAdapter::new(
                    index,
                    descriptor,
                    encoding,
                    StageMode::of(current),
                    StageMode::of(current),
                    StageKind::WriterSink { writer },
                ));
            }
            StdioItem::Reader(reader) => {
                if direction != Direction::Input {
                    return Err(PipeError::incompatible(
                        descriptor,
                        "readable endpoint on an output descriptor",
                    ));
                }
                stages.push(StageAdapter::new(
                    index,
                    descriptor,
                    encoding,
                    StageMode::of(ambient),
                    StageMode::of(ambient),
                    StageKind::ReaderSource { reader },
                ));
            }
            StdioItem::Input(value) => {
                if direction != Direction::Input {
                    return Err(PipeError::incompatible(
                        descriptor,
                        "literal input on an output descriptor",
                    ));
                }
                stages.push(StageAdapter::new(
                    index,
                    descriptor,
                    encoding,
                    StageMode::of(ambient),
                    StageMode::of(ambient),
                    StageKind::LiteralSource { value: Some(value) },
                ));
            }
        }
    }

    // The OS write call cannot take a structured value.
    if direction == Direction::Input && current == Repr::Structured {
        return Err(PipeError::invalid_output(
            descriptor,
            "the last input stage produces structured chunks",
        ));
    }

    let mut terminal_mode = StageMode::terminal(current);
    if let Some(last) = stages.last() {
        if !last.is_source() {
            terminal_mode = StageMode::terminal(last.output_mode().repr);
        }
    }

    tracing::trace!(
        "Composed {} pipeline on {}: {} stages, terminal {:?}",
        match direction {
            Direction::Input => "input",
            Direction::Output => "output",
        },
        descriptor,
        stages.len(),
        terminal_mode.repr,
    );

    Ok(ComposedPipeline {
        descriptor,
        direction,
        encoding,
        lines: spec.lines && encoding.is_text(),
        preserve_newlines,
        buffer: spec.buffer,
        max_buffer: spec.max_buffer,
        strip_final_newline: spec.strip_final_newline,
        stages,
        terminal_mode,
        fast_path: None,
    })
}

fn file_endpoint(
    index: usize,
    descriptor: Descriptor,
    direction: Direction,
    encoding: Encoding,
    current: Repr,
    path: std::path::PathBuf,
) -> Result<StageAdapter, PipeError> {
    if current == Repr::Structured {
        return Err(PipeError::incompatible(
            descriptor,
            "cannot use both files and transforms in objectMode",
        ));
    }
    let kind = match direction {
        Direction::Output => StageKind::FileSink { path, file: None },
        Direction::Input => StageKind::FileSource { path, file: None },
    };
    Ok(StageAdapter::new(
        index,
        descriptor,
        encoding,
        StageMode::of(current),
        StageMode::of(current),
        kind,
    ))
}

/// Static per-item validation: stage options are only recognized on a
/// mapping stage, and structured-output stages cannot share a chain with
/// file endpoints.
fn validate_items(descriptor: Descriptor, spec: &StdioSpec) -> Result<(), PipeError> {
    let mut structured_stage = false;
    let mut has_file_endpoint = false;

    for configured in &spec.items {
        let item = &configured.item;
        let options = &configured.options;
        match item {
            StdioItem::Transform(_) => {
                if options.object_mode.unwrap_or(false) {
                    structured_stage = true;
                }
            }
            StdioItem::Duplex(duplex) => {
                // Two-way stages derive their mode from the object, not
                // from configuration.
                if let Some(option) = options.first_set_name() {
                    if option != "preserveNewlines" {
                        return Err(PipeError::UnsupportedOption {
                            descriptor,
                            option,
                            message: "two-way stages derive this from the transform object"
                                .to_string(),
                        });
                    }
                }
                if let Ok(guard) = duplex.try_lock() {
                    if guard.object_mode().1 {
                        structured_stage = true;
                    }
                }
            }
            _ => {
                if let Some(option) = options.first_set_name() {
                    return Err(PipeError::UnsupportedOption {
                        descriptor,
                        option,
                        message: "only valid on a transform stage".to_string(),
                    });
                }
                if item.is_file_endpoint() {
                    has_file_endpoint = true;
                }
            }
        }
    }

    if structured_stage && has_file_endpoint {
        return Err(PipeError::incompatible(
            descriptor,
            "cannot use both files and transforms in objectMode",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::stage::FnStep;
    use crate::stdio::StageOptions;
    use std::path::PathBuf;

    fn passthrough() -> StdioItem {
        StdioItem::Transform(FnStep::new(|chunk: Chunk| Ok(vec![chunk])))
    }

    fn structured_stage() -> ConfiguredItem {
        ConfiguredItem {
            item: passthrough(),
            options: StageOptions {
                object_mode: Some(true),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_plain_pipe_takes_fast_path() {
        let mut registry = TargetRegistry::default();
        let composed =
            compose(Descriptor::Stdout, StdioSpec::default(), &mut registry).unwrap();
        assert_eq!(composed.fast_path, Some(FastPath::Pipe));
        assert!(composed.stages.is_empty());
        assert_eq!(composed.terminal_mode.repr, Repr::Text);
    }

    #[test]
    fn test_structured_stage_with_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never-created.log");
        let mut spec = StdioSpec::items(vec![]);
        spec.items.push(structured_stage());
        spec.items.push(StdioItem::File(path.clone()).into());

        let mut registry = TargetRegistry::default();
        let err = compose(Descriptor::Stdout, spec, &mut registry).unwrap_err();
        assert!(matches!(err, PipeError::IncompatibleStdio { .. }));
        assert!(!path.exists(), "validation failure must not create the file");
    }

    #[test]
    fn test_options_on_plain_endpoint_rejected() {
        let mut spec = StdioSpec::items(vec![]);
        spec.items.push(ConfiguredItem {
            item: StdioItem::File(PathBuf::from("/tmp/out.log")),
            options: StageOptions {
                binary: Some(true),
                ..Default::default()
            },
        });
        let mut registry = TargetRegistry::default();
        let err = compose(Descriptor::Stdout, spec, &mut registry).unwrap_err();
        match err {
            PipeError::UnsupportedOption { option, .. } => assert_eq!(option, "binary"),
            other => panic!("expected UnsupportedOption, got {other:?}"),
        }
    }

    #[test]
    fn test_file_reused_across_directions_rejected() {
        let path = PathBuf::from("/tmp/shared.log");
        let mut registry = TargetRegistry::default();
        compose(
            Descriptor::Stdout,
            StdioSpec::items(vec![StdioItem::File(path.clone())]),
            &mut registry,
        )
        .unwrap();
        let err = compose(
            Descriptor::Stdin,
            StdioSpec::items(vec![StdioItem::File(path)]),
            &mut registry,
        )
        .unwrap_err();
        assert!(matches!(err, PipeError::DuplicateStdioTarget(_)));
    }

    #[test]
    fn test_identical_target_on_same_descriptor_deduplicated() {
        let path = PathBuf::from("/tmp/dedup.log");
        let mut registry = TargetRegistry::default();
        let composed = compose(
            Descriptor::Stdout,
            StdioSpec::items(vec![
                StdioItem::File(path.clone()),
                StdioItem::File(path),
            ]),
            &mut registry,
        )
        .unwrap();
        assert_eq!(composed.stages.len(), 1);
    }

    #[test]
    fn test_same_file_on_two_outputs_permitted() {
        let path = PathBuf::from("/tmp/both.log");
        let mut registry = TargetRegistry::default();
        compose(
            Descriptor::Stdout,
            StdioSpec::items(vec![StdioItem::File(path.clone())]),
            &mut registry,
        )
        .unwrap();
        compose(
            Descriptor::Stderr,
            StdioSpec::items(vec![StdioItem::File(path)]),
            &mut registry,
        )
        .unwrap();
    }

    #[test]
    fn test_structured_input_terminal_rejected() {
        let mut spec = StdioSpec::items(vec![]);
        spec.items.push(StdioItem::Input(crate::stdio::InputValue::Text("x".into())).into());
        spec.items.push(structured_stage());
        let mut registry = TargetRegistry::default();
        let err = compose(Descriptor::Stdin, spec, &mut registry).unwrap_err();
        assert!(matches!(err, PipeError::InvalidGeneratorOutput { .. }));
    }

    #[test]
    fn test_terminal_mode_follows_last_structured_stage() {
        let mut spec = StdioSpec::items(vec![]);
        spec.items.push(structured_stage());
        let mut registry = TargetRegistry::default();
        let composed = compose(Descriptor::Stdout, spec, &mut registry).unwrap();
        assert_eq!(composed.terminal_mode.repr, Repr::Structured);
        assert!(composed.terminal_mode.terminal);
    }

    #[test]
    fn test_inherit_mixed_with_stages_rejected() {
        let spec = StdioSpec::items(vec![StdioItem::Inherit, passthrough()]);
        let mut registry = TargetRegistry::default();
        let err = compose(Descriptor::Stdout, spec, &mut registry).unwrap_err();
        assert!(matches!(err, PipeError::IncompatibleStdio { .. }));
    }
}
