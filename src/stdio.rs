//! Per-descriptor stdio configuration: endpoints, stage options, and the
//! identity keys used to reject conflicting target reuse.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use url::Url;

use crate::encoding::Encoding;
use crate::stage::{DuplexTransform, StageStep};

/// One standard I/O channel of the subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Descriptor {
    Stdin,
    Stdout,
    Stderr,
    Fd(u32),
}

impl Descriptor {
    pub fn direction(self) -> Direction {
        match self {
            Descriptor::Stdin => Direction::Input,
            // Extra numbered descriptors default to the output direction.
            Descriptor::Stdout | Descriptor::Stderr | Descriptor::Fd(_) => Direction::Output,
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descriptor::Stdin => write!(f, "stdin"),
            Descriptor::Stdout => write!(f, "stdout"),
            Descriptor::Stderr => write!(f, "stderr"),
            Descriptor::Fd(n) => write!(f, "fd{n}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// An externally constructed readable stream shared by reference.
pub type SharedReader = Arc<Mutex<dyn AsyncRead + Send + Unpin>>;
/// An externally constructed writable stream shared by reference.
pub type SharedWriter = Arc<Mutex<dyn AsyncWrite + Send + Unpin>>;
/// An externally constructed two-way transform shared by reference.
pub type SharedDuplex = Arc<Mutex<dyn DuplexTransform>>;

/// Literal input fed to an input-direction descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Text(String),
    Bytes(Bytes),
}

/// One element of a descriptor's stdio configuration.
pub enum StdioItem {
    /// OS pipe (the default).
    Pipe,
    /// Discard the descriptor entirely.
    Ignore,
    /// Inherit the parent's descriptor.
    Inherit,
    /// Duplicate an existing OS file descriptor.
    Fd(i32),
    /// Redirect to/from a file path.
    File(PathBuf),
    /// Redirect to/from a `file://` URL.
    FileUrl(Url),
    /// Literal input value (input direction only).
    Input(InputValue),
    /// External readable stream (input direction only).
    Reader(SharedReader),
    /// External writable stream (output direction only).
    Writer(SharedWriter),
    /// A chunk-mapping transform stage.
    Transform(Box<dyn StageStep>),
    /// An externally constructed two-way stage.
    Duplex(SharedDuplex),
}

impl fmt::Debug for StdioItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StdioItem::Pipe => write!(f, "Pipe"),
            StdioItem::Ignore => write!(f, "Ignore"),
            StdioItem::Inherit => write!(f, "Inherit"),
            StdioItem::Fd(n) => write!(f, "Fd({n})"),
            StdioItem::File(path) => write!(f, "File({})", path.display()),
            StdioItem::FileUrl(url) => write!(f, "FileUrl({url})"),
            StdioItem::Input(_) => write!(f, "Input"),
            StdioItem::Reader(_) => write!(f, "Reader"),
            StdioItem::Writer(_) => write!(f, "Writer"),
            StdioItem::Transform(_) => write!(f, "Transform"),
            StdioItem::Duplex(_) => write!(f, "Duplex"),
        }
    }
}

impl StdioItem {
    pub fn is_plain_endpoint(&self) -> bool {
        matches!(
            self,
            StdioItem::Pipe | StdioItem::Ignore | StdioItem::Inherit | StdioItem::Fd(_)
        )
    }

    pub fn is_stage(&self) -> bool {
        matches!(self, StdioItem::Transform(_) | StdioItem::Duplex(_))
    }

    pub fn is_file_endpoint(&self) -> bool {
        matches!(self, StdioItem::File(_) | StdioItem::FileUrl(_))
    }

    /// Identity key for dedup and duplicate-role rejection. Stage
    /// transforms are owned per descriptor and have no shared identity.
    pub fn target_key(&self) -> Option<TargetKey> {
        match self {
            StdioItem::Fd(n) => Some(TargetKey::Fd(*n)),
            StdioItem::File(path) => Some(TargetKey::File(path.clone())),
            StdioItem::FileUrl(url) => Some(TargetKey::Url(url.to_string())),
            StdioItem::Reader(r) => Some(TargetKey::Object(Arc::as_ptr(r) as *const () as usize)),
            StdioItem::Writer(w) => Some(TargetKey::Object(Arc::as_ptr(w) as *const () as usize)),
            StdioItem::Duplex(d) => Some(TargetKey::Object(Arc::as_ptr(d) as *const () as usize)),
            _ => None,
        }
    }
}

/// Identity of a shareable endpoint target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetKey {
    File(PathBuf),
    Url(String),
    Fd(i32),
    Object(usize),
}

/// Options recognized on a mapping or two-way stage. Using any of them on
/// a plain endpoint fails validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageOptions {
    /// Receive binary chunks regardless of the ambient text mode.
    pub binary: Option<bool>,
    /// Produce structured chunks.
    pub object_mode: Option<bool>,
    /// Keep line terminators on chunks fed to this stage.
    pub preserve_newlines: Option<bool>,
    /// The step only emits at end of stream; pushes pass through.
    pub flush_only: Option<bool>,
}

impl StageOptions {
    pub fn any_set(&self) -> bool {
        self.binary.is_some()
            || self.object_mode.is_some()
            || self.preserve_newlines.is_some()
            || self.flush_only.is_some()
    }

    pub fn first_set_name(&self) -> Option<&'static str> {
        if self.binary.is_some() {
            Some("binary")
        } else if self.object_mode.is_some() {
            Some("objectMode")
        } else if self.preserve_newlines.is_some() {
            Some("preserveNewlines")
        } else if self.flush_only.is_some() {
            Some("final")
        } else {
            None
        }
    }
}

/// A stdio element together with its per-stage options.
#[derive(Debug)]
pub struct ConfiguredItem {
    pub item: StdioItem,
    pub options: StageOptions,
}

impl From<StdioItem> for ConfiguredItem {
    fn from(item: StdioItem) -> Self {
        Self {
            item,
            options: StageOptions::default(),
        }
    }
}

/// Default in-memory accumulation limit (bytes, or items in structured
/// mode).
pub const DEFAULT_MAX_BUFFER: u64 = 100 * 1024 * 1024;

/// Full configuration for one descriptor.
#[derive(Debug)]
pub struct StdioSpec {
    pub items: Vec<ConfiguredItem>,
    pub encoding: Encoding,
    /// Re-chunk the stream at line boundaries.
    pub lines: bool,
    /// Retain chunks for the final aggregated result.
    pub buffer: bool,
    pub max_buffer: u64,
    /// Trim one trailing line terminator from the aggregated text result.
    pub strip_final_newline: bool,
}

impl Default for StdioSpec {
    fn default() -> Self {
        Self {
            items: vec![StdioItem::Pipe.into()],
            encoding: Encoding::Utf8,
            lines: false,
            buffer: true,
            max_buffer: DEFAULT_MAX_BUFFER,
            strip_final_newline: true,
        }
    }
}

impl StdioSpec {
    pub fn pipe() -> Self {
        Self::default()
    }

    pub fn ignore() -> Self {
        Self::item(StdioItem::Ignore)
    }

    pub fn inherit() -> Self {
        Self::item(StdioItem::Inherit)
    }

    pub fn item(item: StdioItem) -> Self {
        Self {
            items: vec![item.into()],
            ..Self::default()
        }
    }

    pub fn items(items: Vec<StdioItem>) -> Self {
        Self {
            items: items.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn transform(step: Box<dyn StageStep>) -> Self {
        Self::items(vec![StdioItem::Transform(step), StdioItem::Pipe])
    }

    pub fn push_item(&mut self, item: impl Into<ConfiguredItem>) -> &mut Self {
        self.items.push(item.into());
        self
    }

    pub fn has_stages(&self) -> bool {
        self.items.iter().any(|c| c.item.is_stage())
    }

    /// A single plain endpoint with no stage options configured.
    pub fn is_plain(&self) -> bool {
        self.items.len() == 1
            && self.items[0].item.is_plain_endpoint()
            && !self.items[0].options.any_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spec_is_plain_pipe() {
        let spec = StdioSpec::default();
        assert!(spec.is_plain());
        assert!(!spec.has_stages());
        assert!(spec.buffer);
        assert!(spec.strip_final_newline);
    }

    #[test]
    fn test_descriptor_display() {
        assert_eq!(Descriptor::Stdin.to_string(), "stdin");
        assert_eq!(Descriptor::Fd(3).to_string(), "fd3");
    }

    #[test]
    fn test_target_key_identity() {
        let a = StdioItem::File(PathBuf::from("/tmp/out.log"));
        let b = StdioItem::File(PathBuf::from("/tmp/out.log"));
        assert_eq!(a.target_key(), b.target_key());
        assert_ne!(
            a.target_key(),
            StdioItem::File(PathBuf::from("/tmp/other.log")).target_key()
        );
        assert_eq!(StdioItem::Pipe.target_key(), None);
    }

    #[test]
    fn test_stage_options_reporting() {
        let mut options = StageOptions::default();
        assert!(!options.any_set());
        options.object_mode = Some(true);
        assert!(options.any_set());
        assert_eq!(options.first_set_name(), Some("objectMode"));
    }
}
