//! Storage-engine contracts consumed by the compactor.
//!
//! The compactor never touches file bytes. It reads level metadata, asks the engine to merge a
//! set of files into a level, and reacts to the events the engine delivers.

pub mod memory;

use std::{fmt, future::Future, pin::Pin};

use thiserror::Error;

/// Column family used when none is configured.
pub const DEFAULT_COLUMN_FAMILY: &str = "default";

/// Compression applied to compaction outputs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    /// Store blocks uncompressed.
    #[default]
    None,
    /// Snappy block compression.
    Snappy,
    /// LZ4 block compression.
    Lz4,
    /// Zstandard block compression.
    Zstd,
}

/// Options forwarded to the engine's merge primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompactOptions {
    /// Compression inherited from the engine-wide configuration.
    pub compression: Compression,
    /// Upper bound on the size of each output file, in bytes.
    pub output_file_size_limit: u64,
}

impl Default for CompactOptions {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            output_file_size_limit: u64::MAX,
        }
    }
}

/// Metadata for one live file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileMetadata {
    /// Engine-assigned file name.
    pub name: String,
    /// File size in bytes.
    pub size: u64,
    /// `true` while the file is an input of a running merge.
    pub being_compacted: bool,
}

/// Metadata for one level of the tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LevelMetadata {
    /// Level ordinal, 0 being the youngest.
    pub level: usize,
    /// Total bytes stored in the level.
    pub size: u64,
    /// Files currently in the level.
    pub files: Vec<FileMetadata>,
}

impl LevelMetadata {
    /// Number of files in the level.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns `true` if the level has no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Level layout of one column family, read fresh at every decision.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColumnFamilyMetadata {
    /// Column family name.
    pub name: String,
    /// Every level of the tree, including empty ones.
    pub levels: Vec<LevelMetadata>,
}

/// Delivered after a memory buffer has been flushed into a level-0 file.
#[derive(Clone, Debug)]
pub struct FlushJobInfo {
    /// Column family the flush belongs to.
    pub cf_name: String,
    /// Name of the newly created file.
    pub file_name: String,
    /// `true` if writes were stopped because of the level-0 backlog.
    pub triggered_writes_stop: bool,
}

/// Delivered after a merge has been installed.
#[derive(Clone, Debug)]
pub struct CompactionJobInfo {
    /// Column family the merge belongs to.
    pub cf_name: String,
    /// Lowest level any input came from.
    pub base_input_level: usize,
    /// Level that received the outputs.
    pub output_level: usize,
    /// Names of the merged inputs.
    pub input_files: Vec<String>,
    /// Names of the produced outputs.
    pub output_files: Vec<String>,
}

/// Coarse classification of an engine status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// Reading or writing storage failed.
    Io,
    /// Stored data failed validation.
    Corruption,
    /// Another job owns one of the inputs.
    Busy,
    /// The job was aborted by the engine.
    Aborted,
    /// An input no longer exists.
    NotFound,
    /// The request itself was malformed.
    InvalidArgument,
    /// Anything the engine does not classify.
    Other,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Io => "io",
            Self::Corruption => "corruption",
            Self::Busy => "busy",
            Self::Aborted => "aborted",
            Self::NotFound => "not found",
            Self::InvalidArgument => "invalid argument",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Failure status reported by the storage engine.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("engine {kind} error: {message}")]
pub struct EngineError {
    /// Failure class reported by the engine.
    pub kind: EngineErrorKind,
    /// Engine-provided description.
    pub message: String,
}

impl EngineError {
    /// Build an error of the given kind.
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Returns `true` if the engine reported a storage I/O failure.
    pub fn is_io(&self) -> bool {
        matches!(self.kind, EngineErrorKind::Io)
    }
}

/// Future returned by [`StorageEngine::compact_files`].
pub type CompactFuture<'a> = Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + 'a>>;

/// Storage engine surface used by the compactor.
pub trait StorageEngine: Send + Sync + 'static {
    /// Current level layout of `cf_name`, including the being-compacted flags.
    fn column_family_metadata(&self, cf_name: &str) -> ColumnFamilyMetadata;

    /// Merge `input_files` into `output_level`.
    ///
    /// Inputs that vanished or are already owned by another merge must be rejected rather than
    /// merged twice.
    fn compact_files<'a>(
        &'a self,
        options: &'a CompactOptions,
        cf_name: &'a str,
        input_files: &'a [String],
        output_level: usize,
    ) -> CompactFuture<'a>;
}

/// Receiver for engine events.
pub trait EventListener: Send + Sync {
    /// Called after a memory buffer flush produced a new level-0 file.
    fn on_flush_completed(&self, info: &FlushJobInfo);

    /// Called after a merge finished and its outputs are visible.
    fn on_compaction_completed(&self, info: &CompactionJobInfo);
}
