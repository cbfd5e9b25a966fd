use ulid::Ulid;

use crate::engine::CompactOptions;

/// One scheduled merge of files from `source_level` into `output_level`.
///
/// Created by the picker and consumed exactly once by the job that runs it.
#[derive(Clone, Debug)]
pub struct CompactionTask {
    /// Identifier used to correlate log events of one task.
    pub id: Ulid,
    /// Column family the inputs belong to.
    pub cf_name: String,
    /// Level the inputs were picked from.
    pub source_level: usize,
    /// Level receiving the merged outputs.
    pub output_level: usize,
    /// Names of the input files; never empty.
    pub input_files: Vec<String>,
    /// Sizing and compression forwarded to the merge primitive.
    pub compact_options: CompactOptions,
    /// Re-pick the source level once if the merge fails for a non-I/O reason.
    pub retry_on_fail: bool,
}

impl CompactionTask {
    /// Build a task. Returns `None` when there is nothing to merge.
    pub fn new(
        cf_name: impl Into<String>,
        source_level: usize,
        output_level: usize,
        input_files: Vec<String>,
        compact_options: CompactOptions,
    ) -> Option<Self> {
        if input_files.is_empty() {
            return None;
        }
        Some(Self {
            id: Ulid::new(),
            cf_name: cf_name.into(),
            source_level,
            output_level,
            input_files,
            compact_options,
            retry_on_fail: false,
        })
    }

    /// Set the retry flag.
    pub fn with_retry_on_fail(mut self, retry_on_fail: bool) -> Self {
        self.retry_on_fail = retry_on_fail;
        self
    }
}
