//! Capacity configuration shared by the compactor and persisted next to the store.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::log_info;

/// File name of the persisted capacity configuration inside a store directory.
pub const KAP_CONFIG_FILE: &str = "kap_config.json";

/// Capacity applied to any level past the configured `kapacities` prefix.
pub const DEFAULT_KAPACITY: u64 = 1;

/// Headroom for file metadata, expressed in percent of the logical target size.
const TARGET_SIZE_HEADROOM_PERCENT: u128 = 104;

/// Errors raised while loading, saving or validating a [`CapacityOptions`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be opened, created or written.
    #[error("config io error at {path}: {source}")]
    Io {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// The configuration file is malformed or misses a required field.
    #[error("malformed config at {path}: {source}")]
    Parse {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying decoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// The configuration could not be encoded.
    #[error("failed to encode config: {0}")]
    Encode(#[source] serde_json::Error),
    /// The configuration holds values the compactor cannot enforce.
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn write_then_rename(temp_path: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(temp_path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(temp_path, path)
}

fn unconstrained_file_size() -> u64 {
    u64::MAX
}

/// Per-run policy parameters: size ratio, per-level file capacities and sizing inputs.
///
/// The record is flat so it serializes to a small JSON document that a later process can read
/// back to keep enforcing the same capacities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapacityOptions {
    /// Growth factor `T` between adjacent levels.
    pub size_ratio: u32,
    /// Maximum file count per level, indexed by level.
    pub kapacities: Vec<u32>,
    /// Memory buffer (flush) size in bytes.
    pub buffer_size: u64,
    /// Bytes per record. Only used by key/value generators.
    pub entry_size: u64,
    /// Bloom filter bits per element handed to the engine.
    pub bits_per_element: f64,
    /// Fixed output file size; `u64::MAX` means unconstrained.
    #[serde(default = "unconstrained_file_size")]
    pub fixed_file_size: u64,
    /// Number of keys loaded into the tree.
    pub num_keys: u64,
    /// Number of levels the tree was built with.
    pub levels: u32,
}

impl Default for CapacityOptions {
    fn default() -> Self {
        Self {
            size_ratio: 2,
            kapacities: vec![1],
            buffer_size: 1 << 20,
            entry_size: 512,
            bits_per_element: 5.0,
            fixed_file_size: u64::MAX,
            num_keys: 0,
            levels: 0,
        }
    }
}

impl CapacityOptions {
    /// Set the size ratio.
    pub fn size_ratio(self, size_ratio: u32) -> Self {
        CapacityOptions { size_ratio, ..self }
    }

    /// Set the per-level capacities.
    pub fn kapacities(self, kapacities: impl Into<Vec<u32>>) -> Self {
        CapacityOptions {
            kapacities: kapacities.into(),
            ..self
        }
    }

    /// Set the memory buffer size in bytes.
    pub fn buffer_size(self, buffer_size: u64) -> Self {
        CapacityOptions {
            buffer_size,
            ..self
        }
    }

    /// Set the entry size in bytes.
    pub fn entry_size(self, entry_size: u64) -> Self {
        CapacityOptions { entry_size, ..self }
    }

    /// Set the bloom filter bit budget.
    pub fn bits_per_element(self, bits_per_element: f64) -> Self {
        CapacityOptions {
            bits_per_element,
            ..self
        }
    }

    /// Pin every compaction output to a fixed file size.
    pub fn fixed_file_size(self, fixed_file_size: u64) -> Self {
        CapacityOptions {
            fixed_file_size,
            ..self
        }
    }

    /// Set the number of keys.
    pub fn num_keys(self, num_keys: u64) -> Self {
        CapacityOptions { num_keys, ..self }
    }

    /// Set the number of levels.
    pub fn levels(self, levels: u32) -> Self {
        CapacityOptions { levels, ..self }
    }
}

impl CapacityOptions {
    /// Maximum number of files allowed at `level`.
    ///
    /// Levels past the configured prefix fall back to [`DEFAULT_KAPACITY`].
    pub fn kapacity(&self, level: usize) -> u64 {
        self.kapacities
            .get(level)
            .map(|kapacity| u64::from(*kapacity))
            .unwrap_or(DEFAULT_KAPACITY)
    }

    /// Logical output file size for `level`:
    /// `1.04 * buffer_size * size_ratio^(level + 1) / kapacity(level)`, rounded down.
    ///
    /// Evaluated in integer arithmetic and saturated at `u64::MAX`. Rounding down is intended:
    /// 1 MiB buffers, ratio 4 and kapacity 2 give 2_181_038 bytes at level 0.
    pub fn target_file_size(&self, level: usize) -> u64 {
        let exponent = u32::try_from(level + 1).unwrap_or(u32::MAX);
        let growth = u128::from(self.size_ratio).saturating_pow(exponent);
        let kapacity = u128::from(self.kapacity(level).max(1));
        let size = u128::from(self.buffer_size)
            .saturating_mul(growth)
            .saturating_mul(TARGET_SIZE_HEADROOM_PERCENT)
            / (100 * kapacity);
        u64::try_from(size).unwrap_or(u64::MAX)
    }

    /// Output-file-size limit handed to the merge primitive for tasks sourced at `level`.
    pub fn output_file_size(&self, level: usize) -> u64 {
        if self.fixed_file_size != u64::MAX {
            self.fixed_file_size
        } else {
            self.target_file_size(level)
        }
    }

    /// Estimate how many levels `num_keys` entries need under this configuration.
    pub fn estimate_levels(&self) -> u32 {
        if self.buffer_size == 0 || self.size_ratio < 2 {
            return 1;
        }
        let data = self.num_keys as f64 * self.entry_size as f64;
        let buffers = data / self.buffer_size as f64;
        if buffers <= 1.0 {
            return 1;
        }
        let levels = (buffers.ln() / f64::from(self.size_ratio).ln()).ceil();
        (levels as u32).max(1)
    }

    /// Reject configurations the compactor cannot converge on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_ratio < 2 {
            return Err(ConfigError::Invalid(format!(
                "size_ratio must be at least 2, got {}",
                self.size_ratio
            )));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive".into()));
        }
        if let Some(level) = self.kapacities.iter().position(|kapacity| *kapacity == 0) {
            return Err(ConfigError::Invalid(format!(
                "kapacity of level {level} must be at least 1"
            )));
        }
        if !self.bits_per_element.is_finite() || self.bits_per_element < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "bits_per_element must be a non-negative number, got {}",
                self.bits_per_element
            )));
        }
        Ok(())
    }
}

impl CapacityOptions {
    /// Location of the persisted configuration inside `dir`.
    pub fn config_path(dir: impl AsRef<Path>) -> PathBuf {
        dir.as_ref().join(KAP_CONFIG_FILE)
    }

    /// Read and validate a configuration. Nothing is returned unless every field parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let options: CapacityOptions =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        options.validate()?;
        log_info!(
            component = "option",
            event = "config_loaded",
            path = %path.display(),
            size_ratio = options.size_ratio,
            kapacities = ?options.kapacities,
        );
        Ok(options)
    }

    /// Write the configuration to `path` through a temp file and an atomic rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        self.validate()?;
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(ConfigError::Encode)?;
        let temp_path = path.with_extension("json.tmp");

        if let Err(source) = write_then_rename(&temp_path, path, json.as_bytes()) {
            // Best effort: the temp file may never have been created.
            let _ = fs::remove_file(&temp_path);
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }

        log_info!(
            component = "option",
            event = "config_saved",
            path = %path.display(),
        );
        Ok(())
    }

    /// Load the configuration persisted under a store directory.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load(Self::config_path(dir))
    }

    /// Persist the configuration under a store directory.
    pub fn save_to_dir(&self, dir: impl AsRef<Path>) -> Result<(), ConfigError> {
        self.save(Self::config_path(dir))
    }
}
