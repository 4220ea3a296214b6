// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Any invalid field results in a HardValidationError; nothing is
//! snapshotted or restarted with a configuration that failed validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HardValidationError, StasisError, StasisResult};

/// Raw snapshot configuration as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSnapshotConfig {
    #[serde(default = "default_directory")]
    directory: String,
    #[serde(default = "default_strict_descriptors")]
    strict_descriptors: bool,
    #[serde(default = "default_quiesce_timeout_ms")]
    quiesce_timeout_ms: u64,
    #[serde(default = "default_capture_workers")]
    capture_workers: usize,
    #[serde(default)]
    live: bool,
    #[serde(default)]
    input_path: Option<String>,
    #[serde(default)]
    output_path: Option<String>,
}

fn default_directory() -> String {
    "./stasis-snapshots".to_string()
}

fn default_strict_descriptors() -> bool {
    true
}

fn default_quiesce_timeout_ms() -> u64 {
    2000
}

fn default_capture_workers() -> usize {
    num_cpus::get().clamp(1, 8)
}

impl Default for RawSnapshotConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            strict_descriptors: default_strict_descriptors(),
            quiesce_timeout_ms: default_quiesce_timeout_ms(),
            capture_workers: default_capture_workers(),
            live: false,
            input_path: None,
            output_path: None,
        }
    }
}

/// Raw root configuration file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    snapshot: RawSnapshotConfig,
}

/// Validated snapshot engine configuration.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Directory images are written to and restarted from.
    pub directory: PathBuf,
    /// Fail a snapshot on unrestorable descriptors instead of dropping them.
    pub strict_descriptors: bool,
    /// Upper bound on waiting for every vCPU to reach its safepoint.
    pub quiesce_timeout: Duration,
    /// Worker threads used to copy memory regions.
    pub capture_workers: usize,
    /// Keep the guest running after a successful snapshot.
    pub live: bool,
    /// File handed to the guest by `snapshot_getdata`.
    pub input_path: Option<PathBuf>,
    /// File written by the guest through `snapshot_putdata`.
    pub output_path: Option<PathBuf>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(default_directory()),
            strict_descriptors: default_strict_descriptors(),
            quiesce_timeout: Duration::from_millis(default_quiesce_timeout_ms()),
            capture_workers: default_capture_workers(),
            live: false,
            input_path: None,
            output_path: None,
        }
    }
}

impl SnapshotConfig {
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn with_strict_descriptors(mut self, strict: bool) -> Self {
        self.strict_descriptors = strict;
        self
    }

    pub fn with_quiesce_timeout(mut self, timeout: Duration) -> Self {
        self.quiesce_timeout = timeout;
        self
    }

    pub fn with_capture_workers(mut self, workers: usize) -> Self {
        self.capture_workers = workers.max(1);
        self
    }

    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    pub fn with_input_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_path = Some(path.into());
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    /// Returns HardValidationError for any invalid fields.
    pub fn load_file(path: impl AsRef<Path>) -> StasisResult<SnapshotConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(StasisError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| StasisError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> StasisResult<SnapshotConfig> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| StasisError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Ok(Self::validate(raw.snapshot)?)
    }

    /// Validate raw configuration and convert to validated types.
    fn validate(raw: RawSnapshotConfig) -> Result<SnapshotConfig, HardValidationError> {
        const MAX_QUIESCE_TIMEOUT_MS: u64 = 60_000;
        const MAX_CAPTURE_WORKERS: usize = 64;

        if raw.directory.trim().is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "directory",
                context: "snapshot section".to_string(),
            });
        }

        if raw.quiesce_timeout_ms == 0 || raw.quiesce_timeout_ms > MAX_QUIESCE_TIMEOUT_MS {
            return Err(HardValidationError::InvalidFieldValue {
                field: "quiesce_timeout_ms",
                value: raw.quiesce_timeout_ms.to_string(),
                reason: format!("Must be between 1 and {}", MAX_QUIESCE_TIMEOUT_MS),
            });
        }

        if raw.capture_workers == 0 || raw.capture_workers > MAX_CAPTURE_WORKERS {
            return Err(HardValidationError::InvalidFieldValue {
                field: "capture_workers",
                value: raw.capture_workers.to_string(),
                reason: format!("Must be between 1 and {}", MAX_CAPTURE_WORKERS),
            });
        }

        let input_path = Self::optional_path("input_path", raw.input_path)?;
        let output_path = Self::optional_path("output_path", raw.output_path)?;

        if let (Some(input), Some(output)) = (&input_path, &output_path) {
            if input == output {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "output_path",
                    value: output.display().to_string(),
                    reason: "Output path must differ from input path".to_string(),
                });
            }
        }

        Ok(SnapshotConfig {
            directory: PathBuf::from(raw.directory),
            strict_descriptors: raw.strict_descriptors,
            quiesce_timeout: Duration::from_millis(raw.quiesce_timeout_ms),
            capture_workers: raw.capture_workers,
            live: raw.live,
            input_path,
            output_path,
        })
    }

    fn optional_path(
        field: &'static str,
        value: Option<String>,
    ) -> Result<Option<PathBuf>, HardValidationError> {
        match value {
            Some(path) if path.trim().is_empty() => Err(HardValidationError::InvalidFieldValue {
                field,
                value: path,
                reason: "Path cannot be empty".to_string(),
            }),
            Some(path) => Ok(Some(PathBuf::from(path))),
            None => Ok(None),
        }
    }
}
