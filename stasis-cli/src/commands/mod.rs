// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

pub mod demo;
pub mod inspect;
pub mod list;
pub mod restore;
pub mod validate;

use stasis_core::{ConfigLoader, SnapshotConfig, StasisResult};

/// Load the configuration file if one was given, otherwise use defaults.
pub fn load_config(path: Option<&str>) -> StasisResult<SnapshotConfig> {
    match path {
        Some(path) => ConfigLoader::load_file(path),
        None => Ok(SnapshotConfig::default()),
    }
}
