// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Capture of a quiesced guest into image sections.
//!
//! Every function here assumes the caller holds the guest quiesced; nothing
//! is written to disk at this stage.

pub mod descriptors;
pub mod execution;
pub mod memory;

pub use descriptors::DescriptorCapture;
