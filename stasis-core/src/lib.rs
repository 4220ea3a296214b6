//! Stasis Core Library
//!
//! Process snapshot engine. Hosts guest programs in-process, freezes all of
//! their threads on request, captures memory, execution state and open
//! descriptors into a single self-describing image file, and restarts a guest
//! from such an image as if it had just returned from the snapshot call.

pub mod binding;
pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod guest;
pub mod image;
pub mod restart;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use binding::{TAKE_FAILURE, TAKE_SUCCESS};
pub use config::{ConfigLoader, SnapshotConfig};
pub use controller::{ProcessController, SnapshotOutcome};
pub use error::{GuestError, HardValidationError, SnapshotError, StasisError, StasisResult};
pub use guest::{Guest, GuestExit, GuestProgram, RegisterFile, Step, VcpuContext};
pub use image::{ImageReader, SnapshotImage, SnapshotWriter};
pub use restart::{RestartLoader, RestartReport, RestartedGuest};
pub use state::{RestartPhase, RestartStateMachine, VcpuRunState};
pub use types::{GuestFd, Protection, SnapshotLabel, VcpuId};
