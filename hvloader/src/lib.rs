//! HvLoader library
//!
//! Secondary boot stage that finds the hypervisor loader module on the boot
//! volume, has it verified and measured, loads and relocates it into
//! runtime pages, and enters it with a versioned handoff record.
//!
//! Stages, in pipeline order:
//! [`path`] → [`fetch`] → [`verify`] → [`image`] → [`handoff`], driven by
//! [`pipeline`]. Firmware access goes through the traits in [`platform`];
//! the real bindings live in `efi` and are only built for UEFI targets.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod capability;
pub mod config;
pub mod error;
pub mod fetch;
pub mod handoff;
pub mod image;
pub mod path;
pub mod pipeline;
pub mod platform;
pub mod verify;

/// Diagnostic self-test
#[cfg(feature = "self_test")]
pub mod selftest;

/// UEFI firmware bindings
#[cfg(target_os = "uefi")]
pub mod efi;

pub use config::LoaderConfig;
pub use error::{ErrorKind, HvlError, Result};
pub use pipeline::{PipelineState, run};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
