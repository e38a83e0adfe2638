//! HvLoader API - types shared across the loader/module boundary
//!
//! The loader stub reads an external module from the boot volume, verifies
//! it, loads it into persistent pages and calls its entry point. Everything
//! the two sides must agree on lives here:
//!
//! - **Handoff**: the versioned [`LoadedImageInfo`] record and the
//!   [`HvLoaderEntryPoint`] calling convention
//! - **Media**: the debug-only hypervisor media capability and the extended
//!   memory-map descriptor layout it reports
//!
//! # Usage
//!
//! A module entered by the loader checks the record before trusting it:
//!
//! ```rust
//! use hvl_api::{HandoffFlags, LoadedImageInfo};
//!
//! let info = LoadedImageInfo::new(HandoffFlags::ENV_EFI);
//! let checked = unsafe { LoadedImageInfo::from_raw(&info) }.unwrap();
//! assert_eq!(checked.version, LoadedImageInfo::VERSION);
//! ```

#![no_std]

pub mod handoff;
pub mod media;

pub use crate::handoff::{AbiMismatch, HandoffFlags, HvLoaderEntryPoint, LoadedImageInfo};
pub use crate::media::{
    ExtendedAttributes, ExtendedDescriptor, HYPERVISOR_MEDIA_GUID, HypervisorMediaProtocol,
    MemoryMapView,
};

/// UEFI page size used for every page-granular quantity in the handoff.
pub const PAGE_SIZE: usize = 4096;

/// Number of pages needed to hold `size` bytes.
pub const fn size_to_pages(size: u64) -> u64 {
    size.div_ceil(PAGE_SIZE as u64)
}
