//! Named firmware capabilities
//!
//! Capabilities are located by identifier at runtime. The identifiers live
//! in one immutable table; the registry hands back typed handles.

use alloc::boxed::Box;
#[cfg(feature = "self_test")]
use alloc::string::String;

use uefi_raw::{Guid, Status, guid};

#[cfg(feature = "self_test")]
use crate::platform::QueryError;
use crate::error::Result;

/// A capability identifier with a name for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityId {
    pub name: &'static str,
    pub guid: Guid,
}

impl CapabilityId {
    /// Verified-boot capability published by the shim.
    pub const SHIM_LOCK: CapabilityId = CapabilityId {
        name: "ShimLock",
        guid: guid!("605dab50-e046-4300-abb6-3dd810dd8b23"),
    };

    /// Debug-only capability published by the launched module.
    pub const HYPERVISOR_MEDIA: CapabilityId = CapabilityId {
        name: "HypervisorMedia",
        guid: hvl_api::HYPERVISOR_MEDIA_GUID,
    };

    pub fn by_name(name: &str) -> Option<&'static CapabilityId> {
        KNOWN_CAPABILITIES.iter().find(|id| id.name == name)
    }
}

/// Every capability the loader knows about.
pub static KNOWN_CAPABILITIES: [CapabilityId; 2] =
    [CapabilityId::SHIM_LOCK, CapabilityId::HYPERVISOR_MEDIA];

/// Verified-boot capability.
///
/// One call validates signature and policy and extends the measurement log
/// with a hash of exactly the bytes passed in.
pub trait ModuleVerifier {
    fn verify(&self, image: &[u8]) -> core::result::Result<(), Status>;
}

impl<T: ModuleVerifier + ?Sized> ModuleVerifier for &T {
    fn verify(&self, image: &[u8]) -> core::result::Result<(), Status> {
        (**self).verify(image)
    }
}

/// Shape of a filled extended memory map.
#[cfg(feature = "self_test")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapInfo {
    pub map_size: usize,
    pub map_key: usize,
    pub descriptor_size: usize,
    pub descriptor_version: u32,
}

/// Debug-only hypervisor media capability.
#[cfg(feature = "self_test")]
pub trait HypervisorMedia {
    /// Two-phase memory map query. The first call with an empty buffer
    /// must report [`QueryError::BufferTooSmall`].
    fn memory_map(&self, buf: &mut [u8]) -> core::result::Result<MemoryMapInfo, QueryError>;

    /// Next message from the hypervisor log, advancing `cursor`.
    fn next_log_message(&self, cursor: &mut usize) -> Option<String>;
}

/// Locates capabilities by identifier.
pub trait CapabilityRegistry {
    fn locate_verifier(&self, id: &CapabilityId) -> Result<Box<dyn ModuleVerifier + '_>>;

    #[cfg(feature = "self_test")]
    fn locate_hypervisor_media(&self, id: &CapabilityId) -> Result<Box<dyn HypervisorMedia + '_>>;
}
