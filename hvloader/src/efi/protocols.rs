//! Capability lookup through boot-services protocols

use alloc::boxed::Box;
#[cfg(feature = "self_test")]
use alloc::string::{String, ToString};

use log::{debug, error};
use uefi::boot::{self, OpenProtocolAttributes, OpenProtocolParams, ScopedProtocol, SearchType};
use uefi::proto::ProtocolPointer;
use uefi::proto::shim::ShimLock;
use uefi::{Identify, Status};

use crate::capability::{CapabilityId, CapabilityRegistry, ModuleVerifier};
#[cfg(feature = "self_test")]
use crate::capability::{HypervisorMedia, MemoryMapInfo};
use crate::error::{HvlError, Result};
#[cfg(feature = "self_test")]
use crate::platform::QueryError;

/// Hypervisor media operation table as a firmware protocol.
#[cfg(feature = "self_test")]
#[repr(transparent)]
#[uefi::proto::unsafe_protocol("098d423a-6ca5-4ad4-90fa-72c3ce22c8d0")]
pub struct HypervisorMediaProtocol(hvl_api::HypervisorMediaProtocol);

/// Open the first instance of the protocol registered under `id`.
fn open_capability<P: ProtocolPointer + ?Sized>(id: &CapabilityId) -> Result<ScopedProtocol<P>> {
    if P::GUID != id.guid {
        return Err(HvlError::CapabilityMalformed(id.name));
    }

    let handles = boot::locate_handle_buffer(SearchType::ByProtocol(&id.guid)).map_err(|e| {
        error!("{} not published: {:?}", id.name, e.status());
        HvlError::CapabilityNotFound(id.name)
    })?;
    let handle = *handles.first().ok_or(HvlError::CapabilityNotFound(id.name))?;
    debug!("{} found on {} handle(s)", id.name, handles.len());

    // SAFETY: the protocol is used only while the loader runs and is not
    // uninstalled by anything the loader calls before releasing it.
    unsafe {
        boot::open_protocol::<P>(
            OpenProtocolParams {
                handle,
                agent: boot::image_handle(),
                controller: None,
            },
            OpenProtocolAttributes::GetProtocol,
        )
    }
    .map_err(|e| {
        error!("Failed to open {}: {:?}", id.name, e.status());
        HvlError::CapabilityNotFound(id.name)
    })
}

struct ShimVerifier {
    shim: ScopedProtocol<ShimLock>,
}

impl ModuleVerifier for ShimVerifier {
    fn verify(&self, image: &[u8]) -> core::result::Result<(), Status> {
        self.shim.verify(image).map_err(|e| e.status())
    }
}

#[cfg(feature = "self_test")]
struct EfiHypervisorMedia {
    protocol: ScopedProtocol<HypervisorMediaProtocol>,
}

#[cfg(feature = "self_test")]
impl HypervisorMedia for EfiHypervisorMedia {
    fn memory_map(&self, buf: &mut [u8]) -> core::result::Result<MemoryMapInfo, QueryError> {
        let get_memory_map = self
            .protocol
            .0
            .get_memory_map
            .ok_or(QueryError::Failed(Status::PROTOCOL_ERROR))?;

        let mut map_size = buf.len();
        let mut map_key = 0usize;
        let mut descriptor_size = 0usize;
        let mut descriptor_version = 0u32;
        let map = if buf.is_empty() {
            core::ptr::null_mut()
        } else {
            buf.as_mut_ptr().cast()
        };

        // SAFETY: `map` is null or covers `map_size` writable bytes.
        let status = unsafe {
            get_memory_map(
                &mut map_size,
                map,
                &mut map_key,
                &mut descriptor_size,
                &mut descriptor_version,
            )
        };

        match status {
            Status::SUCCESS => Ok(MemoryMapInfo {
                map_size,
                map_key,
                descriptor_size,
                descriptor_version,
            }),
            Status::BUFFER_TOO_SMALL => Err(QueryError::BufferTooSmall { required: map_size }),
            status => Err(QueryError::Failed(status)),
        }
    }

    fn next_log_message(&self, cursor: &mut usize) -> Option<String> {
        let next = self.protocol.0.get_next_log_message?;

        // SAFETY: the returned pointer is null or a NUL-terminated UCS-2
        // string owned by the hypervisor.
        let message = unsafe { next(cursor) };
        if message.is_null() {
            return None;
        }
        // SAFETY: checked non-null above.
        let message = unsafe { uefi::CStr16::from_ptr(message.cast()) };
        Some(message.to_string())
    }
}

/// Registry backed by `LocateHandleBuffer` and `OpenProtocol`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EfiCapabilityRegistry;

impl CapabilityRegistry for EfiCapabilityRegistry {
    fn locate_verifier(&self, id: &CapabilityId) -> Result<Box<dyn ModuleVerifier + '_>> {
        let shim = open_capability::<ShimLock>(id)?;
        Ok(Box::new(ShimVerifier { shim }))
    }

    #[cfg(feature = "self_test")]
    fn locate_hypervisor_media(&self, id: &CapabilityId) -> Result<Box<dyn HypervisorMedia + '_>> {
        let protocol = open_capability::<HypervisorMediaProtocol>(id)?;
        if protocol.0.get_memory_map.is_none() {
            error!("{} has no memory map operation", id.name);
            return Err(HvlError::CapabilityMalformed(id.name));
        }
        Ok(Box::new(EfiHypervisorMedia { protocol }))
    }
}
