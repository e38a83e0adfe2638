//! Diagnostic self-test
//!
//! Runs instead of the production pipeline when the command line starts with
//! the self-test token. Reads the extended memory map back from the
//! hypervisor media capability, reports loader and hypervisor owned ranges,
//! drains the hypervisor log, and then spins so the machine can be inspected.

use hvl_api::MemoryMapView;
use log::{debug, error, info};
use uefi_raw::Status;

use crate::capability::{CapabilityId, CapabilityRegistry, HypervisorMedia};
use crate::error::{HvlError, Result};
use crate::fetch::AlignedBuffer;
use crate::platform::QueryError;

/// Totals gathered by one self-test run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SelfTestReport {
    pub descriptors: usize,
    pub loader_pages: u64,
    pub hypervisor_pages: u64,
    pub log_messages: usize,
}

/// Locate the media capability and run the checks against it.
pub fn run_self_test(registry: &dyn CapabilityRegistry) -> Result<SelfTestReport> {
    info!("Self-test run starting");
    let media = registry
        .locate_hypervisor_media(&CapabilityId::HYPERVISOR_MEDIA)
        .inspect_err(|e| error!("{} capability unavailable: {}", CapabilityId::HYPERVISOR_MEDIA.name, e))?;
    check_media(&*media)
}

/// Walk the extended memory map and drain the log of `media`.
pub fn check_media(media: &dyn HypervisorMedia) -> Result<SelfTestReport> {
    let mut report = SelfTestReport::default();

    let mut probe = AlignedBuffer::new(0)?;
    let required = match media.memory_map(probe.as_mut_bytes()) {
        Err(QueryError::BufferTooSmall { required }) => required,
        Err(QueryError::Failed(status)) => {
            error!("Unexpected status {:?}, expected BUFFER_TOO_SMALL", status);
            return Err(HvlError::UnexpectedProbeStatus(status));
        }
        Ok(_) => {
            error!("Memory map probe did not report a buffer size");
            return Err(HvlError::UnexpectedProbeStatus(Status::SUCCESS));
        }
    };
    debug!("Memory map needs {} bytes", required);

    let mut buffer = AlignedBuffer::new(required)?;
    let bytes = buffer.as_mut_bytes();
    let map = media.memory_map(bytes).map_err(|e| {
        let status = match e {
            QueryError::BufferTooSmall { .. } => Status::BUFFER_TOO_SMALL,
            QueryError::Failed(status) => status,
        };
        error!("Failed to get memory map: {:?}", status);
        HvlError::Firmware(status)
    })?;
    info!(
        "Memory map size {} key {:#x} descriptor size {} version {:#x}",
        map.map_size, map.map_key, map.descriptor_size, map.descriptor_version
    );

    let filled = bytes
        .get(..map.map_size)
        .ok_or(HvlError::CapabilityMalformed("Memory map larger than buffer"))?;
    let view = MemoryMapView::new(filled, map.descriptor_size)
        .ok_or(HvlError::CapabilityMalformed("Descriptor size too small"))?;

    for (index, descriptor) in view.iter().enumerate() {
        report.descriptors += 1;

        if cfg!(feature = "verbose_logging") {
            info!(
                "{:02}) type {:#x} addr {:#x}, np {} attr {:#x} xattr {:#x}",
                index + 1,
                descriptor.ty.0,
                descriptor.phys_start,
                descriptor.page_count,
                descriptor.attribute.bits(),
                descriptor.ex_attributes.bits()
            );
        }

        if descriptor.is_loader_owned() {
            report.loader_pages += descriptor.page_count;
            if !cfg!(feature = "verbose_logging") {
                info!(
                    "Loader mem: type {:#x} addr {:#x}, np {}",
                    descriptor.ty.0, descriptor.phys_start, descriptor.page_count
                );
            }
        }
        if descriptor.is_hypervisor_owned() {
            report.hypervisor_pages += descriptor.page_count;
            if !cfg!(feature = "verbose_logging") {
                info!(
                    "HV mem: type {:#x} addr {:#x}, np {}",
                    descriptor.ty.0, descriptor.phys_start, descriptor.page_count
                );
            }
        }
    }

    let mut cursor = 0usize;
    while let Some(message) = media.next_log_message(&mut cursor) {
        info!("HV: {}", message);
        report.log_messages += 1;
    }

    info!("Self-test run completed: {:?}", report);
    Ok(report)
}

/// Park the processor for external inspection.
pub fn hang() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
