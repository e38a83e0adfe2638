//! UEFI firmware bindings
//!
//! Implements the platform traits on top of boot services and hosts the
//! application entry logic.

pub mod fs;
pub mod memory;
pub mod protocols;

use core::ffi::c_void;
use core::ptr::{self, NonNull};

use hvl_api::{HvLoaderEntryPoint, LoadedImageInfo};
use log::{error, info};
use uefi::{Handle, Identify, Status, boot};
use uefi::proto::loaded_image::LoadedImage;
use uefi_raw::protocol::loaded_image::LoadedImageProtocol;
use uefi_raw::table::system::SystemTable;

use crate::capability::CapabilityRegistry;
use crate::config::LoaderConfig;
use crate::error::{HvlError, Result};
use crate::image::pecoff::PeCoff;
use crate::path::load_options_bytes;
use crate::pipeline;
use crate::platform::{EntryInvoker, Firmware, PageAllocator};

use fs::EfiBootVolume;
use memory::UefiPageAllocator;
use protocols::EfiCapabilityRegistry;

/// Calls the module entry point with the loader's own handles.
pub struct EfiEntryInvoker {
    image_handle: Handle,
    system_table: NonNull<SystemTable>,
}

impl EntryInvoker for EfiEntryInvoker {
    unsafe fn invoke(&self, entry_point: u64, info: &mut LoadedImageInfo) -> Status {
        // SAFETY: the caller guarantees `entry_point` is the entry of a
        // loaded image with the handoff signature.
        let entry = unsafe { core::mem::transmute::<usize, HvLoaderEntryPoint>(entry_point as usize) };

        // SAFETY: both handles are the ones the firmware started us with.
        unsafe { entry(self.image_handle.as_ptr(), self.system_table.as_ptr(), info) }
    }
}

/// Boot services as seen by the running loader image.
pub struct EfiFirmware {
    image_handle: Handle,
    pages: UefiPageAllocator,
    registry: EfiCapabilityRegistry,
    invoker: EfiEntryInvoker,
}

impl EfiFirmware {
    pub fn new() -> Result<Self> {
        let image_handle = boot::image_handle();
        let system_table = uefi::table::system_table_raw()
            .ok_or(HvlError::Firmware(Status::NOT_READY))?;
        Ok(Self {
            image_handle,
            pages: UefiPageAllocator,
            registry: EfiCapabilityRegistry,
            invoker: EfiEntryInvoker {
                image_handle,
                system_table,
            },
        })
    }
}

impl Firmware for EfiFirmware {
    type Volume = EfiBootVolume;

    fn open_boot_volume(&self) -> Result<EfiBootVolume> {
        EfiBootVolume::open(self.image_handle)
    }

    fn pages(&self) -> &dyn PageAllocator {
        &self.pages
    }

    fn capabilities(&self) -> &dyn CapabilityRegistry {
        &self.registry
    }

    fn entry_invoker(&self) -> &dyn EntryInvoker {
        &self.invoker
    }
}

/// Raw load options of `image_handle`.
///
/// Read straight from the loaded-image protocol so that a null pointer with
/// a non-zero size can be told apart from an empty command line. The
/// protocol is not kept open; the launched module opens it again.
fn raw_load_options(image_handle: Handle) -> Result<(*const c_void, u32)> {
    let system_table = uefi::table::system_table_raw()
        .ok_or(HvlError::Firmware(Status::NOT_READY))?;

    // SAFETY: boot services are active while the loader runs.
    let boot_services = unsafe { system_table.as_ref().boot_services };
    if boot_services.is_null() {
        return Err(HvlError::Firmware(Status::NOT_READY));
    }

    let mut interface: *mut c_void = ptr::null_mut();
    // SAFETY: `boot_services` is the live boot services table.
    let status = unsafe {
        ((*boot_services).handle_protocol)(image_handle.as_ptr(), &LoadedImage::GUID, &mut interface)
    };
    if status.is_error() || interface.is_null() {
        error!("Failed to get loaded image protocol: {:?}", status);
        return Err(HvlError::Firmware(status));
    }

    // SAFETY: the firmware returned the loaded-image protocol of our image.
    let loaded_image = unsafe { &*interface.cast::<LoadedImageProtocol>() };
    Ok((loaded_image.load_options, loaded_image.load_options_size))
}

/// Application entry logic.
pub fn efi_main() -> Status {
    if let Err(e) = uefi::helpers::init() {
        return HvlError::from(e).status();
    }

    let config = LoaderConfig::new();
    log::set_max_level(config.log_level);
    info!("HvLoader starting");

    match run(&config) {
        Ok(()) => Status::SUCCESS,
        Err(e) => e.status(),
    }
}

fn run(config: &LoaderConfig) -> Result {
    let firmware = EfiFirmware::new()?;
    let (options, size) = raw_load_options(firmware.image_handle)?;

    // SAFETY: the loaded-image protocol describes a buffer of `size` bytes
    // that lives as long as the image.
    let options = unsafe { load_options_bytes(options, size) }
        .inspect_err(|e| error!("Bad load options: {}", e))?;

    pipeline::run(&firmware, &PeCoff, config, options)
}
