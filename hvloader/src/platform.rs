//! Firmware seams
//!
//! The pipeline is generic over these traits. The `efi` module implements
//! them on top of boot services; tests implement them with in-memory fakes.

use hvl_api::LoadedImageInfo;
use uefi_raw::Status;
use uefi_raw::table::boot::MemoryType;

use crate::capability::CapabilityRegistry;
use crate::error::Result;
use crate::path::ModulePath;

/// Outcome of a two-phase query other than success.
///
/// `BufferTooSmall` is the expected answer to the first, zero-sized call;
/// the caller allocates `required` bytes and asks again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryError {
    BufferTooSmall { required: usize },
    Failed(Status),
}

/// File-system service of the device the loader was started from.
pub trait BootVolume {
    type Root: VolumeRoot;

    fn open_root(&mut self) -> Result<Self::Root>;
}

/// Root directory of the boot volume. Closed on drop.
pub trait VolumeRoot {
    type File: ModuleFile;

    /// Open `path` read-only. A missing file is [`HvlError::NotFound`].
    ///
    /// [`HvlError::NotFound`]: crate::error::HvlError::NotFound
    fn open_read_only(&mut self, path: &ModulePath) -> Result<Self::File>;
}

/// Open file handle. Closed on drop.
pub trait ModuleFile {
    /// Fill `buf` with the file metadata and return the file size in bytes.
    fn query_info(&mut self, buf: &mut [u8]) -> core::result::Result<u64, QueryError>;

    /// Read from the current position, returning the number of bytes read.
    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Status>;
}

/// Physical page allocator.
pub trait PageAllocator {
    /// Allocate `pages` contiguous pages anywhere, returning the base address.
    fn allocate_pages(&self, memory_type: MemoryType, pages: usize) -> core::result::Result<u64, Status>;

    /// Release pages obtained from [`PageAllocator::allocate_pages`].
    fn free_pages(&self, address: u64, pages: usize) -> core::result::Result<(), Status>;
}

/// Transfers control to a loaded module.
pub trait EntryInvoker {
    /// Call the entry point at `entry_point`, handing it `info`.
    ///
    /// # Safety
    /// `entry_point` must be the entry of a verified, loaded and relocated
    /// image described by `info`.
    unsafe fn invoke(&self, entry_point: u64, info: &mut LoadedImageInfo) -> Status;
}

/// Everything the pipeline needs from the firmware.
pub trait Firmware {
    type Volume: BootVolume;

    /// File system of the device hosting the running loader.
    fn open_boot_volume(&self) -> Result<Self::Volume>;

    fn pages(&self) -> &dyn PageAllocator;

    fn capabilities(&self) -> &dyn CapabilityRegistry;

    fn entry_invoker(&self) -> &dyn EntryInvoker;
}
