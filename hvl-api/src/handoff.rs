//! Loader → module handoff record
//!
//! The loader fills one [`LoadedImageInfo`] per boot and passes a pointer to
//! it as the third argument of the module entry point. The record is
//! `#[repr(C)]` and starts with a version and a size so that a module built
//! against a different generation of this crate can detect the mismatch
//! before reading anything else.

use core::mem::{offset_of, size_of};

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use uefi_raw::table::boot::MemoryType;
use uefi_raw::table::system::SystemTable;
use uefi_raw::{Handle, PhysicalAddress, Status};

bitflags! {
    /// Execution environment the module is entered in.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HandoffFlags: u32 {
        /// Firmware boot services are still available.
        const ENV_EFI = 0x0000_0001;
        /// Entered from a running OS (firmware boot services gone).
        const ENV_OS  = 0x0000_0002;
    }
}

/// Description of the loaded module image.
///
/// Ownership of the pages in `image_address..image_address + image_pages`
/// passes to the module once its entry point returns success.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImageInfo {
    /// Interface version, see [`LoadedImageInfo::VERSION`].
    pub version: u32,

    /// Size of this record in bytes.
    pub size: u32,

    /// Environment flags.
    pub flags: HandoffFlags,

    /// Physical base address of the loaded image.
    pub image_address: PhysicalAddress,

    /// Image size in bytes, before page rounding.
    pub image_size: u64,

    /// Number of pages allocated for the image.
    pub image_pages: usize,

    /// Memory type the pages were allocated with.
    pub image_memory_type: MemoryType,

    /// Absolute address of the module entry point.
    pub entry_point: PhysicalAddress,
}

// Layout is part of the ABI.
const_assert_eq!(offset_of!(LoadedImageInfo, version), 0);
const_assert_eq!(offset_of!(LoadedImageInfo, size), 4);
const_assert_eq!(offset_of!(LoadedImageInfo, flags), 8);
const_assert_eq!(offset_of!(LoadedImageInfo, image_address), 16);
const_assert_eq!(offset_of!(LoadedImageInfo, image_size), 24);
#[cfg(target_pointer_width = "64")]
const_assert_eq!(offset_of!(LoadedImageInfo, image_memory_type), 40);
#[cfg(target_pointer_width = "64")]
const_assert_eq!(size_of::<LoadedImageInfo>(), 56);

impl LoadedImageInfo {
    /// Current handoff record version.
    pub const VERSION: u32 = 0x0000_0100;

    /// Record size written into [`LoadedImageInfo::size`].
    pub const SIZE: u32 = size_of::<Self>() as u32;

    /// Create an empty record stamped with the current version and size.
    pub const fn new(flags: HandoffFlags) -> Self {
        Self {
            version: Self::VERSION,
            size: Self::SIZE,
            flags,
            image_address: 0,
            image_size: 0,
            image_pages: 0,
            image_memory_type: MemoryType::RESERVED,
            entry_point: 0,
        }
    }

    /// Check the version and size header against this crate's generation.
    pub fn check_abi(&self) -> Result<(), AbiMismatch> {
        check_header(self.version, self.size)
    }

    /// Whether the record describes a loaded image.
    pub fn is_loaded(&self) -> bool {
        self.image_address != 0 && self.image_pages != 0
    }

    /// Address one past the last byte of the page allocation.
    pub fn allocation_end(&self) -> PhysicalAddress {
        self.image_address + (self.image_pages as u64) * (crate::PAGE_SIZE as u64)
    }

    /// Borrow a record handed over by the loader.
    ///
    /// Only the version and size header are read before the check; the rest
    /// of the record is exposed only when both match.
    ///
    /// # Safety
    /// `ptr` must be null or point to at least 8 readable bytes, and to a full
    /// record when the header check passes. The record must outlive `'a`.
    pub unsafe fn from_raw<'a>(ptr: *const Self) -> Result<&'a Self, AbiMismatch> {
        if ptr.is_null() {
            return Err(AbiMismatch::Null);
        }

        // SAFETY: the caller guarantees the 8-byte header is readable.
        let (version, size) = unsafe {
            (
                core::ptr::addr_of!((*ptr).version).read_unaligned(),
                core::ptr::addr_of!((*ptr).size).read_unaligned(),
            )
        };
        check_header(version, size)?;

        // SAFETY: the header matches, so the caller guarantees a full record.
        Ok(unsafe { &*ptr })
    }
}

impl Default for LoadedImageInfo {
    fn default() -> Self {
        Self::new(HandoffFlags::empty())
    }
}

fn check_header(version: u32, size: u32) -> Result<(), AbiMismatch> {
    if version != LoadedImageInfo::VERSION {
        return Err(AbiMismatch::Version { found: version });
    }
    if size < LoadedImageInfo::SIZE {
        return Err(AbiMismatch::Size { found: size });
    }
    Ok(())
}

/// Reason a handoff record was rejected by [`LoadedImageInfo::from_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiMismatch {
    /// No record was passed.
    Null,
    /// Record carries a different interface version.
    Version { found: u32 },
    /// Record is smaller than this generation's layout.
    Size { found: u32 },
}

impl core::fmt::Display for AbiMismatch {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AbiMismatch::Null => write!(f, "no handoff record"),
            AbiMismatch::Version { found } => write!(
                f,
                "handoff version {:#x}, expected {:#x}",
                found,
                LoadedImageInfo::VERSION
            ),
            AbiMismatch::Size { found } => write!(
                f,
                "handoff record is {} bytes, expected at least {}",
                found,
                LoadedImageInfo::SIZE
            ),
        }
    }
}

/// Module entry point.
///
/// Receives the loader's own image handle (so the module can read the
/// loader's command line), the system table, and the handoff record.
pub type HvLoaderEntryPoint = unsafe extern "efiapi" fn(
    image_handle: Handle,
    system_table: *mut SystemTable,
    image_info: *mut LoadedImageInfo,
) -> Status;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_is_stamped() {
        let info = LoadedImageInfo::new(HandoffFlags::ENV_EFI);
        assert_eq!(info.version, 0x100);
        assert_eq!(info.size as usize, size_of::<LoadedImageInfo>());
        assert!(info.check_abi().is_ok());
        assert!(!info.is_loaded());
    }

    #[test]
    fn allocation_end_covers_pages() {
        let mut info = LoadedImageInfo::default();
        info.image_address = 0x10_0000;
        info.image_pages = 2;
        assert_eq!(info.allocation_end(), 0x10_2000);
    }

    #[test]
    fn header_mismatch_is_reported() {
        let mut info = LoadedImageInfo::new(HandoffFlags::ENV_EFI);
        info.version = 0x200;
        assert_eq!(info.check_abi(), Err(AbiMismatch::Version { found: 0x200 }));

        info.version = LoadedImageInfo::VERSION;
        info.size = 16;
        assert_eq!(info.check_abi(), Err(AbiMismatch::Size { found: 16 }));
    }
}
