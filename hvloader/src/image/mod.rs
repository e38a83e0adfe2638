//! Image loading
//!
//! Sizes the verified module through an [`ImageFormat`], allocates
//! persistent pages for it, loads and relocates it, and describes the
//! result in a [`LoadedImageInfo`]. The pages are owned by a
//! [`PageAllocation`] guard until the handoff succeeds.

pub mod pecoff;

use hvl_api::{HandoffFlags, LoadedImageInfo, PAGE_SIZE, size_to_pages};
use log::{debug, error, info, warn};
use uefi_raw::table::boot::MemoryType;

use crate::error::{HvlError, Result};
use crate::platform::PageAllocator;
use crate::verify::VerifiedModule;

/// What the container header says about the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    /// Size of the image in memory, before page rounding
    pub image_size: u64,
    pub entry_point_rva: u64,
    /// Address the image was linked for
    pub preferred_base: u64,
}

/// Executable container format.
pub trait ImageFormat {
    /// Parse the headers of `raw`. Must not allocate pages or touch memory
    /// outside `raw`.
    fn inspect(&self, raw: &[u8]) -> Result<ImageLayout>;

    /// Copy `raw` into `region` as laid out in memory.
    fn load(&self, raw: &[u8], region: &mut [u8]) -> Result;

    /// Apply base relocations for an image loaded at `load_address`.
    fn relocate(&self, region: &mut [u8], load_address: u64) -> Result;
}

/// Pages owned by the loader.
///
/// Dropping the guard releases exactly the pages it holds, once.
/// [`PageAllocation::transfer`] gives them up without releasing.
pub struct PageAllocation<'a> {
    allocator: &'a dyn PageAllocator,
    address: u64,
    pages: usize,
    owned: bool,
}

impl<'a> PageAllocation<'a> {
    /// Allocate `pages` pages of `memory_type`.
    pub fn allocate(
        allocator: &'a dyn PageAllocator,
        memory_type: MemoryType,
        pages: usize,
    ) -> Result<Self> {
        let address = allocator.allocate_pages(memory_type, pages).map_err(|status| {
            error!("Failed to allocate {} pages: {:?}", pages, status);
            HvlError::PageAllocationFailed(status)
        })?;
        debug!("Allocated {} pages at {:#x}", pages, address);
        Ok(Self {
            allocator,
            address,
            pages,
            owned: true,
        })
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn byte_len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    /// The allocated pages as a byte slice.
    ///
    /// # Safety
    /// The allocator must have returned an identity-mapped address backed by
    /// `pages * PAGE_SIZE` writable bytes.
    pub unsafe fn as_mut_bytes(&mut self) -> &mut [u8] {
        // SAFETY: upheld by the caller.
        unsafe { core::slice::from_raw_parts_mut(self.address as *mut u8, self.byte_len()) }
    }

    /// Stop tracking the pages without releasing them. Returns the address
    /// and page count now owned by someone else.
    pub fn transfer(mut self) -> (u64, usize) {
        self.owned = false;
        debug!("Transferred {} pages at {:#x}", self.pages, self.address);
        (self.address, self.pages)
    }
}

impl Drop for PageAllocation<'_> {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        debug!("Releasing {} pages at {:#x}", self.pages, self.address);
        if let Err(status) = self.allocator.free_pages(self.address, self.pages) {
            warn!(
                "Failed to release {} pages at {:#x}: {:?}",
                self.pages, self.address, status
            );
        }
    }
}

/// A loaded, relocated image and the pages backing it.
pub struct LoadedImage<'a> {
    pub allocation: PageAllocation<'a>,
    pub info: LoadedImageInfo,
}

/// Load a verified module into freshly allocated pages of `memory_type`.
///
/// Header parsing happens before any allocation. On load or relocation
/// failure the pages are released before the error is returned.
pub fn load_image<'a>(
    allocator: &'a dyn PageAllocator,
    format: &dyn ImageFormat,
    memory_type: MemoryType,
    module: VerifiedModule<'_>,
) -> Result<LoadedImage<'a>> {
    let raw = module.as_slice();
    let layout = format.inspect(raw)?;
    debug!(
        "Image size {:#x}, entry rva {:#x}, preferred base {:#x}",
        layout.image_size, layout.entry_point_rva, layout.preferred_base
    );

    if layout.image_size == 0 {
        return Err(HvlError::InvalidImage("Image size is zero"));
    }
    let image_len = usize::try_from(layout.image_size)
        .map_err(|_| HvlError::InvalidImage("Image size exceeds address space"))?;
    let pages = usize::try_from(size_to_pages(layout.image_size))
        .map_err(|_| HvlError::InvalidImage("Image size exceeds address space"))?;

    let mut allocation = PageAllocation::allocate(allocator, memory_type, pages)?;
    let address = allocation.address();

    {
        // SAFETY: firmware page allocations are identity mapped and writable.
        let region = unsafe { &mut allocation.as_mut_bytes()[..image_len] };
        format
            .load(raw, region)
            .inspect_err(|e| error!("Failed to load image: {}", e))?;
        format
            .relocate(region, address)
            .inspect_err(|e| error!("Failed to relocate image: {}", e))?;
    }

    let mut info = LoadedImageInfo::new(HandoffFlags::ENV_EFI);
    info.image_address = address;
    info.image_size = layout.image_size;
    info.image_pages = pages;
    info.image_memory_type = memory_type;
    info.entry_point = address + layout.entry_point_rva;

    info!(
        "Image loaded at {:#x} ({} pages), entry point {:#x}",
        address, pages, info.entry_point
    );
    Ok(LoadedImage { allocation, info })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::assume_verified;
    use alloc::vec::Vec;
    use core::cell::RefCell;
    use uefi_raw::Status;

    /// Hands out page-aligned heap memory and records every release.
    #[derive(Default)]
    struct RecordingAllocator {
        freed: RefCell<Vec<(u64, usize)>>,
        fail: bool,
    }

    impl PageAllocator for RecordingAllocator {
        fn allocate_pages(
            &self,
            _memory_type: MemoryType,
            pages: usize,
        ) -> core::result::Result<u64, Status> {
            if self.fail {
                return Err(Status::OUT_OF_RESOURCES);
            }
            let layout = std::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE)
                .map_err(|_| Status::INVALID_PARAMETER)?;
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            Ok(ptr as u64)
        }

        fn free_pages(&self, address: u64, pages: usize) -> core::result::Result<(), Status> {
            self.freed.borrow_mut().push((address, pages));
            Ok(())
        }
    }

    /// Copies the raw bytes and optionally fails one step.
    #[derive(Default)]
    struct FlatFormat {
        image_size: u64,
        fail_load: bool,
        fail_relocate: bool,
    }

    impl ImageFormat for FlatFormat {
        fn inspect(&self, _raw: &[u8]) -> Result<ImageLayout> {
            Ok(ImageLayout {
                image_size: self.image_size,
                entry_point_rva: 0x10,
                preferred_base: 0,
            })
        }

        fn load(&self, raw: &[u8], region: &mut [u8]) -> Result {
            if self.fail_load {
                return Err(HvlError::LoadFailed("Section exceeds image"));
            }
            region[..raw.len()].copy_from_slice(raw);
            Ok(())
        }

        fn relocate(&self, _region: &mut [u8], _load_address: u64) -> Result {
            if self.fail_relocate {
                return Err(HvlError::RelocationFailed("Bad relocation block"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_guard_releases_once_on_drop() {
        let allocator = RecordingAllocator::default();
        let allocation =
            PageAllocation::allocate(&allocator, MemoryType::LOADER_DATA, 3).unwrap();
        let address = allocation.address();
        drop(allocation);
        assert_eq!(*allocator.freed.borrow(), [(address, 3)]);
    }

    #[test]
    fn test_transfer_does_not_release() {
        let allocator = RecordingAllocator::default();
        let allocation =
            PageAllocation::allocate(&allocator, MemoryType::LOADER_DATA, 2).unwrap();
        let (_, pages) = allocation.transfer();
        assert_eq!(pages, 2);
        assert!(allocator.freed.borrow().is_empty());
    }

    #[test]
    fn test_load_image_fills_handoff_record() {
        let allocator = RecordingAllocator::default();
        let format = FlatFormat {
            image_size: 0x1800,
            ..Default::default()
        };
        let raw = [0xAAu8; 64];

        let loaded = load_image(
            &allocator,
            &format,
            MemoryType::RUNTIME_SERVICES_CODE,
            assume_verified(&raw),
        )
        .unwrap();

        assert_eq!(loaded.info.image_pages, 2);
        assert_eq!(loaded.info.image_size, 0x1800);
        assert_eq!(loaded.info.entry_point, loaded.info.image_address + 0x10);
        assert_eq!(loaded.info.image_memory_type, MemoryType::RUNTIME_SERVICES_CODE);
        assert!(loaded.info.flags.contains(HandoffFlags::ENV_EFI));
        assert!(loaded.info.check_abi().is_ok());

        let copied = unsafe { core::slice::from_raw_parts(loaded.info.image_address as *const u8, 64) };
        assert_eq!(copied, &raw);

        let (address, pages) = loaded.allocation.transfer();
        assert_eq!((address, pages), (loaded.info.image_address, 2));
    }

    #[test]
    fn test_relocation_failure_releases_pages() {
        let allocator = RecordingAllocator::default();
        let format = FlatFormat {
            image_size: 0x2000,
            fail_relocate: true,
            ..Default::default()
        };
        let raw = [0u8; 16];

        let result = load_image(
            &allocator,
            &format,
            MemoryType::RUNTIME_SERVICES_CODE,
            assume_verified(&raw),
        );

        assert_eq!(
            result.err(),
            Some(HvlError::RelocationFailed("Bad relocation block"))
        );
        let freed = allocator.freed.borrow();
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].1, 2);
    }

    #[test]
    fn test_load_failure_releases_pages() {
        let allocator = RecordingAllocator::default();
        let format = FlatFormat {
            image_size: 0x2800,
            fail_load: true,
            ..Default::default()
        };
        let raw = [0u8; 16];

        let result = load_image(
            &allocator,
            &format,
            MemoryType::RUNTIME_SERVICES_CODE,
            assume_verified(&raw),
        );

        assert_eq!(result.err(), Some(HvlError::LoadFailed("Section exceeds image")));
        let freed = allocator.freed.borrow();
        assert_eq!(freed.len(), 1);
        assert_ne!(freed[0].0, 0);
        assert_eq!(freed[0].1, 3);
    }

    #[test]
    fn test_allocation_failure_has_nothing_to_release() {
        let allocator = RecordingAllocator {
            fail: true,
            ..Default::default()
        };
        let format = FlatFormat {
            image_size: 0x1000,
            ..Default::default()
        };

        let result = load_image(
            &allocator,
            &format,
            MemoryType::RUNTIME_SERVICES_CODE,
            assume_verified(&[0u8; 4]),
        );

        assert_eq!(
            result.err(),
            Some(HvlError::PageAllocationFailed(Status::OUT_OF_RESOURCES))
        );
        assert!(allocator.freed.borrow().is_empty());
    }
}
