//! Boot-services page allocator

use core::ptr::NonNull;

use uefi::boot::{self, AllocateType, MemoryType};
use uefi::Status;

use crate::platform::PageAllocator;

/// Page allocator backed by `AllocatePages`/`FreePages`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UefiPageAllocator;

impl PageAllocator for UefiPageAllocator {
    fn allocate_pages(&self, memory_type: MemoryType, pages: usize) -> Result<u64, Status> {
        let ptr = boot::allocate_pages(AllocateType::AnyPages, memory_type, pages)
            .map_err(|e| e.status())?;
        Ok(ptr.as_ptr() as u64)
    }

    fn free_pages(&self, address: u64, pages: usize) -> Result<(), Status> {
        let ptr = NonNull::new(address as *mut u8).ok_or(Status::INVALID_PARAMETER)?;

        // SAFETY: `address` and `pages` come from a previous `allocate_pages`.
        unsafe { boot::free_pages(ptr, pages) }.map_err(|e| e.status())
    }
}
