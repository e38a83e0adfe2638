//! Hypervisor media capability (diagnostic use only)
//!
//! The module launched by the loader publishes this capability once the
//! hypervisor is staged. The loader's self-test uses it to read back the
//! memory map with per-descriptor ownership attributes. Production boots
//! never touch it.

use core::ffi::c_void;

use bitflags::bitflags;
use uefi_raw::table::boot::{MemoryAttribute, MemoryDescriptor, MemoryType};
use uefi_raw::{Guid, PhysicalAddress, Status, guid};

/// Identifier of the hypervisor media capability.
pub const HYPERVISOR_MEDIA_GUID: Guid = guid!("098d423a-6ca5-4ad4-90fa-72c3ce22c8d0");

bitflags! {
    /// Ownership bits stored in the extension record of each descriptor.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExtendedAttributes: u64 {
        /// Pages owned by the hypervisor.
        const HYPERVISOR = 0x0000_0000_0000_0001;
        /// Pages owned by the hypervisor loader module.
        const LOADER     = 0x0000_0000_0000_0002;
    }
}

/// Operation table published under [`HYPERVISOR_MEDIA_GUID`].
///
/// Entries may be null; callers check before use.
#[repr(C)]
pub struct HypervisorMediaProtocol {
    pub launch_hypervisor:
        Option<unsafe extern "efiapi" fn(sanitize_bsp_context: *mut c_void, return_data: *mut c_void)>,

    pub register_runtime_range:
        Option<unsafe extern "efiapi" fn(base_page: u64, page_count: u64) -> u32>,

    /// Same two-phase contract as the firmware memory map: a call with a too
    /// small buffer returns `BUFFER_TOO_SMALL` and writes the required size.
    pub get_memory_map: Option<
        unsafe extern "efiapi" fn(
            memory_map_size: *mut usize,
            memory_map: *mut MemoryDescriptor,
            map_key: *mut usize,
            descriptor_size: *mut usize,
            descriptor_version: *mut u32,
        ) -> Status,
    >,

    /// Returns the message at `*next_message` and advances the cursor, or
    /// null once the log is drained.
    pub get_next_log_message: Option<unsafe extern "efiapi" fn(next_message: *mut usize) -> *const u16>,
}

impl HypervisorMediaProtocol {
    pub const GUID: Guid = HYPERVISOR_MEDIA_GUID;
}

/// Size of the standard firmware descriptor that prefixes each entry.
pub const BASE_DESCRIPTOR_SIZE: usize = 40;

/// Size of the extension record occupying the last bytes of each entry.
pub const EXTENSION_SIZE: usize = 16;

/// One decoded memory-map entry with its extension record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedDescriptor {
    pub ty: MemoryType,
    pub phys_start: PhysicalAddress,
    pub virt_start: u64,
    pub page_count: u64,
    pub attribute: MemoryAttribute,
    pub ex_attributes: ExtendedAttributes,
}

impl ExtendedDescriptor {
    pub fn is_loader_owned(&self) -> bool {
        self.ex_attributes.contains(ExtendedAttributes::LOADER)
    }

    pub fn is_hypervisor_owned(&self) -> bool {
        self.ex_attributes.contains(ExtendedAttributes::HYPERVISOR)
    }
}

/// Read-only walk over an extended memory map returned by
/// `get_memory_map`.
///
/// Entries are `descriptor_size` bytes apart; the standard descriptor sits at
/// the start of each entry and the extension record at its end.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapView<'a> {
    bytes: &'a [u8],
    descriptor_size: usize,
}

impl<'a> MemoryMapView<'a> {
    /// Wrap a filled map buffer. Fails if an entry is too small to hold both
    /// records without overlap.
    pub fn new(bytes: &'a [u8], descriptor_size: usize) -> Option<Self> {
        if descriptor_size < BASE_DESCRIPTOR_SIZE + EXTENSION_SIZE {
            return None;
        }
        Some(Self {
            bytes,
            descriptor_size,
        })
    }

    /// Number of complete entries.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.descriptor_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Trailing bytes that do not form a whole entry.
    pub fn remainder(&self) -> usize {
        self.bytes.len() % self.descriptor_size
    }

    pub fn iter(&self) -> impl Iterator<Item = ExtendedDescriptor> + 'a {
        let descriptor_size = self.descriptor_size;
        self.bytes
            .chunks_exact(descriptor_size)
            .map(move |entry| decode(entry, descriptor_size))
    }
}

fn decode(entry: &[u8], descriptor_size: usize) -> ExtendedDescriptor {
    let ex = descriptor_size - EXTENSION_SIZE;
    ExtendedDescriptor {
        ty: MemoryType(read_u32(entry, 0)),
        phys_start: read_u64(entry, 8),
        virt_start: read_u64(entry, 16),
        page_count: read_u64(entry, 24),
        attribute: MemoryAttribute::from_bits_retain(read_u64(entry, 32)),
        ex_attributes: ExtendedAttributes::from_bits_retain(read_u64(entry, ex)),
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_ne_bytes(raw)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_ne_bytes(raw)
}
