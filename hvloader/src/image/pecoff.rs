//! PE32+ container format
//!
//! Enough of PE/COFF to size, lay out and rebase a 64-bit image: DOS and PE
//! signatures, the COFF file header, the PE32+ optional header, the section
//! table and the base relocation directory. Every read is bounds-checked
//! against the buffer it comes from.

use log::{debug, trace};

use super::{ImageFormat, ImageLayout};
use crate::error::{HvlError, Result};

const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const E_LFANEW_OFFSET: usize = 0x3C;

const COFF_HEADER_SIZE: usize = 20;
const OPTIONAL_HEADER_MAGIC_PE32PLUS: u16 = 0x020B;
/// Optional header bytes up to and including `NumberOfRvaAndSizes`.
const OPTIONAL_HEADER_FIXED_SIZE: usize = 112;
const SECTION_HEADER_SIZE: usize = 40;

const IMAGE_FILE_RELOCS_STRIPPED: u16 = 0x0001;
const DIRECTORY_BASE_RELOCATION: usize = 5;

const RELOC_BLOCK_HEADER_SIZE: usize = 8;
const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
const IMAGE_REL_BASED_DIR64: u16 = 10;

/// Machine types the loader can hand off to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Machine {
    X86_64 = 0x8664,
    Aarch64 = 0xAA64,
}

impl Machine {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x8664 => Some(Machine::X86_64),
            0xAA64 => Some(Machine::Aarch64),
            _ => None,
        }
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let raw = bytes.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw = bytes.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let raw = bytes.get(offset..offset.checked_add(8)?)?;
    let mut value = [0u8; 8];
    value.copy_from_slice(raw);
    Some(u64::from_le_bytes(value))
}

/// One entry of the section table.
#[derive(Debug, Clone, Copy)]
struct Section {
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
}

/// Header fields the loader needs.
#[derive(Debug, Clone, Copy)]
struct PeHeaders {
    machine: Machine,
    characteristics: u16,
    number_of_sections: usize,
    section_table_offset: usize,
    optional_header_offset: usize,
    entry_point_rva: u32,
    image_base: u64,
    size_of_image: u32,
    size_of_headers: u32,
    reloc_rva: u32,
    reloc_size: u32,
}

impl PeHeaders {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let truncated = HvlError::InvalidImage("Truncated PE headers");

        if read_u16(bytes, 0).ok_or(truncated)? != DOS_MAGIC {
            return Err(HvlError::InvalidImage("Missing DOS signature"));
        }
        let pe_offset = read_u32(bytes, E_LFANEW_OFFSET).ok_or(truncated)? as usize;
        if read_u32(bytes, pe_offset).ok_or(truncated)? != PE_SIGNATURE {
            return Err(HvlError::InvalidImage("Missing PE signature"));
        }

        let coff = pe_offset + 4;
        let machine = read_u16(bytes, coff).ok_or(truncated)?;
        let machine =
            Machine::from_u16(machine).ok_or(HvlError::InvalidImage("Unsupported machine type"))?;
        let number_of_sections = read_u16(bytes, coff + 2).ok_or(truncated)? as usize;
        let size_of_optional_header = read_u16(bytes, coff + 16).ok_or(truncated)? as usize;
        let characteristics = read_u16(bytes, coff + 18).ok_or(truncated)?;

        let opt = coff + COFF_HEADER_SIZE;
        if size_of_optional_header < OPTIONAL_HEADER_FIXED_SIZE {
            return Err(HvlError::InvalidImage("Optional header too small"));
        }
        if read_u16(bytes, opt).ok_or(truncated)? != OPTIONAL_HEADER_MAGIC_PE32PLUS {
            return Err(HvlError::InvalidImage("Not a PE32+ image"));
        }
        let entry_point_rva = read_u32(bytes, opt + 16).ok_or(truncated)?;
        let image_base = read_u64(bytes, opt + 24).ok_or(truncated)?;
        let size_of_image = read_u32(bytes, opt + 56).ok_or(truncated)?;
        let size_of_headers = read_u32(bytes, opt + 60).ok_or(truncated)?;
        let number_of_rva_and_sizes = read_u32(bytes, opt + 108).ok_or(truncated)? as usize;

        let (reloc_rva, reloc_size) = if number_of_rva_and_sizes > DIRECTORY_BASE_RELOCATION
            && size_of_optional_header >= OPTIONAL_HEADER_FIXED_SIZE + (DIRECTORY_BASE_RELOCATION + 1) * 8
        {
            let dir = opt + OPTIONAL_HEADER_FIXED_SIZE + DIRECTORY_BASE_RELOCATION * 8;
            (
                read_u32(bytes, dir).ok_or(truncated)?,
                read_u32(bytes, dir + 4).ok_or(truncated)?,
            )
        } else {
            (0, 0)
        };

        let section_table_offset = opt + size_of_optional_header;
        let section_table_end = section_table_offset + number_of_sections * SECTION_HEADER_SIZE;
        if section_table_end > bytes.len() || section_table_end > size_of_headers as usize {
            return Err(truncated);
        }

        Ok(Self {
            machine,
            characteristics,
            number_of_sections,
            section_table_offset,
            optional_header_offset: opt,
            entry_point_rva,
            image_base,
            size_of_image,
            size_of_headers,
            reloc_rva,
            reloc_size,
        })
    }

    fn sections<'a>(&self, bytes: &'a [u8]) -> impl Iterator<Item = Section> + 'a {
        let table = self.section_table_offset;
        (0..self.number_of_sections).filter_map(move |index| {
            let header = table + index * SECTION_HEADER_SIZE;
            Some(Section {
                virtual_size: read_u32(bytes, header + 8)?,
                virtual_address: read_u32(bytes, header + 12)?,
                size_of_raw_data: read_u32(bytes, header + 16)?,
                pointer_to_raw_data: read_u32(bytes, header + 20)?,
            })
        })
    }
}

/// PE32+ image format.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeCoff;

impl ImageFormat for PeCoff {
    fn inspect(&self, raw: &[u8]) -> Result<ImageLayout> {
        let headers = PeHeaders::parse(raw)?;

        if headers.size_of_image == 0 {
            return Err(HvlError::InvalidImage("Image size is zero"));
        }
        if headers.size_of_headers > headers.size_of_image
            || headers.size_of_headers as usize > raw.len()
        {
            return Err(HvlError::InvalidImage("Header size out of range"));
        }
        if headers.entry_point_rva >= headers.size_of_image {
            return Err(HvlError::InvalidImage("Entry point outside image"));
        }

        debug!(
            "PE32+ {:?} image, {} sections",
            headers.machine, headers.number_of_sections
        );
        Ok(ImageLayout {
            image_size: headers.size_of_image as u64,
            entry_point_rva: headers.entry_point_rva as u64,
            preferred_base: headers.image_base,
        })
    }

    fn load(&self, raw: &[u8], region: &mut [u8]) -> Result {
        let headers = PeHeaders::parse(raw)?;
        if region.len() < headers.size_of_image as usize {
            return Err(HvlError::LoadFailed("Region smaller than image"));
        }

        region.fill(0);
        let header_len = headers.size_of_headers as usize;
        let source = raw
            .get(..header_len)
            .ok_or(HvlError::LoadFailed("Headers exceed file"))?;
        region[..header_len].copy_from_slice(source);

        for section in headers.sections(raw) {
            let mut len = section.size_of_raw_data as usize;
            if section.virtual_size != 0 {
                len = len.min(section.virtual_size as usize);
            }
            if len == 0 {
                continue;
            }

            let src_start = section.pointer_to_raw_data as usize;
            let dst_start = section.virtual_address as usize;
            let source = raw
                .get(src_start..src_start + len)
                .ok_or(HvlError::LoadFailed("Section data exceeds file"))?;
            let target = region
                .get_mut(dst_start..dst_start + len)
                .ok_or(HvlError::LoadFailed("Section exceeds image"))?;
            target.copy_from_slice(source);
            trace!("Section at rva {:#x}, {:#x} bytes", dst_start, len);
        }

        Ok(())
    }

    fn relocate(&self, region: &mut [u8], load_address: u64) -> Result {
        let headers = PeHeaders::parse(region)
            .map_err(|_| HvlError::RelocationFailed("Loaded headers are not valid"))?;
        let delta = load_address.wrapping_sub(headers.image_base);
        if delta == 0 {
            debug!("Image loaded at its preferred base");
            return Ok(());
        }

        if headers.reloc_size == 0 {
            if headers.characteristics & IMAGE_FILE_RELOCS_STRIPPED != 0 {
                return Err(HvlError::RelocationFailed("Image is not relocatable"));
            }
            return Ok(());
        }

        let dir_start = headers.reloc_rva as usize;
        let dir_end = dir_start
            .checked_add(headers.reloc_size as usize)
            .filter(|&end| end <= region.len())
            .ok_or(HvlError::RelocationFailed("Relocation directory exceeds image"))?;

        let mut block = dir_start;
        let mut fixups = 0usize;
        while block + RELOC_BLOCK_HEADER_SIZE <= dir_end {
            let page_rva = read_u32(region, block)
                .ok_or(HvlError::RelocationFailed("Truncated relocation block"))?
                as usize;
            let block_size = read_u32(region, block + 4)
                .ok_or(HvlError::RelocationFailed("Truncated relocation block"))?
                as usize;
            if block_size < RELOC_BLOCK_HEADER_SIZE || block + block_size > dir_end {
                return Err(HvlError::RelocationFailed("Malformed relocation block"));
            }

            let entries = (block_size - RELOC_BLOCK_HEADER_SIZE) / 2;
            for index in 0..entries {
                let entry = read_u16(region, block + RELOC_BLOCK_HEADER_SIZE + index * 2)
                    .ok_or(HvlError::RelocationFailed("Truncated relocation block"))?;
                match entry >> 12 {
                    IMAGE_REL_BASED_ABSOLUTE => {}
                    IMAGE_REL_BASED_DIR64 => {
                        let offset = page_rva + (entry & 0x0FFF) as usize;
                        let target = region
                            .get_mut(offset..offset + 8)
                            .ok_or(HvlError::RelocationFailed("Fixup outside image"))?;
                        let mut value = [0u8; 8];
                        value.copy_from_slice(target);
                        let value = u64::from_le_bytes(value).wrapping_add(delta);
                        target.copy_from_slice(&value.to_le_bytes());
                        fixups += 1;
                    }
                    _ => return Err(HvlError::RelocationFailed("Unsupported relocation type")),
                }
            }

            block += block_size;
        }

        // Record the real base in the loaded headers.
        let image_base_offset = headers.optional_header_offset + 24;
        region[image_base_offset..image_base_offset + 8].copy_from_slice(&load_address.to_le_bytes());

        debug!("Applied {} fixups, delta {:#x}", fixups, delta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    const PREFERRED_BASE: u64 = 0x1_4000_0000;
    const PE_OFFSET: usize = 0x80;
    const OPT: usize = PE_OFFSET + 4 + COFF_HEADER_SIZE;
    const OPT_SIZE: usize = OPTIONAL_HEADER_FIXED_SIZE + 16 * 8;
    const SECTIONS: usize = OPT + OPT_SIZE;
    const TEXT_RAW: usize = 0x200;
    const RELOC_RAW: usize = 0x400;

    fn put_u16(bytes: &mut [u8], offset: usize, value: u16) {
        bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
        bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(bytes: &mut [u8], offset: usize, value: u64) {
        bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn put_section(bytes: &mut [u8], index: usize, name: &[u8], va: u32, vsize: u32, raw: usize) {
        let header = SECTIONS + index * SECTION_HEADER_SIZE;
        bytes[header..header + name.len()].copy_from_slice(name);
        put_u32(bytes, header + 8, vsize);
        put_u32(bytes, header + 12, va);
        put_u32(bytes, header + 16, 0x200);
        put_u32(bytes, header + 20, raw as u32);
    }

    /// Two-section x86-64 image: `.text` holds one absolute pointer that a
    /// single DIR64 entry in `.reloc` fixes up.
    fn sample_image(reloc_type: u16) -> Vec<u8> {
        let mut image = vec![0u8; 0x600];
        put_u16(&mut image, 0, DOS_MAGIC);
        put_u32(&mut image, E_LFANEW_OFFSET, PE_OFFSET as u32);
        put_u32(&mut image, PE_OFFSET, PE_SIGNATURE);

        let coff = PE_OFFSET + 4;
        put_u16(&mut image, coff, Machine::X86_64 as u16);
        put_u16(&mut image, coff + 2, 2);
        put_u16(&mut image, coff + 16, OPT_SIZE as u16);
        put_u16(&mut image, coff + 18, 0x0022);

        put_u16(&mut image, OPT, OPTIONAL_HEADER_MAGIC_PE32PLUS);
        put_u32(&mut image, OPT + 16, 0x1000);
        put_u64(&mut image, OPT + 24, PREFERRED_BASE);
        put_u32(&mut image, OPT + 32, 0x1000);
        put_u32(&mut image, OPT + 36, 0x200);
        put_u32(&mut image, OPT + 56, 0x3000);
        put_u32(&mut image, OPT + 60, 0x200);
        put_u32(&mut image, OPT + 108, 16);
        let reloc_dir = OPT + OPTIONAL_HEADER_FIXED_SIZE + DIRECTORY_BASE_RELOCATION * 8;
        put_u32(&mut image, reloc_dir, 0x2000);
        put_u32(&mut image, reloc_dir + 4, 12);

        put_section(&mut image, 0, b".text", 0x1000, 0x100, TEXT_RAW);
        put_section(&mut image, 1, b".reloc", 0x2000, 12, RELOC_RAW);

        image[TEXT_RAW] = 0xC3;
        put_u64(&mut image, TEXT_RAW + 0x10, PREFERRED_BASE + 0x1020);

        put_u32(&mut image, RELOC_RAW, 0x1000);
        put_u32(&mut image, RELOC_RAW + 4, 12);
        put_u16(&mut image, RELOC_RAW + 8, (reloc_type << 12) | 0x010);
        put_u16(&mut image, RELOC_RAW + 10, 0);
        image
    }

    #[test]
    fn test_inspect_reports_layout() {
        let layout = PeCoff.inspect(&sample_image(IMAGE_REL_BASED_DIR64)).unwrap();
        assert_eq!(
            layout,
            ImageLayout {
                image_size: 0x3000,
                entry_point_rva: 0x1000,
                preferred_base: PREFERRED_BASE,
            }
        );
    }

    #[test]
    fn test_inspect_rejects_bad_headers() {
        let mut image = sample_image(IMAGE_REL_BASED_DIR64);
        image[0] = b'X';
        assert_eq!(
            PeCoff.inspect(&image),
            Err(HvlError::InvalidImage("Missing DOS signature"))
        );

        let mut image = sample_image(IMAGE_REL_BASED_DIR64);
        put_u16(&mut image, OPT, 0x010B);
        assert_eq!(PeCoff.inspect(&image), Err(HvlError::InvalidImage("Not a PE32+ image")));

        let mut image = sample_image(IMAGE_REL_BASED_DIR64);
        put_u16(&mut image, PE_OFFSET + 4, 0x014C);
        assert_eq!(
            PeCoff.inspect(&image),
            Err(HvlError::InvalidImage("Unsupported machine type"))
        );

        let mut image = sample_image(IMAGE_REL_BASED_DIR64);
        put_u32(&mut image, OPT + 16, 0x3000);
        assert_eq!(
            PeCoff.inspect(&image),
            Err(HvlError::InvalidImage("Entry point outside image"))
        );

        let image = sample_image(IMAGE_REL_BASED_DIR64);
        assert!(PeCoff.inspect(&image[..0x90]).is_err());
    }

    #[test]
    fn test_inspect_accepts_aarch64() {
        let mut image = sample_image(IMAGE_REL_BASED_DIR64);
        put_u16(&mut image, PE_OFFSET + 4, Machine::Aarch64 as u16);
        assert!(PeCoff.inspect(&image).is_ok());
    }

    #[test]
    fn test_load_and_relocate() {
        let raw = sample_image(IMAGE_REL_BASED_DIR64);
        let mut region = vec![0xFFu8; 0x3000];
        let load_address = 0x20_0000;

        PeCoff.load(&raw, &mut region).unwrap();
        assert_eq!(region[0x1000], 0xC3);
        assert!(region[0x1100..0x2000].iter().all(|&b| b == 0));

        PeCoff.relocate(&mut region, load_address).unwrap();
        assert_eq!(read_u64(&region, 0x1010), Some(load_address + 0x1020));
        assert_eq!(read_u64(&region, OPT + 24), Some(load_address));
    }

    #[test]
    fn test_relocate_at_preferred_base_is_noop() {
        let raw = sample_image(IMAGE_REL_BASED_DIR64);
        let mut region = vec![0u8; 0x3000];
        PeCoff.load(&raw, &mut region).unwrap();
        PeCoff.relocate(&mut region, PREFERRED_BASE).unwrap();
        assert_eq!(read_u64(&region, 0x1010), Some(PREFERRED_BASE + 0x1020));
    }

    #[test]
    fn test_unsupported_relocation_type_fails() {
        let raw = sample_image(3);
        let mut region = vec![0u8; 0x3000];
        PeCoff.load(&raw, &mut region).unwrap();
        assert_eq!(
            PeCoff.relocate(&mut region, 0x20_0000),
            Err(HvlError::RelocationFailed("Unsupported relocation type"))
        );
    }

    #[test]
    fn test_malformed_block_fails() {
        let mut raw = sample_image(IMAGE_REL_BASED_DIR64);
        put_u32(&mut raw, RELOC_RAW + 4, 4);
        let mut region = vec![0u8; 0x3000];
        PeCoff.load(&raw, &mut region).unwrap();
        assert_eq!(
            PeCoff.relocate(&mut region, 0x20_0000),
            Err(HvlError::RelocationFailed("Malformed relocation block"))
        );
    }

    #[test]
    fn test_truncated_section_data_fails_load() {
        let raw = sample_image(IMAGE_REL_BASED_DIR64);
        let mut region = vec![0u8; 0x3000];
        assert_eq!(
            PeCoff.load(&raw[..0x300], &mut region),
            Err(HvlError::LoadFailed("Section data exceeds file"))
        );
    }
}
