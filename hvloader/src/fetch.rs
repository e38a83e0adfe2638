//! Module fetch
//!
//! Reads the module file from the volume the loader was started from. File
//! metadata is obtained with the two-phase probe: a zero-sized query must
//! answer "buffer too small" with the required size, then the query is
//! repeated with a buffer of exactly that size.

use alloc::vec::Vec;

use log::{debug, error, info};

use crate::error::{HvlError, Result};
use crate::path::ModulePath;
use crate::platform::{BootVolume, Firmware, ModuleFile, QueryError, VolumeRoot};

/// Raw module bytes exactly as stored on the volume.
#[derive(Debug)]
pub struct ModuleBuffer {
    bytes: Vec<u8>,
}

impl ModuleBuffer {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[cfg(test)]
    pub(crate) fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

/// Query buffer with 8-byte alignment, exposing exactly `len` bytes.
pub(crate) struct AlignedBuffer {
    words: Vec<u64>,
    len: usize,
}

impl AlignedBuffer {
    pub(crate) fn new(len: usize) -> Result<Self> {
        let mut words = Vec::new();
        words
            .try_reserve_exact(len.div_ceil(8))
            .map_err(|_| HvlError::OutOfResources("Failed to allocate query buffer"))?;
        words.resize(len.div_ceil(8), 0);
        Ok(Self { words, len })
    }

    pub(crate) fn as_mut_bytes(&mut self) -> &mut [u8] {
        // SAFETY: the vector holds at least `len` initialised bytes.
        unsafe { core::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.len) }
    }
}

/// Read the file at `path` into a freshly allocated buffer.
///
/// An empty path is reported as not found. Root and file handles are closed
/// on every exit path.
pub fn fetch_module<F: Firmware>(firmware: &F, path: &ModulePath) -> Result<ModuleBuffer> {
    if path.is_empty() {
        debug!("Empty module path");
        return Err(HvlError::NotFound);
    }

    info!("Loading module {}", path);

    let mut volume = firmware.open_boot_volume().map_err(|e| match e {
        HvlError::NotFound => HvlError::FileSystemUnavailable(e.status()),
        other => other,
    })?;
    let mut root = volume.open_root()?;
    let mut file = root.open_read_only(path)?;

    let file_size = query_file_size(&mut file)?;
    let len = usize::try_from(file_size)
        .map_err(|_| HvlError::OutOfResources("Module file too large"))?;
    debug!("Module file is {} bytes", len);

    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(len)
        .map_err(|_| HvlError::OutOfResources("Failed to allocate module buffer"))?;
    bytes.resize(len, 0);

    let read = file.read(&mut bytes).map_err(|status| {
        error!("Failed to read {}: {:?}", path, status);
        HvlError::ReadFailed(status)
    })?;
    if read != len {
        error!("Short read of {}: {} of {} bytes", path, read, len);
        return Err(HvlError::ShortRead {
            expected: len,
            actual: read,
        });
    }

    Ok(ModuleBuffer { bytes })
}

fn query_file_size<T: ModuleFile>(file: &mut T) -> Result<u64> {
    let mut probe = AlignedBuffer::new(0)?;
    let required = match file.query_info(probe.as_mut_bytes()) {
        Err(QueryError::BufferTooSmall { required }) => required,
        Err(QueryError::Failed(status)) => {
            error!("File info size probe returned {:?}", status);
            return Err(HvlError::UnexpectedProbeStatus(status));
        }
        Ok(_) => {
            error!("File info size probe did not report a buffer size");
            return Err(HvlError::UnexpectedProbeStatus(uefi_raw::Status::SUCCESS));
        }
    };
    debug!("File info needs {} bytes", required);

    let mut info = AlignedBuffer::new(required)?;
    file.query_info(info.as_mut_bytes()).map_err(|e| {
        let status = match e {
            QueryError::BufferTooSmall { .. } => uefi_raw::Status::BUFFER_TOO_SMALL,
            QueryError::Failed(status) => status,
        };
        error!("Failed to get file info: {:?}", status);
        HvlError::FileInfoFailed(status)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_buffer_is_aligned_and_exact() {
        let mut info = AlignedBuffer::new(13).unwrap();
        let bytes = info.as_mut_bytes();
        assert_eq!(bytes.len(), 13);
        assert_eq!(bytes.as_ptr() as usize % 8, 0);
    }

    #[test]
    fn test_zero_sized_info_buffer() {
        let mut info = AlignedBuffer::new(0).unwrap();
        assert!(info.as_mut_bytes().is_empty());
    }
}
