//! Simple File System access
//!
//! Each handle closes itself when dropped, so every exit path out of the
//! fetcher releases the root directory and the module file.

use log::{error, warn};
use uefi::boot::{self, ScopedProtocol};
use uefi::proto::media::file::{Directory, File, FileAttribute, FileInfo, FileMode, RegularFile};
use uefi::proto::media::fs::SimpleFileSystem;
use uefi::{CStr16, Handle, Status};

use crate::error::{HvlError, Result};
use crate::path::ModulePath;
use crate::platform::{BootVolume, ModuleFile, QueryError, VolumeRoot};

/// File system of the device the loader image was loaded from.
pub struct EfiBootVolume {
    fs: ScopedProtocol<SimpleFileSystem>,
}

impl EfiBootVolume {
    pub fn open(image_handle: Handle) -> Result<Self> {
        let fs = boot::get_image_file_system(image_handle).map_err(|e| {
            error!("No file system on the boot device: {:?}", e.status());
            HvlError::FileSystemUnavailable(e.status())
        })?;
        Ok(Self { fs })
    }
}

impl BootVolume for EfiBootVolume {
    type Root = EfiRoot;

    fn open_root(&mut self) -> Result<EfiRoot> {
        let dir = self.fs.open_volume().map_err(|e| {
            error!("Failed to open volume root: {:?}", e.status());
            HvlError::OpenFailed(e.status())
        })?;
        Ok(EfiRoot { dir })
    }
}

pub struct EfiRoot {
    dir: Directory,
}

impl VolumeRoot for EfiRoot {
    type File = EfiModuleFile;

    fn open_read_only(&mut self, path: &ModulePath) -> Result<EfiModuleFile> {
        let name = CStr16::from_u16_with_nul(path.file_name()?).map_err(|_| {
            warn!("{} is not a valid file name", path);
            HvlError::NotFound
        })?;

        let handle = self
            .dir
            .open(name, FileMode::Read, FileAttribute::READ_ONLY)
            .map_err(|e| match e.status() {
                Status::NOT_FOUND => HvlError::NotFound,
                status => {
                    error!("Failed to open {}: {:?}", path, status);
                    HvlError::OpenFailed(status)
                }
            })?;

        let file = handle.into_regular_file().ok_or_else(|| {
            error!("{} is a directory", path);
            HvlError::OpenFailed(Status::INVALID_PARAMETER)
        })?;
        Ok(EfiModuleFile { file })
    }
}

pub struct EfiModuleFile {
    file: RegularFile,
}

impl ModuleFile for EfiModuleFile {
    fn query_info(&mut self, buf: &mut [u8]) -> core::result::Result<u64, QueryError> {
        match self.file.get_info::<FileInfo>(buf) {
            Ok(info) => Ok(info.file_size()),
            Err(e) if e.status() == Status::BUFFER_TOO_SMALL => Err(QueryError::BufferTooSmall {
                required: e.data().unwrap_or(0),
            }),
            Err(e) => Err(QueryError::Failed(e.status())),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Status> {
        self.file.read(buf).map_err(|e| e.status())
    }
}
