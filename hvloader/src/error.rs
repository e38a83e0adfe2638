//! Loader error handling
//!
//! Every stage returns its outcome explicitly as a [`HvlError`]; the
//! pipeline driver is the only place that turns one into a firmware status
//! and decides what to release.

use core::fmt;

use uefi_raw::Status;

/// Loader error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvlError {
    /// A required input was missing or malformed
    InvalidParameter(&'static str),

    /// A pool or page allocation could not be satisfied
    OutOfResources(&'static str),

    /// Module file does not exist on the boot volume
    NotFound,

    /// File-system errors
    FileSystemUnavailable(Status),
    OpenFailed(Status),
    FileInfoFailed(Status),
    UnexpectedProbeStatus(Status),
    ReadFailed(Status),
    ShortRead { expected: usize, actual: usize },

    /// Capability lookup failed
    CapabilityNotFound(&'static str),
    CapabilityMalformed(&'static str),

    /// Verified-boot capability rejected the module
    VerificationFailed(Status),

    /// Container format errors
    InvalidImage(&'static str),
    LoadFailed(&'static str),
    RelocationFailed(&'static str),

    /// Page allocator refused the persistent allocation
    PageAllocationFailed(Status),

    /// The launched module returned a failure status
    EntryPointFailed(Status),

    /// Any other firmware failure
    Firmware(Status),
}

/// Error classification used for logging and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    ResourceExhaustion,
    NotFound,
    VerificationFailure,
    FormatError,
    DownstreamFailure,
    Firmware,
}

impl HvlError {
    /// Status handed back to the firmware when the loader exits
    pub fn status(&self) -> Status {
        match self {
            HvlError::InvalidParameter(_) => Status::INVALID_PARAMETER,
            HvlError::OutOfResources(_) => Status::OUT_OF_RESOURCES,
            HvlError::NotFound => Status::NOT_FOUND,
            HvlError::FileSystemUnavailable(status)
            | HvlError::OpenFailed(status)
            | HvlError::FileInfoFailed(status)
            | HvlError::UnexpectedProbeStatus(status)
            | HvlError::ReadFailed(status)
            | HvlError::VerificationFailed(status)
            | HvlError::PageAllocationFailed(status)
            | HvlError::EntryPointFailed(status)
            | HvlError::Firmware(status) => *status,
            HvlError::ShortRead { .. } => Status::END_OF_FILE,
            HvlError::CapabilityNotFound(_) => Status::NOT_FOUND,
            HvlError::CapabilityMalformed(_) => Status::PROTOCOL_ERROR,
            HvlError::InvalidImage(_) => Status::LOAD_ERROR,
            HvlError::LoadFailed(_) => Status::LOAD_ERROR,
            HvlError::RelocationFailed(_) => Status::LOAD_ERROR,
        }
    }

    /// Get a human-readable description of the error
    pub fn description(&self) -> &'static str {
        match self {
            HvlError::InvalidParameter(msg) => msg,
            HvlError::OutOfResources(msg) => msg,
            HvlError::NotFound => "Module file not found",
            HvlError::FileSystemUnavailable(_) => "Boot volume has no file system",
            HvlError::OpenFailed(_) => "Failed to open module file",
            HvlError::FileInfoFailed(_) => "Failed to get module file information",
            HvlError::UnexpectedProbeStatus(_) => "Unexpected status from size probe",
            HvlError::ReadFailed(_) => "Failed to read module file",
            HvlError::ShortRead { .. } => "Module file read returned fewer bytes than requested",
            HvlError::CapabilityNotFound(name) => name,
            HvlError::CapabilityMalformed(name) => name,
            HvlError::VerificationFailed(_) => "Module verification failed",
            HvlError::InvalidImage(msg) => msg,
            HvlError::LoadFailed(msg) => msg,
            HvlError::RelocationFailed(msg) => msg,
            HvlError::PageAllocationFailed(_) => "Failed to allocate image pages",
            HvlError::EntryPointFailed(_) => "Module entry point returned failure",
            HvlError::Firmware(_) => "Firmware error",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HvlError::InvalidParameter(_) => ErrorKind::InvalidArgument,
            HvlError::OutOfResources(_) | HvlError::PageAllocationFailed(_) => {
                ErrorKind::ResourceExhaustion
            }
            HvlError::NotFound => ErrorKind::NotFound,
            HvlError::VerificationFailed(_) => ErrorKind::VerificationFailure,
            HvlError::InvalidImage(_) | HvlError::LoadFailed(_) | HvlError::RelocationFailed(_) => {
                ErrorKind::FormatError
            }
            HvlError::EntryPointFailed(_) => ErrorKind::DownstreamFailure,
            HvlError::FileSystemUnavailable(_)
            | HvlError::OpenFailed(_)
            | HvlError::FileInfoFailed(_)
            | HvlError::UnexpectedProbeStatus(_)
            | HvlError::ReadFailed(_)
            | HvlError::ShortRead { .. }
            | HvlError::CapabilityNotFound(_)
            | HvlError::CapabilityMalformed(_)
            | HvlError::Firmware(_) => ErrorKind::Firmware,
        }
    }

    /// Only a missing module file can be retried (against the default path)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, HvlError::NotFound)
    }
}

impl fmt::Display for HvlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HvlError::ShortRead { expected, actual } => write!(
                f,
                "{} ({} of {} bytes, status {:?})",
                self.description(),
                actual,
                expected,
                self.status()
            ),
            _ => write!(f, "{} (status {:?})", self.description(), self.status()),
        }
    }
}

/// Result type used throughout the loader
pub type Result<T = ()> = core::result::Result<T, HvlError>;

/// Convert UEFI errors to loader errors
#[cfg(target_os = "uefi")]
impl<Data: fmt::Debug> From<uefi::Error<Data>> for HvlError {
    fn from(error: uefi::Error<Data>) -> Self {
        match error.status() {
            uefi::Status::NOT_FOUND => HvlError::NotFound,
            uefi::Status::OUT_OF_RESOURCES => HvlError::OutOfResources("Firmware out of resources"),
            status => HvlError::Firmware(status),
        }
    }
}
