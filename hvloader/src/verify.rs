//! Module verification
//!
//! The raw bytes go to the verified-boot capability before anything parses,
//! copies or relocates them. Success yields a [`VerifiedModule`], the only
//! input the image loader accepts.

use log::{debug, error, info};

use crate::capability::{CapabilityId, CapabilityRegistry};
use crate::error::{HvlError, Result};
use crate::fetch::ModuleBuffer;

/// Module bytes that passed verification.
///
/// Only [`verify_module`] constructs this.
#[derive(Debug, Clone, Copy)]
pub struct VerifiedModule<'a> {
    bytes: &'a [u8],
}

impl<'a> VerifiedModule<'a> {
    pub fn as_slice(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Verify `module` and extend the measurement log with its hash.
///
/// There is no fallback when the capability is missing and no retry on
/// rejection.
pub fn verify_module<'a>(
    registry: &dyn CapabilityRegistry,
    module: &'a ModuleBuffer,
) -> Result<VerifiedModule<'a>> {
    // The capability takes a 32-bit length.
    if u32::try_from(module.len()).is_err() {
        error!("Module of {} bytes exceeds the verifiable size", module.len());
        return Err(HvlError::InvalidParameter("Module too large to verify"));
    }

    let verifier = registry
        .locate_verifier(&CapabilityId::SHIM_LOCK)
        .inspect_err(|e| error!("{} capability unavailable: {}", CapabilityId::SHIM_LOCK.name, e))?;

    debug!("Verifying {} bytes", module.len());
    verifier.verify(module.as_slice()).map_err(|status| {
        error!("Module verification failed: {:?}", status);
        HvlError::VerificationFailed(status)
    })?;

    info!("Module verified");
    Ok(VerifiedModule {
        bytes: module.as_slice(),
    })
}

#[cfg(test)]
pub(crate) fn assume_verified(bytes: &[u8]) -> VerifiedModule<'_> {
    VerifiedModule { bytes }
}
