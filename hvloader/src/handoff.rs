//! Control transfer to the loaded module

use log::{error, info, warn};

use crate::error::{HvlError, Result};
use crate::image::LoadedImage;
use crate::platform::EntryInvoker;

/// Enter the loaded module with its handoff record.
///
/// A failure status from the module is a pipeline failure; the caller's
/// [`PageAllocation`](crate::image::PageAllocation) is still owned and will
/// be released when dropped.
pub fn invoke_module(invoker: &dyn EntryInvoker, image: &mut LoadedImage<'_>) -> Result {
    let entry_point = image.info.entry_point;
    info!("Starting module at {:#x}", entry_point);

    // SAFETY: a `LoadedImage` only exists for verified, loaded and
    // relocated bytes, and the entry point lies inside its pages.
    let status = unsafe { invoker.invoke(entry_point, &mut image.info) };

    if status.is_error() {
        error!("Module entry point returned {:?}", status);
        return Err(HvlError::EntryPointFailed(status));
    }
    if status.is_warning() {
        warn!("Module entry point returned warning {:?}", status);
    }

    info!("Module returned success");
    Ok(())
}
