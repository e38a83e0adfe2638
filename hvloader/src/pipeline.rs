//! Pipeline driver
//!
//! Resolves the module path, fetches, verifies, loads and enters the module,
//! in that order, stopping at the first failure. This is the only place
//! that decides what to release: the path and module buffers always go
//! when they fall out of scope, and the image pages go unless the module
//! accepted them.

use log::{debug, error, info, warn};

use crate::config::LoaderConfig;
use crate::error::Result;
use crate::fetch::{ModuleBuffer, fetch_module};
use crate::handoff::invoke_module;
use crate::image::{ImageFormat, load_image};
use crate::path::{ModulePath, PathFlags, resolve_module_path};
use crate::platform::Firmware;
use crate::verify::verify_module;

/// Pipeline progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    PathResolved,
    Fetched,
    Verified,
    Loaded,
    HandedOff,
    Failed,
    Done,
}

impl PipelineState {
    pub fn can_transition(self, next: PipelineState) -> bool {
        use PipelineState::*;

        match (self, next) {
            (Init, PathResolved)
            | (PathResolved, Fetched)
            | (Fetched, Verified)
            | (Verified, Loaded)
            | (Loaded, HandedOff)
            | (HandedOff, Done)
            | (Failed, Done) => true,
            (Failed | Done, Failed) => false,
            (_, Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == PipelineState::Done
    }
}

/// Records and logs state transitions.
#[derive(Debug)]
pub struct StateTracker {
    state: PipelineState,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Init,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Move to `next`. Transitions outside the pipeline graph are ignored
    /// and logged.
    pub fn advance(&mut self, next: PipelineState) {
        if self.state.can_transition(next) {
            debug!("Pipeline {:?} -> {:?}", self.state, next);
            self.state = next;
        } else {
            warn!("Ignoring pipeline transition {:?} -> {:?}", self.state, next);
        }
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the loader once.
///
/// `load_options` are the raw bytes of the loader's command line.
pub fn run<F: Firmware>(
    firmware: &F,
    format: &dyn ImageFormat,
    config: &LoaderConfig,
    load_options: &[u8],
) -> Result {
    let mut tracker = StateTracker::new();
    let result = drive(firmware, format, config, load_options, &mut tracker);

    if let Err(e) = &result {
        error!(
            "Loader failed in state {:?}: {} [{:?}]",
            tracker.state(),
            e,
            e.kind()
        );
        tracker.advance(PipelineState::Failed);
    }
    tracker.advance(PipelineState::Done);
    result
}

fn drive<F: Firmware>(
    firmware: &F,
    format: &dyn ImageFormat,
    config: &LoaderConfig,
    load_options: &[u8],
    tracker: &mut StateTracker,
) -> Result {
    let (path, flags) = resolve_module_path(load_options, config)?;
    tracker.advance(PipelineState::PathResolved);

    if flags.contains(PathFlags::TEST_RUN) {
        #[cfg(feature = "self_test")]
        {
            if let Err(e) = crate::selftest::run_self_test(firmware.capabilities()) {
                error!("Self-test failed: {}", e);
            }
            crate::selftest::hang();
        }
        #[cfg(not(feature = "self_test"))]
        warn!("Self-test support not built in, treating {} as a module path", path);
    }

    let module = fetch_with_retry(firmware, config, path, flags)?;
    tracker.advance(PipelineState::Fetched);

    let verified = verify_module(firmware.capabilities(), &module)?;
    tracker.advance(PipelineState::Verified);

    let mut image = load_image(firmware.pages(), format, config.image_memory_type, verified)?;
    tracker.advance(PipelineState::Loaded);

    invoke_module(firmware.entry_invoker(), &mut image)?;
    tracker.advance(PipelineState::HandedOff);

    let (address, pages) = image.allocation.transfer();
    info!("Module owns {} pages at {:#x}", pages, address);
    Ok(())
}

/// Fetch `path`, falling back once to the default path when the module is
/// missing and `path` was not already the default.
fn fetch_with_retry<F: Firmware>(
    firmware: &F,
    config: &LoaderConfig,
    path: ModulePath,
    flags: PathFlags,
) -> Result<ModuleBuffer> {
    let result = fetch_module(firmware, &path);
    match result {
        Err(e)
            if e.is_recoverable()
                && config.retry_default_on_not_found
                && !flags.contains(PathFlags::DEFAULT_PATH) =>
        {
            warn!(
                "Module {} not found, retrying with {}",
                path, config.default_module_path
            );
            drop(path);
            let default_path = ModulePath::new(config.default_module_path)?;
            fetch_module(firmware, &default_path)
        }
        other => other,
    }
}
