//! Loader configuration
//!
//! Built once at startup and passed by reference through the pipeline.

use log::LevelFilter;
use uefi_raw::table::boot::MemoryType;

/// Default module path, overridable at build time.
pub const DEFAULT_MODULE_PATH: &str = match option_env!("HVL_DEFAULT_MODULE_PATH") {
    Some(path) => path,
    None => "\\lxhvloader.dll",
};

/// Command-line token that selects the diagnostic branch.
pub const SELF_TEST_TOKEN: &str = "--Test";

/// Loader configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Path tried when the command line names none, and after a miss
    pub default_module_path: &'static str,
    pub self_test_token: &'static str,
    /// Classification of the pages holding the loaded module
    pub image_memory_type: MemoryType,
    pub retry_default_on_not_found: bool,
    pub log_level: LevelFilter,
}

impl LoaderConfig {
    pub const fn new() -> Self {
        Self {
            default_module_path: DEFAULT_MODULE_PATH,
            self_test_token: SELF_TEST_TOKEN,
            image_memory_type: MemoryType::RUNTIME_SERVICES_CODE,
            retry_default_on_not_found: true,
            log_level: if cfg!(feature = "verbose_logging") {
                LevelFilter::Trace
            } else {
                LevelFilter::Info
            },
        }
    }

    /// Override the default module path
    pub const fn with_default_path(mut self, path: &'static str) -> Self {
        self.default_module_path = path;
        self
    }

    pub const fn with_image_memory_type(mut self, memory_type: MemoryType) -> Self {
        self.image_memory_type = memory_type;
        self
    }

    pub const fn without_default_retry(mut self) -> Self {
        self.retry_default_on_not_found = false;
        self
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoaderConfig::default();
        assert_eq!(config.self_test_token, "--Test");
        assert_eq!(config.image_memory_type, MemoryType::RUNTIME_SERVICES_CODE);
        assert!(config.retry_default_on_not_found);
        assert!(!config.default_module_path.is_empty());
    }

    #[test]
    fn test_builder_overrides() {
        let config = LoaderConfig::new()
            .with_default_path("\\EFI\\hv\\loader.dll")
            .with_image_memory_type(MemoryType::LOADER_CODE)
            .without_default_retry();
        assert_eq!(config.default_module_path, "\\EFI\\hv\\loader.dll");
        assert_eq!(config.image_memory_type, MemoryType::LOADER_CODE);
        assert!(!config.retry_default_on_not_found);
    }
}
