//! Module path resolution
//!
//! The module path is the first whitespace-delimited token of the loader's
//! load options (UCS-2, as handed over by the firmware), or the configured
//! default when the load options are empty.

use alloc::vec::Vec;
use core::ffi::c_void;
use core::fmt;

use bitflags::bitflags;
use log::debug;

use crate::config::LoaderConfig;
use crate::error::{HvlError, Result};

bitflags! {
    /// Facts recorded about how a path was resolved
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PathFlags: u32 {
        /// Path is the configured default
        const DEFAULT_PATH = 0x0000_0001;
        /// Token was the self-test token
        const TEST_RUN     = 0x8000_0000;
    }
}

const NUL: u16 = 0;

fn is_separator(c: u16) -> bool {
    matches!(c, 0x20 | 0x09 | 0x0D | 0x0A)
}

/// Owned, NUL-terminated UCS-2 path on the boot volume
#[derive(Clone, PartialEq, Eq)]
pub struct ModulePath {
    ucs2: Vec<u16>,
}

impl ModulePath {
    /// Copy `len` characters into a buffer sized for them plus a terminator.
    fn collect(len: usize, chars: impl Iterator<Item = u16>) -> Result<Self> {
        let mut ucs2 = Vec::new();
        ucs2.try_reserve_exact(len + 1)
            .map_err(|_| HvlError::OutOfResources("Failed to allocate module path"))?;
        ucs2.extend(chars.take(len));
        ucs2.push(NUL);
        Ok(Self { ucs2 })
    }

    pub fn new(path: &str) -> Result<Self> {
        Self::collect(path.encode_utf16().count(), path.encode_utf16())
    }

    pub fn from_ucs2(chars: &[u16]) -> Result<Self> {
        Self::collect(chars.len(), chars.iter().copied())
    }

    /// Characters including the terminator
    pub fn as_ucs2_with_nul(&self) -> &[u16] {
        &self.ucs2
    }

    /// Characters without the terminator
    pub fn as_ucs2(&self) -> &[u16] {
        &self.ucs2[..self.ucs2.len() - 1]
    }

    pub fn is_empty(&self) -> bool {
        self.ucs2.len() == 1
    }

    /// The terminated name to hand to the volume.
    ///
    /// Surrogate code units have no UCS-2 file name, so such a path is
    /// reported as not found like any other name missing from the volume.
    pub fn file_name(&self) -> Result<&[u16]> {
        if self.ucs2.iter().any(|c| (0xD800..=0xDFFF).contains(c)) {
            debug!("{} contains surrogate code units", self);
            return Err(HvlError::NotFound);
        }
        Ok(&self.ucs2)
    }

    pub fn matches(&self, other: &str) -> bool {
        self.as_ucs2().iter().copied().eq(other.encode_utf16())
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in char::decode_utf16(self.as_ucs2().iter().copied()) {
            write!(f, "{}", c.unwrap_or(char::REPLACEMENT_CHARACTER))?;
        }
        Ok(())
    }
}

impl fmt::Debug for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModulePath(\"{}\")", self)
    }
}

/// Characters of the command line, stopping at the first NUL.
fn command_line_chars(options: &[u8]) -> impl Iterator<Item = u16> + '_ {
    options
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&c| c != NUL)
}

/// Resolve the module path from the raw load-options bytes.
///
/// An odd trailing byte is ignored.
pub fn resolve_module_path(options: &[u8], config: &LoaderConfig) -> Result<(ModulePath, PathFlags)> {
    let mut flags = PathFlags::empty();

    if command_line_chars(options).next().is_none() {
        debug!("No load options, using default module path");
        let path = ModulePath::new(config.default_module_path)?;
        return Ok((path, PathFlags::DEFAULT_PATH));
    }

    let token_len = command_line_chars(options)
        .take_while(|&c| !is_separator(c))
        .count();

    let path = ModulePath::collect(token_len, command_line_chars(options))?;

    if path.matches(config.default_module_path) {
        flags |= PathFlags::DEFAULT_PATH;
    }
    if path.matches(config.self_test_token) {
        flags |= PathFlags::TEST_RUN;
    }

    debug!("Resolved module path {} ({:?})", path, flags);
    Ok((path, flags))
}

/// Borrow the load options reported by the firmware as bytes.
///
/// A null pointer is an empty command line when the size is zero and an
/// invalid argument otherwise.
///
/// # Safety
/// When non-null, `options` must point to `size_bytes` readable bytes that
/// outlive `'a`.
pub unsafe fn load_options_bytes<'a>(options: *const c_void, size_bytes: u32) -> Result<&'a [u8]> {
    if options.is_null() {
        if size_bytes != 0 {
            return Err(HvlError::InvalidParameter("Load options pointer is null"));
        }
        return Ok(&[]);
    }

    // SAFETY: the caller guarantees the buffer is readable for its length.
    Ok(unsafe { core::slice::from_raw_parts(options.cast::<u8>(), size_bytes as usize) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use proptest::prelude::*;

    fn encode(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
    }

    fn config() -> LoaderConfig {
        LoaderConfig::new().with_default_path("\\default.dll")
    }

    #[test]
    fn test_empty_command_line_uses_default() {
        let (path, flags) = resolve_module_path(&[], &config()).unwrap();
        assert!(path.matches("\\default.dll"));
        assert_eq!(flags, PathFlags::DEFAULT_PATH);
        assert_eq!(path.as_ucs2_with_nul().last(), Some(&0));
    }

    #[test]
    fn test_surrogate_path_has_no_file_name() {
        let path = ModulePath::from_ucs2(&[0x5C, 0xD800, 0x61]).unwrap();
        assert_eq!(path.file_name(), Err(HvlError::NotFound));
        assert!(HvlError::NotFound.is_recoverable());

        let path = ModulePath::new("\\hv.dll").unwrap();
        assert_eq!(path.file_name().unwrap(), path.as_ucs2_with_nul());
    }

    #[test]
    fn test_leading_nul_counts_as_empty() {
        let (path, flags) = resolve_module_path(&encode("\0\\other.dll"), &config()).unwrap();
        assert!(path.matches("\\default.dll"));
        assert!(flags.contains(PathFlags::DEFAULT_PATH));
    }

    #[test]
    fn test_first_token_is_path() {
        let (path, flags) =
            resolve_module_path(&encode("\\EFI\\hv.dll\tverbose extra"), &config()).unwrap();
        assert_eq!(path.to_string(), "\\EFI\\hv.dll");
        assert!(flags.is_empty());
        assert_eq!(path.as_ucs2_with_nul().len(), "\\EFI\\hv.dll".len() + 1);
    }

    #[test]
    fn test_token_stops_at_nul() {
        let (path, _) = resolve_module_path(&encode("\\a.dll\0 junk"), &config()).unwrap();
        assert_eq!(path.to_string(), "\\a.dll");
    }

    #[test]
    fn test_leading_separator_yields_empty_path() {
        let (path, flags) = resolve_module_path(&encode(" \\a.dll"), &config()).unwrap();
        assert!(path.is_empty());
        assert!(!flags.contains(PathFlags::DEFAULT_PATH));
    }

    #[test]
    fn test_odd_trailing_byte_ignored() {
        let mut bytes = encode("\\a.dll");
        bytes.push(b'x');
        let (path, _) = resolve_module_path(&bytes, &config()).unwrap();
        assert_eq!(path.to_string(), "\\a.dll");
    }

    #[test]
    fn test_explicit_default_and_test_tokens_are_flagged() {
        let (_, flags) = resolve_module_path(&encode("\\default.dll"), &config()).unwrap();
        assert_eq!(flags, PathFlags::DEFAULT_PATH);

        let (_, flags) = resolve_module_path(&encode("--Test more"), &config()).unwrap();
        assert_eq!(flags, PathFlags::TEST_RUN);
    }

    #[test]
    fn test_null_pointer_with_length_is_rejected() {
        let result = unsafe { load_options_bytes(core::ptr::null(), 8) };
        assert_eq!(
            result.unwrap_err(),
            HvlError::InvalidParameter("Load options pointer is null")
        );

        let empty = unsafe { load_options_bytes(core::ptr::null(), 0) }.unwrap();
        let (path, flags) = resolve_module_path(empty, &config()).unwrap();
        assert!(path.matches("\\default.dll"));
        assert!(flags.contains(PathFlags::DEFAULT_PATH));
    }

    #[test]
    fn test_raw_load_options() {
        let bytes = encode("\\raw.dll x");
        let options = unsafe { load_options_bytes(bytes.as_ptr().cast(), bytes.len() as u32) }.unwrap();
        let (path, _) = resolve_module_path(options, &config()).unwrap();
        assert_eq!(path.to_string(), "\\raw.dll");
    }

    proptest! {
        #[test]
        fn prop_path_is_prefix_up_to_first_separator(
            chars in proptest::collection::vec(
                prop_oneof![
                    Just(0x20u16), Just(0x09u16), Just(0x0Du16), Just(0x0Au16),
                    1u16..=0xFFFF,
                ],
                1..64,
            )
        ) {
            let bytes: Vec<u8> = chars.iter().flat_map(|c| c.to_le_bytes()).collect();
            let (path, _) = resolve_module_path(&bytes, &config()).unwrap();

            let expected: Vec<u16> = chars
                .iter()
                .copied()
                .take_while(|&c| !is_separator(c))
                .collect();
            prop_assert_eq!(path.as_ucs2(), &expected[..]);
        }
    }
}
