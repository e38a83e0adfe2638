//! HvLoader UEFI application
//!
//! Loads the hypervisor loader module named by the first command-line token
//! (or the built-in default), verifies it through the shim, and hands
//! control to it.

#![cfg_attr(target_os = "uefi", no_std)]
#![cfg_attr(target_os = "uefi", no_main)]

#[cfg(target_os = "uefi")]
#[uefi::entry]
fn main() -> uefi::Status {
    hvloader::efi::efi_main()
}

#[cfg(not(target_os = "uefi"))]
fn main() {
    eprintln!(
        "hvloader {} is a UEFI application; build it for x86_64-unknown-uefi or aarch64-unknown-uefi",
        hvloader::VERSION
    );
    std::process::exit(1);
}
