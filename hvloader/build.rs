//! HvLoader build script
//!
//! The default module path is baked in at compile time; rebuild when it
//! changes.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=HVL_DEFAULT_MODULE_PATH");

    if let Ok(path) = std::env::var("HVL_DEFAULT_MODULE_PATH") {
        if path.is_empty() {
            println!("cargo:warning=HVL_DEFAULT_MODULE_PATH is empty; every boot will fall back to a missing module");
        }
    }
}
