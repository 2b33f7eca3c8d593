//! Build script for swiftgem.
//!
//! Exposes the compiler's target triple to the crate at compile time so the
//! ABI key (engine, interpreter version, host triple) can be computed without
//! a runtime dependency on `uname`/`rustc -vV`.

fn main() {
    let target = std::env::var("TARGET").unwrap_or_else(|_| "unknown-unknown-unknown".to_string());
    println!("cargo:rustc-env=SWIFTGEM_TARGET={target}");
    println!("cargo:rustc-env=SWIFTGEM_VERSION={}", env!("CARGO_PKG_VERSION"));
}
