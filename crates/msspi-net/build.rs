//! Link setup for the `native` feature.
//!
//! `MSSPI_LIB_DIR` points at the directory holding the built msspi library.
//! Windows links `msspi` against SChannel (`crypt32`); Linux links
//! `msspi-capix`, which loads the CryptoPro CAPI at runtime (`dl`).

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=MSSPI_LIB_DIR");
    println!("cargo:rerun-if-changed=build.rs");

    if env::var_os("CARGO_FEATURE_NATIVE").is_none() {
        return;
    }

    if let Some(dir) = env::var_os("MSSPI_LIB_DIR") {
        println!(
            "cargo:rustc-link-search=native={}",
            PathBuf::from(dir).display()
        );
    }

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "windows" {
        println!("cargo:rustc-link-lib=crypt32");
    } else {
        println!("cargo:rustc-link-lib=dl");
        println!("cargo:rustc-link-lib=stdc++");
    }
}
