// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-script helpers shared by the kernel crates.

use std::env;

/// Exposes the CPU's M-profile architecture version and FPU capability.
/// Neither is available in rustc's standard cfg environment.
///
/// This sets `cfg(armv7m)` for the ARMv7-M family (including ARMv7E-M)
/// and additionally `cfg(fpu)` when the target ABI implies hardware
/// floating point, based on the `TARGET` environment variable.
///
/// Host targets (tests, tooling) get neither cfg, which routes the
/// kernel to its software model.
pub fn expose_m_profile() {
    println!("cargo:rustc-check-cfg=cfg(armv7m)");
    println!("cargo:rustc-check-cfg=cfg(fpu)");

    let target = env::var("TARGET").unwrap();

    if target.starts_with("thumbv7m") || target.starts_with("thumbv7em") {
        println!("cargo:rustc-cfg=armv7m");
        if target.ends_with("eabihf") {
            println!("cargo:rustc-cfg=fpu");
        }
    } else if target.starts_with("thumb") || target.starts_with("arm") {
        // Other ARM profiles lack the banked-stack and lazy-stacking
        // behavior this kernel is written against.
        println!("Don't know the target {}", target);
        std::process::exit(1);
    }
}
