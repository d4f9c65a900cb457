// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture dispatch.
//!
//! On a v7-M target (the build script turns the target triple into
//! `cfg(armv7m)`) this resolves to the real handlers; on a host, where
//! the test suite runs, it resolves to a software model of the same
//! machinery. Other ARM profiles have different banked-stack and
//! lazy-stacking behavior and are rejected outright. Either way the
//! contents are re-exported here so the rest of the crate and its
//! tests name one module.

cfg_if::cfg_if! {
    if #[cfg(armv7m)] {
        pub mod arm_m;
        pub use arm_m::*;
    } else if #[cfg(target_arch = "arm")] {
        compile_error!("missing handler support for this ARM profile");
    } else {
        pub mod fake;
        pub use fake::*;
    }
}
