// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel failures where tooling can find them.
//!
//! The handlers themselves have no recoverable error path: they run in
//! handler mode, where the only failure surface is a hardware fault.
//! What this module provides is the landing pad for any Rust-side
//! `panic!` in kernel context, with a binary interface debuggers can
//! rely on:
//!
//! - `KERNEL_HAS_FAILED` is a `bool`, cleared at reset, set to one if
//!   the kernel reaches [`die`] (explicitly or through `panic!`). Any
//!   other value means memory was corrupted on the way down.
//!
//! - `KERNEL_EPITAPH` is a byte buffer holding as much of the failure
//!   reason (as UTF-8) as fits, padded with NULs.

use core::fmt::{Display, Write};
use core::sync::atomic::Ordering;

/// One-stop flag for tooling doing kernel triage.
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: this runs with interrupts at or below our own priority
    // masked by the exception model, and the flag ensures only one
    // execution ever proceeds past this point.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        // A recursive panic. Responding with another panic would only
        // make the record worse; park instead.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: the flag above admits exactly one winner.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Records `msg` in the epitaph buffer and parks the processor.
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = Epitaph { dest: buf };
    write!(writer, "{msg}").ok();

    loop {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

struct Epitaph {
    dest: &'static mut [u8],
}

impl Write for Epitaph {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
