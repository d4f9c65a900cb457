// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent pieces of the kernel core.
//!
//! The exception handlers themselves are assembly, because they juggle
//! banked registers no compiler will surface. Every decision they make
//! that _can_ be expressed as a plain function lives here instead, so
//! it can run (and be tested) on the host: the frame layouts, the
//! switch-tail decision, the user service-call bounds rule, and the
//! construction of a never-run thread's initial frame.

// Allow std-y things to be used in test. Note that this attribute is a
// bit of a trap for the programmer, because rust-analyzer by default
// seems to build things with test set. This means it's easy to
// introduce code incompatible with no_std without your editor hassling
// you about it. Beware.
#![cfg_attr(not(test), no_std)]

use zerocopy::{FromBytes, Immutable, KnownLayout};

/// Registers the hardware stacks on every exception entry, FPU or not.
#[derive(Debug, FromBytes, Immutable, KnownLayout, Default)]
#[repr(C)]
pub struct BaseFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

/// Extended version stacked when the caller owns live FPU context.
#[derive(Debug, FromBytes, Immutable, KnownLayout, Default)]
#[repr(C)]
pub struct ExtendedFrame {
    pub base: BaseFrame,
    pub fpu_regs: [u32; 16],
    pub fpscr: u32,
    reserved: u32,
}

/// Words in a `BaseFrame`.
pub const BASE_FRAME_WORDS: usize = 8;

/// Callee-saved integer registers (r4..r11) the switch tail parks
/// below the hardware frame.
pub const CALLEE_CONTEXT_WORDS: usize = 8;

/// Additional callee-saved FPU registers (s16..s31) parked below those
/// for an extended frame.
pub const FPU_CONTEXT_WORDS: usize = 16;

const _: () =
    assert!(core::mem::size_of::<BaseFrame>() == BASE_FRAME_WORDS * 4);
const _: () = assert!(core::mem::size_of::<ExtendedFrame>() == 26 * 4);

/// Initial xPSR for a thread that has never run: just the Thumb bit.
pub const INITIAL_XPSR: u32 = 1 << 24;

/// What the switch tail will do for a given run-pair snapshot.
///
/// Handles are plain addresses here; zero stands for the null handle
/// left behind when the running thread is deleted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SwitchEffect {
    /// `current` keeps running and nothing is touched. This is the
    /// fast path out of every scheduling exception.
    Resume,
    /// Park the outgoing thread's context, then adopt the incoming
    /// one.
    SaveAndRestore,
    /// The outgoing thread is gone; adopt the incoming one without
    /// saving anything.
    RestoreOnly,
}

/// Decision function of the switch tail.
pub fn switch_effect(current: u32, next: u32) -> SwitchEffect {
    if current == next {
        SwitchEffect::Resume
    } else if current == 0 {
        SwitchEffect::RestoreOnly
    } else {
        SwitchEffect::SaveAndRestore
    }
}

/// Resolves a numbered service call against a user table whose word 0
/// holds the count of valid entries. Returns the word index of the
/// entry, or `None` for numbers outside `1..=count`, which the
/// dispatcher ignores.
pub fn user_svc_slot(count: u32, number: u32) -> Option<usize> {
    if number == 0 || number > count {
        None
    } else {
        Some(number as usize)
    }
}

/// Words in the full initial register image of a never-run thread:
/// zeroed r4..r11 beneath a basic hardware frame.
pub const INITIAL_IMAGE_WORDS: usize =
    CALLEE_CONTEXT_WORDS + BASE_FRAME_WORDS;

/// Lays down the initial register image for a thread that has never
/// run, at the top of `stack`, and returns the word index its control
/// block should record as the saved stack pointer.
///
/// The restore half of the switch tail unconditionally pops r4..r11
/// from the saved stack pointer before installing it, so the image is
/// a zeroed callee-saved block followed by a basic hardware frame.
/// Threads start with the FPU inactive, so the matching stack-frame
/// tag is [`StackFrame::BASIC`]. `entry` gets the Thumb bit forced on;
/// `return_hook` is what the thread returns to if it falls off the end
/// of its entry function.
///
/// Returns `None` if the stack cannot hold even one image.
///
/// [`StackFrame::BASIC`]: keel_abi::StackFrame::BASIC
pub fn seed_frame(
    stack: &mut [u32],
    entry: u32,
    arg: u32,
    return_hook: u32,
) -> Option<usize> {
    let top = stack.len().checked_sub(INITIAL_IMAGE_WORDS)?;

    // Zero the whole image first so a debugger walking a never-run
    // thread sees no stale garbage in the argument registers.
    let image = &mut stack[top..];
    image.fill(0);
    image[CALLEE_CONTEXT_WORDS] = arg;
    image[CALLEE_CONTEXT_WORDS + 5] = return_hook;
    image[CALLEE_CONTEXT_WORDS + 6] = entry | 1;
    image[CALLEE_CONTEXT_WORDS + 7] = INITIAL_XPSR;
    Some(top)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_when_pair_agrees() {
        assert_eq!(switch_effect(0x2000_0100, 0x2000_0100), SwitchEffect::Resume);
    }

    #[test]
    fn deleted_thread_skips_the_save() {
        assert_eq!(switch_effect(0, 0x2000_0200), SwitchEffect::RestoreOnly);
    }

    #[test]
    fn distinct_live_threads_save_and_restore() {
        assert_eq!(
            switch_effect(0x2000_0100, 0x2000_0200),
            SwitchEffect::SaveAndRestore,
        );
    }

    #[test]
    fn user_svc_bounds() {
        // Table with three entries: 1..=3 are valid, everything else
        // is ignored.
        assert_eq!(user_svc_slot(3, 1), Some(1));
        assert_eq!(user_svc_slot(3, 3), Some(3));
        assert_eq!(user_svc_slot(3, 4), None);
        assert_eq!(user_svc_slot(3, 5), None);
        assert_eq!(user_svc_slot(3, 0), None);
        assert_eq!(user_svc_slot(0, 1), None);
    }

    #[test]
    fn seeded_image_shape() {
        let mut stack = [0xaaaa_aaaau32; 64];
        let sp = seed_frame(&mut stack, 0x0800_1000, 17, 0x0800_2000)
            .expect("stack is plenty big");
        assert_eq!(sp, 64 - INITIAL_IMAGE_WORDS);

        let image = &stack[sp..];
        // Callee-saved block first, all zero.
        assert!(image[..CALLEE_CONTEXT_WORDS].iter().all(|&w| w == 0));
        // Then the hardware frame.
        let frame = &image[CALLEE_CONTEXT_WORDS..];
        assert_eq!(frame[0], 17); // r0 carries the argument
        assert_eq!(frame[1], 0); // nothing stale in the rest
        assert_eq!(frame[5], 0x0800_2000); // lr
        assert_eq!(frame[6], 0x0800_1001); // pc, Thumb bit forced
        assert_eq!(frame[7], INITIAL_XPSR);

        // Words below the image are untouched.
        assert!(stack[..sp].iter().all(|&w| w == 0xaaaa_aaaa));
    }

    #[test]
    fn seed_rejects_undersized_stack() {
        let mut stack = [0u32; INITIAL_IMAGE_WORDS - 1];
        assert_eq!(seed_frame(&mut stack, 0, 0, 0), None);
    }
}
