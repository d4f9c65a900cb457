// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Binary contract between the kernel core and its collaborators.
//!
//! The context-switch and dispatch handlers in `keel-kern` address the
//! scheduler's data structures by symbol plus fixed offset, because
//! they run before any Rust code and cannot be handed references. This
//! crate is the single place those offsets and encodings are defined,
//! together with `repr(C)` mirrors of the records they index into, so
//! a layout change breaks the build instead of corrupting a thread.
//!
//! Nothing here is runtime code.

#![cfg_attr(not(test), no_std)]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Top 24 bits of every valid EXC_RETURN value. ORing a stack-frame
/// tag byte below this rebuilds the value the processor branched with
/// on exception entry.
pub const EXC_RETURN_BASE: u32 = 0xFFFF_FF00;

/// EXC_RETURN bit 4. Set means the hardware stacked a basic 8-word
/// frame; clear means the 26-word extended frame with FPU state.
pub const FRAME_FORM_BIT: u32 = 0x10;

/// EXC_RETURN bit 2. Set means the caller's frame went to the process
/// stack; clear means the main stack.
pub const RETURN_STACK_BIT: u32 = 0x04;

/// Address of the Floating-Point Context Control Register.
pub const FPCCR: u32 = 0xE000_EF34;

/// FPCCR bit 0: lazy FPU state preservation is pending. Must be
/// cleared before the stack it would target is reused.
pub const FPCCR_LSPACT: u32 = 1 << 0;

/// One-byte record of which exception-return form applies to a
/// suspended thread's saved stack image.
///
/// The low byte of EXC_RETURN is stored verbatim when the thread is
/// switched out, so the restore path can rebuild the full value with a
/// single ORN. While a thread is running this byte is stale; it means
/// something only when `Tcb::sp` does.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(transparent)]
pub struct StackFrame(pub u8);

impl StackFrame {
    /// Thread mode, process stack, basic frame. The form every thread
    /// starts with, and the only form on ports without an FPU.
    pub const BASIC: Self = Self(0xFD);

    /// Thread mode, process stack, extended frame.
    pub const EXTENDED: Self = Self(0xED);

    /// Captures the tag from a live EXC_RETURN value.
    pub const fn of_exc_return(exc_return: u32) -> Self {
        Self(exc_return as u8)
    }

    /// Rebuilds the EXC_RETURN value to leave the handler with.
    pub const fn exc_return(self) -> u32 {
        EXC_RETURN_BASE | self.0 as u32
    }

    /// True if the saved image at `Tcb::sp` includes FPU state.
    pub const fn is_extended(self) -> bool {
        self.0 as u32 & FRAME_FORM_BIT == 0
    }
}

/// The slice of a thread control block the kernel core touches.
///
/// Collaborators own the full record and everything in the reserved
/// regions; the core reads and writes exactly two fields, and only
/// while the thread in question is not running. The offsets are part
/// of the linked ABI, consumed directly by the handler assembly, and
/// pinned by the assertions below.
#[repr(C)]
pub struct Tcb {
    _sched_state: [u8; 34],
    /// Exception-return form of the image saved at `sp`.
    pub stack_frame: StackFrame,
    _wait_state: [u8; 21],
    /// Saved process stack pointer; top of the thread's register
    /// image. Meaningful only while the thread is switched out.
    pub sp: u32,
}

/// Byte offset of `Tcb::stack_frame`, as used by the handler assembly.
pub const TCB_SF_OFS: usize = 34;

/// Byte offset of `Tcb::sp`, as used by the handler assembly.
pub const TCB_SP_OFS: usize = 56;

const _: () = assert!(core::mem::offset_of!(Tcb, stack_frame) == TCB_SF_OFS);
const _: () = assert!(core::mem::offset_of!(Tcb, sp) == TCB_SP_OFS);

/// The running/elected thread pair at the heart of the scheduler
/// anchor. The switch tail reads both fields with one aligned LDRD so
/// it always observes a consistent snapshot.
#[repr(C)]
pub struct RunPair {
    /// Thread whose context is live on the process stack, or null if
    /// the previously running thread has been deleted.
    pub current: *mut Tcb,
    /// Thread the scheduling policy has elected to run next.
    pub next: *mut Tcb,
}

/// Process-wide scheduler anchor, linked as `os_rtx_info`. Only the
/// `run` pair belongs to the core; the leading words are policy state
/// the core never interprets.
#[repr(C)]
pub struct SchedulerInfo {
    _policy_state: [u32; 7],
    pub run: RunPair,
}

/// Byte offset of `SchedulerInfo::run`, as used by the handler
/// assembly.
pub const RUN_OFS: usize = 28;

// The run pair holds pointers, so its offsets are only meaningful on
// the target, where pointers are four bytes. Host builds (the test
// suite) skip these two checks; any cross build for the real machine
// enforces them.
#[cfg(target_pointer_width = "32")]
const _: () = assert!(core::mem::offset_of!(SchedulerInfo, run) == RUN_OFS);
#[cfg(target_pointer_width = "32")]
const _: () = assert!(core::mem::offset_of!(RunPair, next) == 4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_forms() {
        assert!(!StackFrame::BASIC.is_extended());
        assert!(StackFrame::EXTENDED.is_extended());
    }

    #[test]
    fn exc_return_rebuild() {
        assert_eq!(StackFrame::BASIC.exc_return(), 0xFFFF_FFFD);
        assert_eq!(StackFrame::EXTENDED.exc_return(), 0xFFFF_FFED);
    }

    #[test]
    fn tag_capture_keeps_low_byte_only() {
        let tag = StackFrame::of_exc_return(0xFFFF_FFED);
        assert_eq!(tag, StackFrame::EXTENDED);
        assert_eq!(tag.exc_return(), 0xFFFF_FFED);
    }
}
