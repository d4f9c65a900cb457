// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exception-level support for ARMv7E-M (Cortex-M4, optional FPv4-SP).
//!
//! # The three ISRs
//!
//! Everything kernel-shaped in this system enters through exactly
//! three vectors, all defined here:
//!
//! - `svc_handler` implements the `SVC` instruction. Number 0 is the
//!   kernel service call: the stacked r0-r3 are arguments, the stacked
//!   r12 is the service function, and the call is followed by a full
//!   context-switch opportunity (most services block). Numbers above 0
//!   index a user-supplied table and return without rescheduling.
//! - `pend_sv_handler` performs context switches deferred from
//!   interrupt handlers. An ISR that wants a switch pokes the PENDSV
//!   bit (see [`pend_context_switch`]); the switch then runs after the
//!   ISR, and anything tail-chained above it, has unwound. For that to
//!   hold, PendSV must sit at the lowest exception priority, which
//!   [`initialize_exceptions`] establishes.
//! - `systick_handler` delivers the periodic tick to the scheduling
//!   policy and falls into the same switch tail, since a tick commonly
//!   expires a delay and elects a new thread.
//!
//! All three funnel into one assembly tail, `switch_context`. The
//! scheduler proper never runs here: policy lives behind the imported
//! hooks below, and the only scheduler state this module touches is
//! the running/elected thread pair it is handed.
//!
//! # The run pair
//!
//! A process-wide anchor record, linked as `os_rtx_info` (the layout
//! contract is `keel_abi::SchedulerInfo`), carries two adjacent
//! fields: the thread whose context is live on the PSP, and the thread
//! the policy wants next. The tail reads both with one LDRD, so it
//! always sees a consistent snapshot. If they agree, the exception
//! returns untouched; that fast path is a handful of instructions and
//! is what every tick costs when nothing new is runnable. The tail's
//! only write to the pair is publishing `current = next`.
//!
//! A null `current` means the running thread was deleted out from
//! under us. There is nothing to save, but if the dead thread's frame
//! was the extended (FPU) form, the processor may still owe its stack
//! a lazy floating-point state push. FPCCR.LSPACT gets cleared before
//! the switch so the hardware cannot later write into freed memory.
//!
//! # Saved context
//!
//! On exception entry the hardware stacks r0-r3, r12, lr, pc, and
//! xPSR (plus s0-s15 and FPSCR when FPU context is live). The tail
//! parks the rest below that image on the outgoing thread's stack:
//! r4-r11, then s16-s31 for extended frames. The resulting stack
//! pointer lands in the thread's control block at a fixed offset,
//! along with the low byte of EXC_RETURN so the restore path knows
//! which frame form it is unwinding. Both offsets are pinned by
//! assertions in `keel-abi`.
//!
//! # Imported symbols
//!
//! - `os_rtx_info`: the scheduler anchor described above.
//! - `os_rtx_user_svc`: user service table; word 0 is the entry count.
//! - `os_pend_sv_handler`, `os_tick_handler`: policy hooks, called
//!   with no arguments from handler mode; they communicate back by
//!   updating the run pair.
//! - `thread_switch_helper`: advisory hook called once per actual
//!   switch, between the save and the publish. It may clobber scratch
//!   registers, so the tail re-fetches the run pair after it returns.

use core::arch::global_asm;
use core::ptr::NonNull;

#[cfg(fpu)]
use keel_abi::{FPCCR, FPCCR_LSPACT, FRAME_FORM_BIT};
use keel_abi::{
    SchedulerInfo, Tcb, EXC_RETURN_BASE, RETURN_STACK_BIT, RUN_OFS,
    TCB_SF_OFS, TCB_SP_OFS,
};
use keel_kerncore::{user_svc_slot, BaseFrame};

extern "C" {
    /// Scheduler anchor; the handlers address its run pair at
    /// `RUN_OFS`, Rust code goes through [`running_thread`].
    static mut os_rtx_info: SchedulerInfo;

    /// First word of the user service table: the count of valid
    /// entries. Entry addresses follow it in memory.
    static os_rtx_user_svc: u32;
}

/// One-byte anchor for the archive. Startup code takes this symbol's
/// address so the linker cannot discard the kernel library, and with
/// it the vector-table handlers, as unreferenced.
#[allow(non_upper_case_globals)]
#[used]
#[no_mangle]
#[link_section = ".rodata.irq_keel_lib"]
pub static irq_keel_lib: u8 = 0;

// Supervisor call entry. The caller's frame may be on either stack:
// the kernel-start path issues SVC 0 from privileged thread mode on
// the MSP, everything afterward arrives on the PSP. EXC_RETURN bit 2
// tells them apart.
global_asm! {"
    .section .text.svc_handler
    .globl svc_handler
    .type svc_handler,function
    svc_handler:
        tst lr, #{ret_stack}
        ite eq
        mrseq r12, MSP
        mrsne r12, PSP

        @ The service number is the immediate baked into the SVC
        @ instruction, two bytes below the saved return address.
        ldr r0, [r12, #{pc}]
        ldrb r0, [r0, #-2]
        cbnz r0, 2f

        @ Service call 0: the stacked r0-r3 are the arguments and the
        @ stacked r12 is the service function. Call it, then deposit
        @ its r0/r1 into the frame for the caller to observe on
        @ exception return. lr is free as a load base once saved.
        push {{r12, lr}}
        mov lr, r12
        ldm lr, {{r0-r3, r12}}
        blx r12
        pop {{r12, lr}}
        stm r12, {{r0, r1}}
        b switch_context

    2:  @ Numbered services dispatch through the user table and return
        @ to the caller without rescheduling. r4 rides along to keep
        @ the stack 8-byte aligned across the call.
        push {{r4, lr}}
        mov r1, r0
        mov r0, r12
        bl svc_user_entry
        pop {{r4, lr}}
        bx lr
    ",
    pc = const core::mem::offset_of!(BaseFrame, pc),
    ret_stack = const RETURN_STACK_BIT,
}

// The context-switch tail shared by all three handlers, entered with
// r12 holding the caller's frame pointer (its PSP value at exception
// entry) and lr holding the caller's EXC_RETURN.
//
// The macro parameters splice in the optional PRIMASK fence around
// the publish+restore window; the hard-float and soft-float bodies
// are spelled out separately because the soft-float one must contain
// no FPU instructions at all.

#[cfg(fpu)]
macro_rules! switch_context_asm {
    ($lock:literal, $unlock:literal) => {
        global_asm! {"
            .section .text.switch_context
            .globl switch_context
            .type switch_context,function
            switch_context:
                @ One LDRD, one consistent snapshot: r1 = current,
                @ r2 = next.
                movw r3, #:lower16:os_rtx_info
                movt r3, #:upper16:os_rtx_info
                ldrd r1, r2, [r3, #{run}]
                cmp r1, r2
                beq 9f

                @ Null current: the running thread was deleted, skip
                @ the save.
                cbz r1, 4f

                stmdb r12!, {{r4-r11}}
                @ Extended frame (EXC_RETURN bit 4 clear): park
                @ s16-s31 below the integer context.
                tst lr, #{frame_bit}
                it eq
                vstmdbeq r12!, {{s16-s31}}
                str r12, [r1, #{sp}]
                strb lr, [r1, #{sf}]
                b 5f

            4:  @ The dead thread stacked an extended frame: the FPU
                @ may still owe its stack a lazy state push. Clear
                @ FPCCR.LSPACT so the hardware cannot write into
                @ memory that is no longer a stack.
                tst lr, #{frame_bit}
                bne 5f
                movw r1, #{fpccr_lo}
                movt r1, #{fpccr_hi}
                ldr r0, [r1]
                bic r0, r0, #{lspact}
                str r0, [r1]

            5:
            ",
            $lock,
            "
                @ Advisory hook, then publish the election. The hook
                @ may clobber scratch registers and may move the pair,
                @ so re-read it rather than trusting anything we still
                @ hold.
                bl thread_switch_helper
                movw r3, #:lower16:os_rtx_info
                movt r3, #:upper16:os_rtx_info
                ldrd r1, r2, [r3, #{run}]
                str r2, [r3, #{run}]

                @ Adopt the incoming thread: rebuild its EXC_RETURN
                @ from the stack-frame byte, unwind its parked
                @ context, install its stack pointer.
                ldrb r1, [r2, #{sf}]
                ldr r0, [r2, #{sp}]
                orn lr, r1, #{excret_inv}
                tst lr, #{frame_bit}
                it eq
                vldmiaeq r0!, {{s16-s31}}
                ldmia r0!, {{r4-r11}}
                msr PSP, r0
            ",
            $unlock,
            "
            9:
                bx lr
            ",
            run = const RUN_OFS,
            sp = const TCB_SP_OFS,
            sf = const TCB_SF_OFS,
            frame_bit = const FRAME_FORM_BIT,
            fpccr_lo = const (FPCCR & 0xFFFF),
            fpccr_hi = const (FPCCR >> 16),
            lspact = const FPCCR_LSPACT,
            excret_inv = const !EXC_RETURN_BASE,
        }
    };
}

#[cfg(not(fpu))]
macro_rules! switch_context_asm {
    ($lock:literal, $unlock:literal) => {
        global_asm! {"
            .section .text.switch_context
            .globl switch_context
            .type switch_context,function
            switch_context:
                @ One LDRD, one consistent snapshot: r1 = current,
                @ r2 = next.
                movw r3, #:lower16:os_rtx_info
                movt r3, #:upper16:os_rtx_info
                ldrd r1, r2, [r3, #{run}]
                cmp r1, r2
                beq 9f

                @ Null current: the running thread was deleted, skip
                @ the save. Without an FPU every frame is basic, so
                @ there is no lazy state to cancel either.
                cbz r1, 5f

                stmdb r12!, {{r4-r11}}
                str r12, [r1, #{sp}]
                strb lr, [r1, #{sf}]

            5:
            ",
            $lock,
            "
                @ Advisory hook, then publish the election. The hook
                @ may clobber scratch registers and may move the pair,
                @ so re-read it rather than trusting anything we still
                @ hold.
                bl thread_switch_helper
                movw r3, #:lower16:os_rtx_info
                movt r3, #:upper16:os_rtx_info
                ldrd r1, r2, [r3, #{run}]
                str r2, [r3, #{run}]

                @ Adopt the incoming thread: rebuild its EXC_RETURN
                @ from the stack-frame byte, unwind its parked
                @ context, install its stack pointer.
                ldrb r1, [r2, #{sf}]
                ldr r0, [r2, #{sp}]
                orn lr, r1, #{excret_inv}
                ldmia r0!, {{r4-r11}}
                msr PSP, r0
            ",
            $unlock,
            "
            9:
                bx lr
            ",
            run = const RUN_OFS,
            sp = const TCB_SP_OFS,
            sf = const TCB_SF_OFS,
            excret_inv = const !EXC_RETURN_BASE,
        }
    };
}

#[cfg(feature = "irq-masking")]
switch_context_asm!("cpsid i", "cpsie i");
#[cfg(not(feature = "irq-masking"))]
switch_context_asm!("", "");

// Deferred-switch and tick trampolines. Each calls its policy hook
// with the AAPCS-mandated 8-byte stack alignment (hence r4 in the
// push), then enters the tail with the caller's PSP in r12.
global_asm! {"
    .section .text.pend_sv_handler
    .globl pend_sv_handler
    .type pend_sv_handler,function
    pend_sv_handler:
        push {{r4, lr}}
        bl os_pend_sv_handler
        pop {{r4, lr}}
        mrs r12, PSP
        b switch_context

    .section .text.systick_handler
    .globl systick_handler
    .type systick_handler,function
    systick_handler:
        push {{r4, lr}}
        bl os_tick_handler
        pop {{r4, lr}}
        mrs r12, PSP
        b switch_context
    ",
}

/// Rust half of the numbered service-call path, reached from
/// `svc_handler` with a pointer to the caller's stacked frame and the
/// service number from the instruction.
///
/// Out-of-range numbers return with the frame, and therefore every
/// caller register, untouched.
///
/// # Safety
///
/// Not for calling from Rust. The assembly entry sequence guarantees
/// `frame` points at a live exception frame and `number` is nonzero.
#[no_mangle]
unsafe extern "C" fn svc_user_entry(frame: *mut BaseFrame, number: u32) {
    let table = core::ptr::addr_of!(os_rtx_user_svc);

    // Safety: the symbol resolves to the table's count word.
    let count = unsafe { table.read() };
    let Some(slot) = user_svc_slot(count, number) else {
        return;
    };

    // Safety: slot is within the bounds the table's owner published,
    // and entries past word 0 are service functions by contract.
    let service: extern "C" fn(u32, u32, u32, u32) -> u32 =
        unsafe { core::mem::transmute(table.add(slot).read()) };

    // Safety: our caller vouches for the frame pointer, and the frame
    // stays put for the whole handler invocation.
    let frame = unsafe { &mut *frame };
    frame.r0 = service(frame.r0, frame.r1, frame.r2, frame.r3);
}

/// Establishes the exception environment the handlers rely on: SVCall,
/// PendSV, and SysTick all at the lowest configurable priority, so
/// kernel entry never preempts an interrupt handler or a policy
/// critical section, and the tick timer programmed and counting.
///
/// # Safety
///
/// Call once from privileged mode during bring-up, before the first
/// service call. `tick_divisor` is core clocks per kernel tick.
pub unsafe fn initialize_exceptions(tick_divisor: u32) {
    // Safety: this purely lowers priorities from their reset defaults,
    // so it can't cause surprise preemption; the register writes are
    // `unsafe` in the `cortex_m` crate's API.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // SHPR bytes are indexed from exception 4: SVCall (11) is
        // byte 7, PendSV (14) is byte 10, SysTick (15) is byte 11.
        scb.shpr[7].write(0xFF);
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);
    }

    // Safety: as above, safe in practice but unsafe in API.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        syst.rvr.write(tick_divisor - 1);
        syst.cvr.write(0);
        // Counter on, interrupt on, core clock source.
        syst.csr.modify(|v| v | 0b111);
    }
}

/// Requests a deferred context switch from interrupt context.
///
/// The switch runs when PendSV tail-chains in after the current ISR,
/// and everything nested above it, unwinds; until then the interrupted
/// thread's state stays wherever the hardware put it.
pub fn pend_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Reads the scheduler anchor's notion of the running thread. `None`
/// means the previously running thread has been deleted and no switch
/// has happened yet.
pub fn running_thread() -> Option<NonNull<Tcb>> {
    // The slot is written from handler mode; a thread-mode reader can
    // race a context switch, so take a volatile snapshot instead of
    // pretending we can hold a reference.
    let p = unsafe {
        core::ptr::addr_of!((*core::ptr::addr_of!(os_rtx_info)).run.current)
            .read_volatile()
    };
    NonNull::new(p)
}
