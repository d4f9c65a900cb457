// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software model of the switch tail, for builds that are not
//! targeting the real processor.
//!
//! The assembly in `arm_m` can only be validated on hardware or an
//! instruction-set simulator. This module mirrors it step for step
//! over plain data: a register file, per-thread stacks, the run pair,
//! and a modeled lazy-stacking flag, with the same decision function
//! ([`keel_kerncore::switch_effect`]) and the same save/restore
//! layout. The host test suite drives scheduling scenarios through it
//! to pin the behavior the assembly is written against.

use keel_abi::StackFrame;
use keel_kerncore::{
    switch_effect, SwitchEffect, CALLEE_CONTEXT_WORDS, FPU_CONTEXT_WORDS,
};

/// Callee-saved context the switch tail is responsible for: r4..r11,
/// plus s16..s31 for threads with live FPU state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CalleeContext {
    pub r: [u32; 8],
    pub s_hi: [u32; 16],
}

/// Live processor state the tail manipulates.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Cpu {
    pub ctx: CalleeContext,
    /// Frame form the running thread's exception entry stacked, i.e.
    /// the tag carried in by EXC_RETURN.
    pub frame: StackFrame,
    /// Modeled PSP: (thread handle, word index into its stack).
    pub psp: (usize, usize),
    /// Modeled FPCCR.LSPACT.
    pub lspact: bool,
}

/// Modeled thread: a stack plus the two control-block fields the tail
/// maintains.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Thread {
    pub stack: Vec<u32>,
    /// Saved stack pointer, as a word index. Meaningful only while
    /// the thread is switched out.
    pub sp: usize,
    pub stack_frame: StackFrame,
}

/// Modeled scheduler anchor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RunPair {
    pub current: Option<usize>,
    pub next: usize,
}

fn handle(t: Option<usize>) -> u32 {
    // Real handles are addresses and zero is the null handle; the
    // model only needs them nonzero and distinct.
    t.map(|i| i as u32 + 1).unwrap_or(0)
}

/// Runs the switch tail once: decide, save, run the advisory hook,
/// publish, restore. Returns the decision so tests can assert on it.
///
/// `helper` stands in for the linked `thread_switch_helper`; it sees
/// the run pair before the publish, and any update it makes is
/// honored, matching the tail's re-fetch after the real call.
pub fn switch(
    run: &mut RunPair,
    threads: &mut [Thread],
    cpu: &mut Cpu,
    helper: impl FnOnce(&mut RunPair),
) -> SwitchEffect {
    let effect = switch_effect(handle(run.current), handle(Some(run.next)));
    match effect {
        SwitchEffect::Resume => return effect,
        SwitchEffect::SaveAndRestore => {
            let current = run.current.unwrap();
            assert_eq!(cpu.psp.0, current, "PSP is not the outgoing thread's");

            let t = &mut threads[current];
            let mut sp = cpu.psp.1 - CALLEE_CONTEXT_WORDS;
            t.stack[sp..sp + CALLEE_CONTEXT_WORDS].copy_from_slice(&cpu.ctx.r);
            if cpu.frame.is_extended() {
                sp -= FPU_CONTEXT_WORDS;
                t.stack[sp..sp + FPU_CONTEXT_WORDS]
                    .copy_from_slice(&cpu.ctx.s_hi);
            }
            t.sp = sp;
            t.stack_frame = cpu.frame;
        }
        SwitchEffect::RestoreOnly => {
            // The deleted thread's stack may still owe the FPU a lazy
            // state push; cancel it before the memory is reused.
            if cpu.frame.is_extended() {
                cpu.lspact = false;
            }
        }
    }

    helper(run);
    run.current = Some(run.next);

    let t = &threads[run.next];
    let mut sp = t.sp;
    cpu.frame = t.stack_frame;
    if t.stack_frame.is_extended() {
        cpu.ctx.s_hi.copy_from_slice(&t.stack[sp..sp + FPU_CONTEXT_WORDS]);
        sp += FPU_CONTEXT_WORDS;
    }
    cpu.ctx.r.copy_from_slice(&t.stack[sp..sp + CALLEE_CONTEXT_WORDS]);
    sp += CALLEE_CONTEXT_WORDS;
    cpu.psp = (run.next, sp);

    effect
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_kerncore::seed_frame;

    const STACK_WORDS: usize = 64;
    const ENTRY: u32 = 0x0800_1000;
    const HOOK: u32 = 0x0800_2000;

    /// A thread that has never run: seeded image, basic frame.
    fn spawned() -> Thread {
        let mut stack = vec![0; STACK_WORDS];
        let sp = seed_frame(&mut stack, ENTRY, 0, HOOK).unwrap();
        Thread {
            stack,
            sp,
            stack_frame: StackFrame::BASIC,
        }
    }

    /// CPU state as if `thread` just took an exception with a basic
    /// frame: the hardware image sits at the top of its stack.
    fn running_cpu(thread: usize) -> Cpu {
        Cpu {
            ctx: CalleeContext {
                r: [0; 8],
                s_hi: [0; 16],
            },
            frame: StackFrame::BASIC,
            psp: (thread, STACK_WORDS - 8),
            lspact: false,
        }
    }

    #[test]
    fn resume_leaves_everything_alone() {
        let mut threads = vec![spawned(), spawned()];
        let mut run = RunPair {
            current: Some(0),
            next: 0,
        };
        let mut cpu = running_cpu(0);
        cpu.ctx.r = [1, 2, 3, 4, 5, 6, 7, 8];

        let cpu_before = cpu.clone();
        let threads_before = threads.clone();

        // Two back-to-back scheduling exceptions with an unchanged
        // election, as consecutive idle ticks produce.
        for _ in 0..2 {
            let effect = switch(&mut run, &mut threads, &mut cpu, |_| {
                panic!("advisory hook must not run without a switch")
            });
            assert_eq!(effect, SwitchEffect::Resume);
        }

        assert_eq!(cpu, cpu_before);
        assert_eq!(threads, threads_before);
        assert_eq!(
            run,
            RunPair {
                current: Some(0),
                next: 0,
            }
        );
    }

    #[test]
    fn round_trip_restores_callee_context() {
        let mut threads = vec![spawned(), spawned()];
        let mut run = RunPair {
            current: Some(0),
            next: 1,
        };
        let mut cpu = running_cpu(0);
        cpu.ctx.r = [0xDEAD_BEEF, 11, 12, 13, 14, 15, 16, 17];
        let outgoing = cpu.ctx;

        let effect = switch(&mut run, &mut threads, &mut cpu, |_| ());
        assert_eq!(effect, SwitchEffect::SaveAndRestore);
        assert_eq!(run.current, Some(1));

        // The outgoing context was parked and recorded.
        assert_eq!(threads[0].sp, STACK_WORDS - 8 - CALLEE_CONTEXT_WORDS);
        assert_eq!(threads[0].stack_frame, StackFrame::BASIC);

        // The incoming thread starts from its seeded image.
        assert_eq!(cpu.ctx.r, [0; 8]);
        assert_eq!(cpu.psp, (1, STACK_WORDS - 8));

        // Thread 1 dirties its registers, then the policy elects
        // thread 0 again.
        cpu.ctx.r = [0x5555_5555; 8];
        run.next = 0;
        let effect = switch(&mut run, &mut threads, &mut cpu, |_| ());
        assert_eq!(effect, SwitchEffect::SaveAndRestore);

        assert_eq!(cpu.ctx, outgoing);
        assert_eq!(cpu.psp, (0, STACK_WORDS - 8));
    }

    #[test]
    fn extended_frame_round_trip_keeps_high_s_registers() {
        let mut threads = vec![spawned(), spawned()];
        let mut run = RunPair {
            current: Some(0),
            next: 1,
        };
        // Thread 0 is running with live FPU context: the hardware
        // stacked the 26-word extended frame.
        let mut cpu = Cpu {
            ctx: CalleeContext {
                r: [9; 8],
                s_hi: [0; 16],
            },
            frame: StackFrame::EXTENDED,
            psp: (0, STACK_WORDS - 26),
            lspact: false,
        };
        cpu.ctx.s_hi[4] = f32::to_bits(3.14); // s20
        let outgoing = cpu.ctx;

        switch(&mut run, &mut threads, &mut cpu, |_| ());
        assert_eq!(threads[0].stack_frame, StackFrame::EXTENDED);
        assert_eq!(cpu.frame, StackFrame::BASIC);

        // While the basic-frame thread runs, scribble over everything
        // it is allowed to touch. s16-s31 must come back from thread
        // 0's stack, not from whatever is live here.
        cpu.ctx.r = [0xFFFF_FFFF; 8];
        cpu.ctx.s_hi = [7; 16];

        run.next = 0;
        switch(&mut run, &mut threads, &mut cpu, |_| ());
        assert_eq!(cpu.frame, StackFrame::EXTENDED);
        assert_eq!(cpu.ctx, outgoing);
        assert_eq!(f32::from_bits(cpu.ctx.s_hi[4]), 3.14);
    }

    #[test]
    fn deleted_extended_thread_clears_lazy_fp_state() {
        let mut threads = vec![spawned(), spawned()];
        let mut run = RunPair {
            current: None,
            next: 1,
        };
        let mut cpu = Cpu {
            ctx: CalleeContext {
                r: [3; 8],
                s_hi: [3; 16],
            },
            frame: StackFrame::EXTENDED,
            psp: (0, STACK_WORDS - 26),
            lspact: true,
        };
        let thread0_before = threads[0].clone();

        let effect = switch(&mut run, &mut threads, &mut cpu, |_| ());
        assert_eq!(effect, SwitchEffect::RestoreOnly);
        assert!(!cpu.lspact);
        assert_eq!(run.current, Some(1));
        assert_eq!(cpu.psp, (1, STACK_WORDS - 8));

        // Nothing was saved into the dead thread.
        assert_eq!(threads[0], thread0_before);
    }

    #[test]
    fn deleted_basic_thread_leaves_lazy_fp_state_alone() {
        let mut threads = vec![spawned(), spawned()];
        let mut run = RunPair {
            current: None,
            next: 1,
        };
        let mut cpu = running_cpu(0);
        cpu.lspact = true;

        let effect = switch(&mut run, &mut threads, &mut cpu, |_| ());
        assert_eq!(effect, SwitchEffect::RestoreOnly);
        assert!(cpu.lspact);
    }

    #[test]
    fn helper_updates_to_the_pair_are_honored() {
        let mut threads = vec![spawned(), spawned(), spawned()];
        let mut run = RunPair {
            current: Some(0),
            next: 1,
        };
        let mut cpu = running_cpu(0);

        // The hook re-elects thread 2 between the save and the
        // publish; the tail re-reads the pair, so thread 2 is what
        // actually runs.
        switch(&mut run, &mut threads, &mut cpu, |run| run.next = 2);
        assert_eq!(run.current, Some(2));
        assert_eq!(cpu.psp, (2, STACK_WORDS - 8));
    }
}
