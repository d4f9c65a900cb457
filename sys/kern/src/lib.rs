// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keel kernel core: the handler-mode heart of a preemptive kernel for
//! Cortex-M4(F).
//!
//! This crate is deliberately small. It contains the three exception
//! handlers through which every context switch and kernel service call
//! in the system funnels, and nothing else: no thread objects, no
//! scheduling policy, no timers. Those live in collaborating code that
//! this crate reaches only through a handful of linked symbols (see
//! `arch::arm_m` for the full set). The division means the pieces
//! that manipulate banked stack pointers and raw exception frames,
//! where a bug corrupts every thread at once, stay compact enough to
//! review instruction by instruction.
//!
//! # Design principles
//!
//! 1. Anything that can leave the assembly does. The handlers save the
//!    minimum state the hardware demands and branch into ordinary Rust
//!    (or a shared assembly tail) for everything else.
//! 2. Layout is contract. Every offset the assembly consumes is a
//!    named constant in `keel-abi`, pinned by compile-time assertions
//!    against `repr(C)` mirrors of the collaborator records.
//! 3. Decisions are functions. The branch structure of the switch tail
//!    is mirrored by [`keel_kerncore::switch_effect`], which the host
//!    test suite drives through a software model of the tail.

#![cfg_attr(target_os = "none", no_std)]

pub mod arch;

#[cfg(target_os = "none")]
pub mod fail;
