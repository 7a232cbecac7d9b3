//! # Kernel integration
//!
//! Wires the memory and scheduling crates together for platform startup:
//! the higher-half direct map, the boot-time singletons with their
//! documented init order, and the interrupt entry glue.
//!
//! Expected bring-up sequence on the bootstrap core:
//!
//! 1. [`init_memory`] with the platform memory map (after reserving the
//!    kernel image via [`frame_allocator`]`().reserve(..)`),
//! 2. [`register_ipi_link`] and [`register_preemption_timer`] once the
//!    interrupt controller and local timer are programmed,
//! 3. [`cpu_registry`]`().bring_online(..)` per core as it comes up,
//! 4. threads enqueued through [`scheduler`], dispatch driven by the
//!    timer interrupt calling [`on_timer_interrupt`].
//!
//! Everything else (interrupt vectors, core discovery, drivers) lives in
//! the platform layer consuming this crate.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod hhdm;
mod init;

pub use hhdm::{HhdmMapper, HHDM_BASE};
pub use init::{
    boot_space, cpu_registry, emergency_halt, frame_allocator, halt_epilogue, init_memory,
    on_timer_interrupt, register_ipi_link, register_preemption_timer, scheduler,
    shootdown_epilogue, tlb, yield_now, TimerHook,
};

/// Paging policy of the compilation target.
#[cfg(target_arch = "x86_64")]
pub type ArchPaging = kernel_vas::arch::x86_64::X64;
#[cfg(target_arch = "aarch64")]
pub type ArchPaging = kernel_vas::arch::aarch64::Arm64;

/// Hardware root-register access of the compilation target.
#[cfg(target_arch = "x86_64")]
pub type ArchSwitch = kernel_vas::arch::x86_64::hw::HwSpace;
#[cfg(target_arch = "aarch64")]
pub type ArchSwitch = kernel_vas::arch::aarch64::hw::HwSpace;

/// Local TLB maintenance of the compilation target.
#[cfg(target_arch = "x86_64")]
pub type ArchTlb = kernel_vas::arch::x86_64::hw::LocalTlb;
#[cfg(target_arch = "aarch64")]
pub type ArchTlb = kernel_vas::arch::aarch64::hw::LocalTlb;
