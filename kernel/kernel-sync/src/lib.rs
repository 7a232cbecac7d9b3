//! # Kernel synchronization primitives
//!
//! Short-held spin locks and a one-shot init cell. Locks here are not fair
//! beyond hardware arbitration and must never be held across a potential
//! reschedule.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod raw_spin;
mod spin_lock;
mod sync_once_cell;

pub use raw_spin::RawSpin;
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
