//! Architecture variants of the paging policy.
//!
//! Both modules compile on every host so the table formats stay testable
//! anywhere; only the `hw` submodules (register and TLB instructions) are
//! gated on the target architecture.

pub mod aarch64;
pub mod x86_64;
