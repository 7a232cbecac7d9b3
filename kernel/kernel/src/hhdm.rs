//! Higher-half direct map.

use kernel_addresses::PhysicalAddress;
use kernel_vas::PhysMapper;

/// Base of the higher-half direct map: every physical address is also
/// reachable at `HHDM_BASE + pa`. Established by the boot path before
/// any code here runs.
pub const HHDM_BASE: u64 = 0xFFFF_8000_0000_0000;

/// [`PhysMapper`] over the direct map: add the base, cast.
pub struct HhdmMapper;

impl PhysMapper for HhdmMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = (HHDM_BASE + pa.as_u64()) as *mut T;
        // SAFETY: the direct map covers all managed physical memory and
        // is writable; the caller vouches for the type.
        unsafe { &mut *va }
    }
}
