//! CPU affinity bitmap helpers (`# 6`, "CPU-affinity helpers").
//!
//! The bitmap is a plain byte array indexed by CPU number, independent of
//! `libc::cpu_set_t` so its size isn't bounded by `CPU_SETSIZE`. It is
//! converted to a `libc::cpu_set_t` only at the point `sched_setaffinity`
//! is actually called, in [`crate::pco`].

use crate::error::{Error, Result};

/// A bitmap of CPU numbers, one bit per CPU.
///
/// Grounded on `pdip_cpu_alloc`/`pdip_cpu_set`/`pdip_cpu_isset` in
/// `original_source/pdip.h`, reshaped into an owned `Vec<u8>` newtype the
/// way the teacher wraps small byte buffers (e.g. `ProcessInfo::command`)
/// in a struct rather than passing raw slices around.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CpuSet {
    bits: Vec<u8>,
}

impl CpuSet {
    /// Returns the number of CPUs configured on this host.
    pub fn cpu_count() -> usize {
        // SAFETY: sysconf with a valid, well-known name never touches
        // memory outside of what libc owns.
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if n > 0 {
            n as usize
        } else {
            1
        }
    }

    /// Allocates a bitmap sized to the host's CPU count, all bits clear.
    pub fn alloc() -> Self {
        let nbytes = Self::cpu_count().div_ceil(8).max(1);
        Self {
            bits: vec![0u8; nbytes],
        }
    }

    /// Clears every bit (`pdip_cpu_zero`).
    pub fn zero(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }

    /// Sets every bit up to the host's CPU count (`pdip_cpu_all`).
    pub fn all(&mut self) {
        let ncpus = Self::cpu_count();
        self.zero();
        for i in 0..ncpus {
            self.set(i).expect("bitmap sized for cpu_count");
        }
    }

    fn check_bounds(&self, n: usize) -> Result<()> {
        if n / 8 >= self.bits.len() {
            return Err(Error::InvalidArgument(format!(
                "CPU number {n} out of range for a {}-byte bitmap",
                self.bits.len()
            )));
        }
        Ok(())
    }

    /// Sets CPU `n` in the bitmap (`pdip_cpu_set`).
    pub fn set(&mut self, n: usize) -> Result<()> {
        self.check_bounds(n)?;
        self.bits[n / 8] |= 1 << (n % 8);
        Ok(())
    }

    /// Clears CPU `n` in the bitmap (`pdip_cpu_unset`).
    pub fn unset(&mut self, n: usize) -> Result<()> {
        self.check_bounds(n)?;
        self.bits[n / 8] &= !(1 << (n % 8));
        Ok(())
    }

    /// Tests whether CPU `n` is set (`pdip_cpu_isset`).
    pub fn is_set(&self, n: usize) -> Result<bool> {
        self.check_bounds(n)?;
        Ok(self.bits[n / 8] & (1 << (n % 8)) != 0)
    }

    /// True if no bit is set — affinity is inherited from the parent, per
    /// `# 4.2`'s "otherwise inherits" default.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    /// Returns the set CPU numbers in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        let total = self.bits.len() * 8;
        (0..total).filter(move |n| self.is_set(*n).unwrap_or(false))
    }

    /// Converts to a `libc::cpu_set_t` for `sched_setaffinity`.
    ///
    /// Only meaningful on Linux; other POSIX platforms lack the syscall
    /// entirely (`# 1` Non-goals: "Portability below a POSIX pseudo-terminal
    /// surface" does not promise affinity support everywhere).
    #[cfg(target_os = "linux")]
    pub(crate) fn to_libc_cpu_set(&self) -> libc::cpu_set_t {
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for n in self.iter_set() {
            if n < libc::CPU_SETSIZE as usize {
                unsafe { libc::CPU_SET(n, &mut set) };
            }
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_unset_round_trips_to_original() {
        let before = CpuSet::alloc();
        let mut after = before.clone();
        after.set(0).unwrap();
        after.unset(0).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn set_is_reflected_by_isset() {
        let mut cpus = CpuSet::alloc();
        assert!(!cpus.is_set(0).unwrap());
        cpus.set(0).unwrap();
        assert!(cpus.is_set(0).unwrap());
    }

    #[test]
    fn out_of_range_is_rejected() {
        let cpus = CpuSet::alloc();
        let huge = cpus.bits.len() * 8 + 100;
        assert!(cpus.is_set(huge).is_err());
    }

    #[test]
    fn all_sets_every_known_cpu() {
        let mut cpus = CpuSet::alloc();
        cpus.all();
        for n in 0..CpuSet::cpu_count() {
            assert!(cpus.is_set(n).unwrap());
        }
    }

    proptest::proptest! {
        #[test]
        fn set_unset_is_identity_for_any_valid_cpu(n in 0usize..64) {
            let mut cpus = CpuSet { bits: vec![0u8; 8] };
            let before = cpus.clone();
            cpus.set(n).unwrap();
            cpus.unset(n).unwrap();
            proptest::prop_assert_eq!(before, cpus);
        }
    }
}
