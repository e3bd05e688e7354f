//! Bitness-aware resolution of the module-load entry point.
//!
//! A 64-bit host cannot look up `LoadLibraryW` for a 32-bit target (and vice
//! versa): the address is only meaningful inside a matching bitness context.
//! For the matching case resolution is an in-process export lookup; for the
//! mismatched case a short-lived helper executable of the requested bitness
//! performs the same lookup on itself and hands the 8-byte result back
//! through a fixed-name shared memory segment.

use crate::error::InjectionError;
use crate::memory::SharedSlot;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;
use windows::core::{s, w};
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};

/// Fixed name of the address handoff segment. Part of the wire contract with
/// the helper executable; must stay stable across versions.
pub const ADDRESS_HANDOFF_SEGMENT: &str = "modhost-kernel32-handoff";

/// Paths to the opposite-bitness helper executables.
///
/// Only the helper for the *other* bitness is ever spawned; a path may stay
/// unset when cross-bitness targets are not used.
#[derive(Debug, Clone, Default)]
pub struct HelperPaths {
    pub helper_32: Option<PathBuf>,
    pub helper_64: Option<PathBuf>,
}

/// Resolves and caches the `LoadLibraryW` address per bitness.
///
/// The cache cells double as the guard against concurrent first-time
/// resolution: a second caller blocks on the mutex until the first resolution
/// completes, which also serializes use of the handoff segment.
pub struct BitnessAddressResolver {
    helpers: HelperPaths,
    cache_32: Mutex<Option<u64>>,
    cache_64: Mutex<Option<u64>>,
}

impl BitnessAddressResolver {
    pub fn new(helpers: HelperPaths) -> Self {
        Self {
            helpers,
            cache_32: Mutex::new(None),
            cache_64: Mutex::new(None),
        }
    }

    /// Resolves the `LoadLibraryW` address valid inside a target of the given
    /// bitness (`wide` = 64-bit). Cached after the first successful call.
    pub fn resolve_load_library(&self, wide: bool) -> Result<u64, InjectionError> {
        let cache = if wide { &self.cache_64 } else { &self.cache_32 };
        let mut slot = cache.lock().unwrap();

        if let Some(address) = *slot {
            return Ok(address);
        }

        let host_is_64 = cfg!(target_pointer_width = "64");
        let address = if wide == host_is_64 {
            local_load_library_address()?
        } else {
            self.resolve_via_helper(wide)?
        };

        if address == 0 {
            return Err(InjectionError::AddressResolutionFailed(
                "resolved a null address".into(),
            ));
        }

        log::debug!(
            "Resolved LoadLibraryW for {}-bit targets: {:#x}",
            if wide { 64 } else { 32 },
            address
        );
        *slot = Some(address);
        Ok(address)
    }

    fn resolve_via_helper(&self, wide: bool) -> Result<u64, InjectionError> {
        let bits = if wide { 64 } else { 32 };
        let helper = if wide {
            self.helpers.helper_64.as_ref()
        } else {
            self.helpers.helper_32.as_ref()
        }
        .ok_or(InjectionError::HelperNotConfigured(bits))?;

        // Create the segment before the helper runs so it only ever opens an
        // existing mapping; zero it so a stale value cannot be mistaken for a
        // fresh result.
        let slot = SharedSlot::create(ADDRESS_HANDOFF_SEGMENT, 8)?;
        slot.write_u64(0);

        log::info!("Spawning {}-bit address helper: {}", bits, helper.display());

        let status = Command::new(helper).status().map_err(|e| {
            InjectionError::AddressResolutionFailed(format!(
                "helper {} failed to start: {e}",
                helper.display()
            ))
        })?;

        if !status.success() {
            return Err(InjectionError::AddressResolutionFailed(format!(
                "helper exited with {status}"
            )));
        }

        let address = slot.read_u64();
        if address == 0 {
            return Err(InjectionError::AddressResolutionFailed(format!(
                "{bits}-bit helper wrote a null address"
            )));
        }

        Ok(address)
    }
}

/// In-process export lookup of `LoadLibraryW` in kernel32.
///
/// Valid only for targets of the host's own bitness; the helper executable
/// calls this for its side of the cross-bitness handoff.
pub fn local_load_library_address() -> Result<u64, InjectionError> {
    unsafe {
        let kernel32 = GetModuleHandleW(w!("kernel32.dll")).map_err(|e| {
            InjectionError::AddressResolutionFailed(format!("kernel32 not found: {e}"))
        })?;

        let address = GetProcAddress(kernel32, s!("LoadLibraryW")).ok_or_else(|| {
            InjectionError::AddressResolutionFailed("LoadLibraryW export not found".into())
        })?;

        Ok(address as usize as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_load_library_address() {
        let address = local_load_library_address().expect("Lookup should succeed");
        assert_ne!(address, 0);
    }

    #[test]
    fn test_same_bitness_resolution_is_cached() {
        let resolver = BitnessAddressResolver::new(HelperPaths::default());
        let wide = cfg!(target_pointer_width = "64");

        let first = resolver.resolve_load_library(wide).expect("resolve");
        let second = resolver.resolve_load_library(wide).expect("resolve again");

        assert_ne!(first, 0);
        assert_eq!(first, second, "Second call must come from the cache");
    }

    #[test]
    fn test_cross_bitness_without_helper_fails_cleanly() {
        let resolver = BitnessAddressResolver::new(HelperPaths::default());
        let other = !cfg!(target_pointer_width = "64");

        match resolver.resolve_load_library(other) {
            Err(InjectionError::HelperNotConfigured(bits)) => {
                assert_eq!(bits, if other { 64 } else { 32 });
            }
            other => panic!("Expected HelperNotConfigured, got {:?}", other.err()),
        }
    }
}
