//! Loaded-module inspection.
//!
//! The registry classifies a tracked process as loader-tagged by probing its
//! live module list; the probe runs fresh on every snapshot request so the
//! classification follows injection and unload.

use crate::error::ProcessError;
use crate::process::enumerator::SnapshotGuard;
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W, TH32CS_SNAPMODULE,
    TH32CS_SNAPMODULE32,
};

/// Lists the file names of all modules loaded in a process.
pub fn module_names(pid: u32) -> Result<Vec<String>, ProcessError> {
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid)
            .map_err(|e| {
                ProcessError::ModuleSnapshotFailed(
                    pid,
                    std::io::Error::from_raw_os_error(e.code().0),
                )
            })?;

        let _guard = SnapshotGuard(snapshot);

        let mut entry = MODULEENTRY32W {
            dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };

        let mut names = Vec::new();

        if Module32FirstW(snapshot, &mut entry).is_err() {
            return Err(ProcessError::ModuleSnapshotFailed(
                pid,
                std::io::Error::last_os_error(),
            ));
        }

        loop {
            let len = entry
                .szModule
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(entry.szModule.len());
            names.push(String::from_utf16_lossy(&entry.szModule[..len]));

            entry.dwSize = std::mem::size_of::<MODULEENTRY32W>() as u32;
            if Module32NextW(snapshot, &mut entry).is_err() {
                break;
            }
        }

        Ok(names)
    }
}

/// Returns true if the process has a module with the given file name loaded
/// (case-insensitive). A process that cannot be snapshotted (exited, access
/// denied) reports `false` rather than an error.
pub fn has_module(pid: u32, module_name: &str) -> bool {
    let wanted = module_name.to_lowercase();

    match module_names(pid) {
        Ok(names) => names.iter().any(|n| n.to_lowercase() == wanted),
        Err(e) => {
            log::debug!("Module probe for pid {} failed: {}", pid, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_names_self() {
        let names = module_names(std::process::id()).expect("Should snapshot own modules");
        assert!(!names.is_empty());
    }

    #[test]
    fn test_has_module_kernel32() {
        // Every Windows process has kernel32 loaded
        assert!(has_module(std::process::id(), "KERNEL32.DLL"));
        assert!(has_module(std::process::id(), "kernel32.dll"));
    }

    #[test]
    fn test_has_module_absent() {
        assert!(!has_module(std::process::id(), "modhost-not-loaded.dll"));
    }

    #[test]
    fn test_has_module_dead_process_is_false() {
        assert!(!has_module(u32::MAX - 1, "kernel32.dll"));
    }
}
