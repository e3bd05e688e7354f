//! System-wide process enumeration over toolhelp snapshots.

use crate::error::ProcessError;
use crate::process::ProcessInfo;
use std::collections::HashSet;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W, TH32CS_SNAPPROCESS,
};

/// Enumerates running processes on the system.
pub struct ProcessEnumerator;

impl ProcessEnumerator {
    /// Walks a fresh process snapshot and returns every entry.
    pub fn enumerate() -> Result<Vec<ProcessInfo>, ProcessError> {
        unsafe {
            let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0).map_err(|e| {
                ProcessError::SnapshotFailed(std::io::Error::from_raw_os_error(e.code().0))
            })?;
            let _guard = SnapshotGuard(snapshot);

            let mut entry = PROCESSENTRY32W {
                dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
                ..std::mem::zeroed()
            };

            if Process32FirstW(snapshot, &mut entry).is_err() {
                return Err(ProcessError::EnumerationFailed(
                    std::io::Error::last_os_error(),
                ));
            }

            let mut processes = vec![ProcessInfo::from_entry(&entry)];
            loop {
                entry.dwSize = std::mem::size_of::<PROCESSENTRY32W>() as u32;
                // Err means the walk reached the end of the snapshot
                if Process32NextW(snapshot, &mut entry).is_err() {
                    break;
                }
                processes.push(ProcessInfo::from_entry(&entry));
            }

            Ok(processes)
        }
    }

    /// Captures the set of currently live process ids.
    ///
    /// Cheaper to diff than full [`ProcessEnumerator::enumerate`] results;
    /// the polling watch strategy runs on these.
    pub fn pid_snapshot() -> Result<HashSet<u32>, ProcessError> {
        Ok(Self::enumerate()?.into_iter().map(|p| p.pid).collect())
    }

    /// Looks up a single process by pid.
    pub fn find_by_pid(pid: u32) -> Result<ProcessInfo, ProcessError> {
        Self::enumerate()?
            .into_iter()
            .find(|p| p.pid == pid)
            .ok_or(ProcessError::ProcessNotFound(pid))
    }

    /// All processes whose name contains `name`, case-insensitively.
    pub fn find_by_name(name: &str) -> Result<Vec<ProcessInfo>, ProcessError> {
        let wanted = name.to_lowercase();

        Ok(Self::enumerate()?
            .into_iter()
            .filter(|p| p.name.to_lowercase().contains(&wanted))
            .collect())
    }

    /// All processes whose resolved executable path equals `path`
    /// (case-insensitive full-path comparison).
    ///
    /// Processes whose path cannot be queried (protected, exited) are
    /// treated as non-matching, not as errors.
    pub fn find_by_path(path: &std::path::Path) -> Result<Vec<ProcessInfo>, ProcessError> {
        let wanted = path.to_string_lossy().to_lowercase();

        Ok(Self::enumerate()?
            .into_iter()
            .filter_map(|mut p| {
                p.try_get_path();
                match &p.path {
                    Some(actual) if actual.to_string_lossy().to_lowercase() == wanted => Some(p),
                    _ => None,
                }
            })
            .collect())
    }
}

/// Closes a toolhelp snapshot handle on drop.
pub(crate) struct SnapshotGuard(pub(crate) HANDLE);

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_contains_self() {
        let processes = ProcessEnumerator::enumerate().expect("Enumeration should succeed");
        assert!(!processes.is_empty());

        let own_pid = std::process::id();
        assert!(
            processes.iter().any(|p| p.pid == own_pid),
            "Own process (pid {}) must appear in the enumeration",
            own_pid
        );
    }

    #[test]
    fn test_pid_snapshot_contains_self() {
        let pids = ProcessEnumerator::pid_snapshot().expect("snapshot should succeed");
        assert!(pids.contains(&std::process::id()));
    }

    #[test]
    fn test_find_by_pid_self() {
        let own_pid = std::process::id();
        let process = ProcessEnumerator::find_by_pid(own_pid).expect("Should find own process");

        assert_eq!(process.pid, own_pid);
        assert!(!process.name.is_empty());
    }

    #[test]
    fn test_find_by_path_self() {
        let own_path = std::env::current_exe().expect("current_exe");
        let matches = ProcessEnumerator::find_by_path(&own_path).expect("enumeration");

        assert!(
            matches.iter().any(|p| p.pid == std::process::id()),
            "Own process should match its own executable path"
        );
    }

    #[test]
    fn test_find_by_missing_pid() {
        match ProcessEnumerator::find_by_pid(u32::MAX - 1) {
            Err(ProcessError::ProcessNotFound(pid)) => assert_eq!(pid, u32::MAX - 1),
            other => panic!("Expected ProcessNotFound, got {:?}", other.err()),
        }
    }
}
