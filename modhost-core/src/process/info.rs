//! Per-process metadata captured during enumeration.

use crate::process::ProcessHandle;
use std::fmt;
use std::path::PathBuf;
use windows::core::PWSTR;
use windows::Win32::Foundation::ERROR_INSUFFICIENT_BUFFER;
use windows::Win32::System::Diagnostics::ToolHelp::PROCESSENTRY32W;
use windows::Win32::System::Threading::{
    QueryFullProcessImageNameW, PROCESS_QUERY_LIMITED_INFORMATION,
};

/// One enumerated process.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Executable file name, e.g. "game.exe".
    pub name: String,
    /// Full executable path; `None` until [`ProcessInfo::try_get_path`] runs
    /// or when the process cannot be opened.
    pub path: Option<PathBuf>,
    pub parent_pid: u32,
}

impl ProcessInfo {
    pub fn from_entry(entry: &PROCESSENTRY32W) -> Self {
        let len = entry
            .szExeFile
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(entry.szExeFile.len());

        let name = String::from_utf16_lossy(&entry.szExeFile[..len]);

        Self {
            pid: entry.th32ProcessID,
            name,
            path: None,
            parent_pid: entry.th32ParentProcessID,
        }
    }

    /// Attempts to fill in the full executable path for this process.
    /// Leaves `path` as `None` for protected processes without access.
    pub fn try_get_path(&mut self) {
        self.path = query_image_path(self.pid);
    }
}

/// Resolves the full executable path of a process by pid.
///
/// Returns `None` for protected processes the caller cannot open; the
/// registry treats those as non-matching rather than failing enumeration.
pub fn query_image_path(pid: u32) -> Option<PathBuf> {
    let handle = ProcessHandle::open(pid, PROCESS_QUERY_LIMITED_INFORMATION).ok()?;

    // MAX_PATH first; executables under long paths need the retry at the
    // extended-path maximum
    let mut capacity = 260usize;
    loop {
        let mut buffer = vec![0u16; capacity];
        let mut size = capacity as u32;

        let result = unsafe {
            QueryFullProcessImageNameW(
                handle.as_handle(),
                Default::default(),
                PWSTR(buffer.as_mut_ptr()),
                &mut size,
            )
        };

        match result {
            Ok(()) if size > 0 => {
                return Some(PathBuf::from(String::from_utf16_lossy(
                    &buffer[..size as usize],
                )));
            }
            Ok(()) => return None,
            Err(e)
                if e.code() == ERROR_INSUFFICIENT_BUFFER.to_hresult() && capacity < 32_768 =>
            {
                capacity = 32_768;
            }
            Err(_) => return None,
        }
    }
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process {{ pid: {}, name: \"{}\" }}", self.pid, self.name)?;

        if let Some(ref path) = self.path {
            write!(f, " [{}]", path.display())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_image_path_self() {
        let path = query_image_path(std::process::id());

        assert!(path.is_some(), "Should resolve own image path");
        let path = path.unwrap();
        assert!(path.is_absolute());
        assert!(path.exists());
    }

    #[test]
    fn test_query_image_path_invalid_pid() {
        assert!(query_image_path(u32::MAX - 1).is_none());
    }
}
