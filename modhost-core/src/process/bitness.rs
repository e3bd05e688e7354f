//! Process bitness detection.

use crate::error::ProcessError;
use crate::process::ProcessHandle;
use windows::Win32::Foundation::BOOL;
use windows::Win32::System::Threading::IsWow64Process;

/// Check if a process is 32-bit or 64-bit.
///
/// Returns true if the process is 64-bit, false if 32-bit. The result decides
/// which loader module binary and which address-resolution context apply to
/// an injection target.
pub fn is_process_64bit(handle: &ProcessHandle) -> Result<bool, ProcessError> {
    let mut is_wow64 = BOOL::from(false);

    unsafe {
        IsWow64Process(handle.as_handle(), &mut is_wow64)
            .map_err(|_| ProcessError::OpenProcessFailed(std::io::Error::last_os_error()))?;
    }

    // On 64-bit Windows: WoW64 process = 32-bit, non-WoW64 process = 64-bit.
    // On 32-bit Windows all processes are 32-bit.
    if cfg!(target_pointer_width = "64") {
        Ok(!is_wow64.as_bool())
    } else {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windows::Win32::System::Threading::PROCESS_QUERY_INFORMATION;

    #[test]
    fn test_is_process_64bit_own_process() {
        let pid = std::process::id();
        let handle =
            ProcessHandle::open(pid, PROCESS_QUERY_INFORMATION).expect("Failed to open own process");

        let is_64bit = is_process_64bit(&handle).expect("Bitness query should succeed");

        // Should match our own architecture
        #[cfg(target_pointer_width = "64")]
        assert!(is_64bit);

        #[cfg(target_pointer_width = "32")]
        assert!(!is_64bit);
    }
}
