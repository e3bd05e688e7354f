//! Owned process handles.

use crate::error::ProcessError;
use windows::Win32::Foundation::{
    CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, HANDLE, WAIT_TIMEOUT,
};
use windows::Win32::System::Threading::{
    GetCurrentProcess, OpenProcess, TerminateProcess, WaitForSingleObject, PROCESS_ACCESS_RIGHTS,
};

/// An owned handle to an open process.
///
/// The handle is closed exactly once, when the owner drops it. Handles are
/// never copied implicitly; a second reference to the same process requires
/// [`ProcessHandle::try_clone`].
pub struct ProcessHandle {
    handle: HANDLE,
    pid: u32,
}

// The underlying kernel handle is thread-agnostic
unsafe impl Send for ProcessHandle {}

impl ProcessHandle {
    /// Opens the process `pid` with the given access rights.
    pub fn open(pid: u32, rights: PROCESS_ACCESS_RIGHTS) -> Result<Self, ProcessError> {
        let handle = unsafe { OpenProcess(rights, false, pid) }
            .map_err(|_| ProcessError::OpenProcessFailed(std::io::Error::last_os_error()))?;

        if handle.is_invalid() {
            return Err(ProcessError::OpenProcessFailed(
                std::io::Error::last_os_error(),
            ));
        }

        Ok(Self { handle, pid })
    }

    /// Wraps a handle returned by process creation.
    ///
    /// # Safety
    /// `handle` must be a valid process handle owned by the caller; ownership
    /// transfers to the returned value.
    pub unsafe fn from_raw(handle: HANDLE, pid: u32) -> Self {
        Self { handle, pid }
    }

    /// Duplicates this handle so a second owner can outlive the first.
    pub fn try_clone(&self) -> Result<Self, ProcessError> {
        let mut duplicated = HANDLE::default();

        unsafe {
            DuplicateHandle(
                GetCurrentProcess(),
                self.handle,
                GetCurrentProcess(),
                &mut duplicated,
                0,
                false,
                DUPLICATE_SAME_ACCESS,
            )
            .map_err(|_| ProcessError::DuplicateHandleFailed(std::io::Error::last_os_error()))?;
        }

        Ok(Self {
            handle: duplicated,
            pid: self.pid,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Raw handle for OS calls; must not outlive this value.
    pub fn as_handle(&self) -> HANDLE {
        self.handle
    }

    pub fn is_valid(&self) -> bool {
        !self.handle.is_invalid()
    }

    /// Returns true while the process has not exited.
    pub fn is_alive(&self) -> bool {
        unsafe { WaitForSingleObject(self.handle, 0) == WAIT_TIMEOUT }
    }

    /// Forcibly terminates the process.
    pub fn terminate(&self, exit_code: u32) -> Result<(), ProcessError> {
        unsafe {
            TerminateProcess(self.handle, exit_code)
                .map_err(|_| ProcessError::TerminateFailed(std::io::Error::last_os_error()))
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.is_valid() {
            unsafe {
                let _ = CloseHandle(self.handle);
            }
        }
    }
}
