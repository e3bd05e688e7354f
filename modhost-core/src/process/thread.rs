//! Thread handle management.

use crate::error::ProcessError;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Threading::ResumeThread;

/// RAII wrapper for a thread handle.
///
/// For the primary thread of a suspended launch, ownership transfers from the
/// launcher to the workflow, which alone decides when to resume it. `resume`
/// tracks whether it already ran so the suspended-to-running transition
/// happens at most once.
pub struct ThreadHandle {
    handle: HANDLE,
    resumed: bool,
}

unsafe impl Send for ThreadHandle {}

impl ThreadHandle {
    /// Wraps a thread handle returned by process or thread creation.
    ///
    /// # Safety
    /// `handle` must be a valid thread handle owned by the caller; ownership
    /// transfers to the returned value.
    pub unsafe fn from_raw(handle: HANDLE) -> Self {
        Self {
            handle,
            resumed: false,
        }
    }

    /// Get raw handle.
    pub fn as_handle(&self) -> HANDLE {
        self.handle
    }

    /// Resumes the thread if it has not been resumed through this handle yet.
    ///
    /// A second call is a no-op; the suspend count must not go below the
    /// state the launcher left it in.
    pub fn resume(&mut self) -> Result<(), ProcessError> {
        if self.resumed {
            log::debug!("Thread already resumed, ignoring repeated resume");
            return Ok(());
        }

        unsafe {
            // ResumeThread returns (DWORD)-1 on failure
            if ResumeThread(self.handle) == u32::MAX {
                return Err(ProcessError::ResumeFailed(std::io::Error::last_os_error()));
            }
        }

        self.resumed = true;
        Ok(())
    }

    /// Whether `resume` already ran successfully.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        unsafe {
            if !self.handle.is_invalid() {
                let _ = CloseHandle(self.handle);
            }
        }
    }
}
