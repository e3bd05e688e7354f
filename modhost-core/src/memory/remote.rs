//! Memory allocated inside a target process.

use crate::InjectionError;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Diagnostics::Debug::WriteProcessMemory;
use windows::Win32::System::Memory::{
    VirtualAllocEx, VirtualFreeEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_PROTECTION_FLAGS,
    PAGE_READWRITE,
};

/// An allocation in a foreign process, released on drop.
///
/// An injection attempt that fails midway leaves no memory behind in the
/// target.
pub struct RemoteMemory {
    process: HANDLE,
    address: *mut u8,
    size: usize,
}

impl RemoteMemory {
    /// Commits `size` bytes in `process`.
    ///
    /// Fails with [`InjectionError::MemoryAllocationFailed`], including when
    /// the target has already exited.
    pub fn allocate(
        process: HANDLE,
        size: usize,
        protection: PAGE_PROTECTION_FLAGS,
    ) -> Result<Self, InjectionError> {
        let address =
            unsafe { VirtualAllocEx(process, None, size, MEM_COMMIT | MEM_RESERVE, protection) };

        if address.is_null() {
            return Err(InjectionError::MemoryAllocationFailed(
                std::io::Error::last_os_error(),
            ));
        }

        log::debug!("Allocated {} bytes at {:?} in target", size, address);

        Ok(Self {
            process,
            address: address as *mut u8,
            size,
        })
    }

    /// Allocates a read/write buffer sized for `text` as null-terminated
    /// UTF-16 and writes it.
    pub fn allocate_wide_string(process: HANDLE, text: &str) -> Result<Self, InjectionError> {
        let size = (text.encode_utf16().count() + 1) * 2;
        let memory = Self::allocate(process, size, PAGE_READWRITE)?;
        write_wide_string(process, memory.address, text)?;
        Ok(memory)
    }

    pub fn address(&self) -> *mut u8 {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The allocation as a thread-start argument pointer.
    pub fn as_ptr(&self) -> *const std::ffi::c_void {
        self.address as *const std::ffi::c_void
    }
}

impl Drop for RemoteMemory {
    fn drop(&mut self) {
        let freed = unsafe {
            VirtualFreeEx(
                self.process,
                self.address as *mut std::ffi::c_void,
                0,
                MEM_RELEASE,
            )
        };

        // The target may have exited already; nothing left to free then
        if let Err(e) = freed {
            log::warn!("Failed to free remote memory at {:?}: {}", self.address, e);
        }
    }
}

/// Writes `data` into the target at `address`; short writes are errors.
pub fn write_memory(process: HANDLE, address: *mut u8, data: &[u8]) -> Result<(), InjectionError> {
    let mut written = 0;

    unsafe {
        WriteProcessMemory(
            process,
            address as *const std::ffi::c_void,
            data.as_ptr() as *const std::ffi::c_void,
            data.len(),
            Some(&mut written),
        )
        .map_err(|_| InjectionError::MemoryWriteFailed(std::io::Error::last_os_error()))?;
    }

    if written != data.len() {
        return Err(InjectionError::MemoryWriteFailed(std::io::Error::other(
            format!("short write: {} of {} bytes", written, data.len()),
        )));
    }

    Ok(())
}

/// Writes `text` as null-terminated UTF-16 into the target.
pub fn write_wide_string(
    process: HANDLE,
    address: *mut u8,
    text: &str,
) -> Result<(), InjectionError> {
    let wide: Vec<u16> = text.encode_utf16().chain(std::iter::once(0)).collect();

    let bytes =
        unsafe { std::slice::from_raw_parts(wide.as_ptr() as *const u8, wide.len() * 2) };

    write_memory(process, address, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use windows::Win32::System::Threading::GetCurrentProcess;

    #[test]
    fn test_allocate_and_free_in_self() {
        let process = unsafe { GetCurrentProcess() };
        let memory = RemoteMemory::allocate(process, 64, PAGE_READWRITE)
            .expect("Allocation in own process should succeed");

        assert!(!memory.address().is_null());
        assert_eq!(memory.size(), 64);
        // Freed by Drop
    }

    #[test]
    fn test_allocate_wide_string_sizes_for_utf16() {
        let process = unsafe { GetCurrentProcess() };
        let text = "C:\\loader\\modhost32.dll";
        let memory = RemoteMemory::allocate_wide_string(process, text).expect("Write");

        // UTF-16 code units plus null terminator, two bytes each
        assert_eq!(memory.size(), (text.encode_utf16().count() + 1) * 2);
    }
}
