//! Named shared memory segments.
//!
//! Two narrow cross-process handoff channels ride on these mappings and both
//! names are part of the wire contract with the loader side:
//! the fixed-name 8-byte slot the bitness helper writes its resolved address
//! into, and the per-pid readiness mapping the injected loader publishes.

use crate::InjectionError;
use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_READ,
    FILE_MAP_WRITE, MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};

/// A small named file mapping holding one fixed-size value.
///
/// Single-writer/single-reader per handoff; the mapping lives as long as at
/// least one side holds it open.
pub struct SharedSlot {
    mapping: HANDLE,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    size: usize,
}

unsafe impl Send for SharedSlot {}

impl SharedSlot {
    /// Creates (or opens, if it already exists) the named segment.
    pub fn create(name: &str, size: usize) -> Result<Self, InjectionError> {
        let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();

        let mapping = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                0,
                size as u32,
                PCWSTR(wide.as_ptr()),
            )
            .map_err(|e| InjectionError::SharedMemoryFailed(format!("{name}: {e}")))?
        };

        Self::map(mapping, name, size)
    }

    /// Opens an existing named segment; fails if nobody has created it.
    pub fn open(name: &str, size: usize) -> Result<Self, InjectionError> {
        let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();

        let mapping = unsafe {
            OpenFileMappingW(
                (FILE_MAP_READ | FILE_MAP_WRITE).0,
                false,
                PCWSTR(wide.as_ptr()),
            )
            .map_err(|e| InjectionError::SharedMemoryFailed(format!("{name}: {e}")))?
        };

        Self::map(mapping, name, size)
    }

    fn map(mapping: HANDLE, name: &str, size: usize) -> Result<Self, InjectionError> {
        let view =
            unsafe { MapViewOfFile(mapping, FILE_MAP_READ | FILE_MAP_WRITE, 0, 0, size) };

        if view.Value.is_null() {
            let err = std::io::Error::last_os_error();
            unsafe {
                let _ = CloseHandle(mapping);
            }
            return Err(InjectionError::SharedMemoryFailed(format!(
                "{name}: map view failed: {err}"
            )));
        }

        Ok(Self {
            mapping,
            view,
            size,
        })
    }

    /// Reads the slot as a plain value.
    ///
    /// The type must fit the segment; checked at the call site by size.
    pub fn read<T: Copy>(&self) -> T {
        assert!(std::mem::size_of::<T>() <= self.size);
        unsafe { std::ptr::read_volatile(self.view.Value as *const T) }
    }

    /// Writes the slot as a plain value.
    pub fn write<T: Copy>(&self, value: &T) {
        assert!(std::mem::size_of::<T>() <= self.size);
        unsafe { std::ptr::write_volatile(self.view.Value as *mut T, *value) }
    }

    pub fn read_u64(&self) -> u64 {
        self.read::<u64>()
    }

    pub fn write_u64(&self, value: u64) {
        self.write(&value)
    }
}

impl Drop for SharedSlot {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = UnmapViewOfFile(self.view) {
                log::warn!("Failed to unmap shared segment view: {}", e);
            }
            let _ = CloseHandle(self.mapping);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_open_read() {
        // Per-test name keyed on the pid so parallel test runs don't collide
        let name = format!("modhost-slot-test-{}", std::process::id());

        let writer = SharedSlot::create(&name, 8).expect("create");
        writer.write_u64(0x1122_3344_5566_7788);

        let reader = SharedSlot::open(&name, 8).expect("open existing");
        assert_eq!(reader.read_u64(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn test_open_missing_segment_fails() {
        let result = SharedSlot::open("modhost-slot-test-never-created", 8);
        match result {
            Err(InjectionError::SharedMemoryFailed(_)) => {}
            other => panic!("Expected SharedMemoryFailed, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_struct_roundtrip() {
        #[repr(C)]
        #[derive(Clone, Copy, PartialEq, Debug)]
        struct Pair {
            a: u32,
            b: u32,
        }

        let name = format!("modhost-slot-pair-{}", std::process::id());
        let slot = SharedSlot::create(&name, std::mem::size_of::<Pair>()).expect("create");

        let value = Pair { a: 7, b: 9 };
        slot.write(&value);
        assert_eq!(slot.read::<Pair>(), value);
    }
}
