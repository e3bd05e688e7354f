//! Loader DLL fixture.
//!
//! On attach it creates the readiness mapping for its host pid and writes
//! the ready signal, so a waiting injector observes readiness immediately.
//! The mapping is leaked on purpose; it must outlive `DllMain`.

use modhost_core::inject::{readiness_segment_name, LoaderSignal};
use modhost_core::memory::SharedSlot;
use windows::Win32::Foundation::{BOOL, HINSTANCE};
use windows::Win32::System::SystemServices::DLL_PROCESS_ATTACH;

#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn DllMain(
    _dll_module: HINSTANCE,
    call_reason: u32,
    _reserved: *mut std::ffi::c_void,
) -> BOOL {
    if call_reason == DLL_PROCESS_ATTACH {
        signal_ready();
    }
    BOOL::from(true)
}

fn signal_ready() {
    let name = readiness_segment_name(std::process::id());
    if let Ok(slot) = SharedSlot::create(&name, std::mem::size_of::<LoaderSignal>()) {
        slot.write(&LoaderSignal::ready());
        std::mem::forget(slot);
    }
}
