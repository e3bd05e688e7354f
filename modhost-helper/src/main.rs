//! Bitness helper executable.
//!
//! A short-lived process that looks up `LoadLibraryW` in its own kernel32
//! and writes the address into the fixed-name handoff segment. The host
//! builds this binary for both bitnesses and runs whichever matches the
//! injection target; the segment must already exist when the helper starts.

use std::process::ExitCode;

use modhost_core::inject::{local_load_library_address, ADDRESS_HANDOFF_SEGMENT};
use modhost_core::memory::SharedSlot;

fn main() -> ExitCode {
    match publish_address() {
        Ok(address) => {
            println!("LoadLibraryW @ {address:#x}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("modhost-helper: {e}");
            ExitCode::FAILURE
        }
    }
}

fn publish_address() -> Result<u64, modhost_core::InjectionError> {
    let address = local_load_library_address()?;
    let slot = SharedSlot::open(ADDRESS_HANDOFF_SEGMENT, std::mem::size_of::<u64>())?;
    slot.write_u64(address);
    Ok(address)
}
