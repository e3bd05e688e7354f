//! Remote and shared memory primitives.

pub mod remote;
pub mod shared;

pub use remote::{write_memory, write_wide_string, RemoteMemory};
pub use shared::SharedSlot;
