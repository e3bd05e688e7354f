// Process management module

mod bitness;
mod enumerator;
mod handle;
mod info;
mod launcher;
pub mod modules;
mod thread;

pub use bitness::is_process_64bit;
pub use enumerator::ProcessEnumerator;
pub use handle::ProcessHandle;
pub use info::{query_image_path, ProcessInfo};
pub use launcher::{LaunchedProcess, ProcessLauncher};
pub use thread::ThreadHandle;
