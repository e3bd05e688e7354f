//! Remote loader injection.
//!
//! The classic remote-thread technique, with the module-load entry point
//! resolved for the target's bitness:
//! 1. Allocate memory in the target process
//! 2. Write the loader path (UTF-16) to the allocated memory
//! 3. Create a remote thread starting at `LoadLibraryW` with the path as
//!    its argument
//! 4. Wait for the thread and read its exit code, which is the module-load
//!    return value; zero means the load failed
//!
//! There is deliberately no timeout on the remote wait; timeout policy lives
//! in the readiness phase, which is a separate later step.

use crate::error::InjectionError;
use crate::inject::resolver::{BitnessAddressResolver, HelperPaths};
use crate::memory::RemoteMemory;
use crate::process::{ProcessHandle, ThreadHandle};
use std::path::{Path, PathBuf};
use windows::Win32::System::Threading::{
    CreateRemoteThread, GetExitCodeThread, WaitForSingleObject, INFINITE,
};

/// What to inject and into which bitness context. Immutable once built.
#[derive(Debug, Clone)]
pub struct InjectionRequest {
    pub loader_module_path: PathBuf,
    pub target_is_64bit: bool,
}

impl InjectionRequest {
    /// Validates the loader path up front: it must be absolute (the target
    /// resolves it in its own working directory otherwise) and must exist.
    pub fn new(loader_module_path: &Path, target_is_64bit: bool) -> Result<Self, InjectionError> {
        if !loader_module_path.is_absolute() {
            return Err(InjectionError::RelativePath);
        }
        if !loader_module_path.exists() {
            return Err(InjectionError::LoaderNotFound(
                loader_module_path.display().to_string(),
            ));
        }

        Ok(Self {
            loader_module_path: loader_module_path.to_path_buf(),
            target_is_64bit,
        })
    }
}

/// Result of one injection attempt.
///
/// `remote_exit_code` is the remote thread's exit code, i.e. the value the
/// module-load call returned inside the target; zero is the distinguished
/// failure sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectionOutcome {
    pub succeeded: bool,
    pub remote_exit_code: u32,
}

impl InjectionOutcome {
    fn failed() -> Self {
        Self {
            succeeded: false,
            remote_exit_code: 0,
        }
    }
}

/// Injects the loader module into target processes.
pub struct RemoteInjector {
    resolver: BitnessAddressResolver,
}

impl RemoteInjector {
    pub fn new(helpers: HelperPaths) -> Self {
        Self {
            resolver: BitnessAddressResolver::new(helpers),
        }
    }

    /// Injects the loader into `target`.
    ///
    /// Address resolution failure aborts with `Err` before any remote memory
    /// is touched. Past that point native failures (most commonly a target
    /// that already exited) degrade to `Ok(succeeded = false)`: an injection
    /// attempt never corrupts the target and never panics the host. Every
    /// remote allocation is undone on every path.
    pub fn inject(
        &self,
        target: &ProcessHandle,
        request: &InjectionRequest,
    ) -> Result<InjectionOutcome, InjectionError> {
        log::info!(
            "Injecting {} into pid {}",
            request.loader_module_path.display(),
            target.pid()
        );

        // Resolve first: a resolution failure must abort the attempt outright
        let entry = self.resolver.resolve_load_library(request.target_is_64bit)?;

        match self.run_remote_load(target, request, entry) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                log::error!("Injection into pid {} failed: {}", target.pid(), e);
                Ok(InjectionOutcome::failed())
            }
        }
    }

    fn run_remote_load(
        &self,
        target: &ProcessHandle,
        request: &InjectionRequest,
        entry: u64,
    ) -> Result<InjectionOutcome, InjectionError> {
        let path = request.loader_module_path.to_string_lossy();

        // Allocate + write the UTF-16 path; freed by Drop on every path out
        let remote_path = RemoteMemory::allocate_wide_string(target.as_handle(), &path)?;

        let thread = unsafe {
            CreateRemoteThread(
                target.as_handle(),
                None,
                0,
                Some(std::mem::transmute::<
                    *mut std::ffi::c_void,
                    unsafe extern "system" fn(*mut std::ffi::c_void) -> u32,
                >(entry as usize as *mut std::ffi::c_void)),
                Some(remote_path.as_ptr()),
                0,
                None,
            )
            .map_err(|_| InjectionError::CreateThreadFailed(std::io::Error::last_os_error()))?
        };
        let thread = unsafe { ThreadHandle::from_raw(thread) };

        log::debug!("Remote load thread created in pid {}", target.pid());

        // Timeout policy lives in the readiness phase, not here
        unsafe {
            WaitForSingleObject(thread.as_handle(), INFINITE);
        }

        let mut exit_code = 0u32;
        unsafe {
            GetExitCodeThread(thread.as_handle(), &mut exit_code)
                .map_err(|_| InjectionError::CreateThreadFailed(std::io::Error::last_os_error()))?;
        }

        if exit_code == 0 {
            log::error!(
                "Module-load call returned NULL in pid {} - loader failed to load",
                target.pid()
            );
            return Ok(InjectionOutcome::failed());
        }

        log::info!(
            "Loader mapped in pid {} (remote module handle {:#x})",
            target.pid(),
            exit_code
        );

        Ok(InjectionOutcome {
            succeeded: true,
            remote_exit_code: exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_rejects_relative_path() {
        match InjectionRequest::new(Path::new("loader32.dll"), false) {
            Err(InjectionError::RelativePath) => {}
            other => panic!("Expected RelativePath, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_request_rejects_missing_loader() {
        match InjectionRequest::new(Path::new("C:\\nonexistent\\modhost-loader.dll"), false) {
            Err(InjectionError::LoaderNotFound(_)) => {}
            other => panic!("Expected LoaderNotFound, got {:?}", other.err()),
        }
    }
}
