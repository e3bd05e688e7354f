// Error types for launch, injection and registry operations

use thiserror::Error;

/// Errors related to process operations
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Failed to create process")]
    StartFailed(#[source] std::io::Error),

    #[error("Failed to create process snapshot")]
    SnapshotFailed(#[source] std::io::Error),

    #[error("Failed to enumerate processes")]
    EnumerationFailed(#[source] std::io::Error),

    #[error("Process not found: {0}")]
    ProcessNotFound(u32),

    #[error("Failed to open process handle")]
    OpenProcessFailed(#[source] std::io::Error),

    #[error("Failed to duplicate process handle")]
    DuplicateHandleFailed(#[source] std::io::Error),

    #[error("Invalid process handle")]
    InvalidHandle,

    #[error("Failed to resume thread")]
    ResumeFailed(#[source] std::io::Error),

    #[error("Failed to terminate process")]
    TerminateFailed(#[source] std::io::Error),

    #[error("Failed to enumerate modules of process {0}")]
    ModuleSnapshotFailed(u32, #[source] std::io::Error),
}

/// Errors related to loader injection
#[derive(Debug, Error)]
pub enum InjectionError {
    #[error("Process operation failed")]
    ProcessError(#[from] ProcessError),

    #[error("Loader module not found: {0}")]
    LoaderNotFound(String),

    #[error("Loader module path must be absolute")]
    RelativePath,

    #[error("No bitness helper executable configured for {0}-bit resolution")]
    HelperNotConfigured(u32),

    #[error("Failed to resolve module-load entry point ({0})")]
    AddressResolutionFailed(String),

    #[error("Failed to allocate memory in target process")]
    MemoryAllocationFailed(#[source] std::io::Error),

    #[error("Failed to write to process memory")]
    MemoryWriteFailed(#[source] std::io::Error),

    #[error("Failed to create remote thread")]
    CreateThreadFailed(#[source] std::io::Error),

    #[error("Loader did not signal readiness within {0} ms")]
    ReadyTimedOut(u32),

    #[error("Failed to open shared memory segment: {0}")]
    SharedMemoryFailed(String),
}

/// Errors related to the process registry and its watch strategies
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Process operation failed")]
    ProcessError(#[from] ProcessError),

    #[error("Failed to connect to the WMI event source")]
    WmiConnectFailed(#[source] windows::core::Error),

    #[error("WMI notification query failed")]
    WmiQueryFailed(#[source] windows::core::Error),

    #[error("Failed to spawn the watch thread")]
    WatchSpawnFailed(#[source] std::io::Error),
}

/// Errors that can occur during privilege operations.
#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("Failed to open process token")]
    OpenTokenFailed(#[source] std::io::Error),

    #[error("Failed to lookup privilege value")]
    LookupPrivilegeFailed(#[source] std::io::Error),

    #[error("Failed to adjust token privileges")]
    AdjustPrivilegeFailed(#[source] std::io::Error),

    #[error("Failed to create well-known SID")]
    SidCreationFailed(#[source] std::io::Error),

    #[error("Failed to check token membership")]
    MembershipCheckFailed(#[source] std::io::Error),

    #[error("Not running as administrator")]
    NotAdministrator,
}
