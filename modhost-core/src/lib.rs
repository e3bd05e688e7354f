// Core library for loader injection and process lifecycle tracking

pub mod error;
pub mod inject;
pub mod memory;
pub mod privilege;
pub mod process;
pub mod registry;

pub use error::{InjectionError, PrivilegeError, ProcessError, RegistryError};
pub use inject::{
    BitnessAddressResolver, CancellationToken, HelperPaths, InjectionOutcome, InjectionRequest,
    LaunchAndInjectWorkflow, LoaderSignal, ReadinessConfig, RemoteInjector, WorkflowStatus,
};
pub use privilege::PrivilegeManager;
pub use process::{LaunchedProcess, ProcessEnumerator, ProcessHandle, ProcessInfo, ProcessLauncher};
pub use registry::{ProcessRegistry, RegistryEvent, RegistrySnapshot};
