//! Loader injection: address resolution, remote load, readiness, workflow.

mod injector;
pub mod readiness;
mod resolver;
mod workflow;

pub use injector::{InjectionOutcome, InjectionRequest, RemoteInjector};
pub use readiness::{
    debugger_attached, read_loader_signal, readiness_segment_name, wait_for_ready,
    CancellationToken, LoaderSignal, ReadinessConfig, LOADER_SIGNAL_MAGIC, LOADER_STATE_READY,
};
pub use resolver::{
    local_load_library_address, BitnessAddressResolver, HelperPaths, ADDRESS_HANDOFF_SEGMENT,
};
pub use workflow::{LaunchAndInjectWorkflow, WorkflowStatus};
