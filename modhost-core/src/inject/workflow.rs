//! Launch-and-inject orchestration.
//!
//! Phases run strictly in order: Launch (suspended) → Inject → WaitReady →
//! Resume. The primary thread is resumed exactly once on every path out of
//! the inject/wait phases, errors included; a target is never left
//! suspended because the host hit an internal failure. Injection failure and
//! readiness timeout are reported as statuses, not errors; the workflow's
//! job is orchestration and guaranteed cleanup, not guaranteeing the loader
//! works.

use crate::error::InjectionError;
use crate::inject::injector::{InjectionOutcome, InjectionRequest, RemoteInjector};
use crate::inject::readiness::{
    debugger_attached, read_loader_signal, wait_for_ready, CancellationToken, LoaderSignal,
    ReadinessConfig,
};
use crate::process::{is_process_64bit, LaunchedProcess, ProcessHandle, ProcessLauncher};
use std::path::Path;

/// Terminal state of one launch-and-inject run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    /// The loader signalled readiness before the budget ran out.
    Ready(LoaderSignal),
    /// The remote module-load call reported failure; the target was resumed
    /// anyway and runs without the loader.
    InjectionFailed(InjectionOutcome),
    /// The loader never signalled readiness; the target was resumed anyway.
    ReadyTimedOut,
    /// The caller cancelled the readiness wait; not an error.
    Cancelled,
}

/// Drives launch → inject → wait-ready → resume for one target at a time.
///
/// Instances are independent; several may run concurrently on separate
/// threads. The only state shared between them is the injector's guarded
/// address cache.
pub struct LaunchAndInjectWorkflow<'a> {
    injector: &'a RemoteInjector,
    config: ReadinessConfig,
}

impl<'a> LaunchAndInjectWorkflow<'a> {
    pub fn new(injector: &'a RemoteInjector, config: ReadinessConfig) -> Self {
        Self { injector, config }
    }

    /// Launches `program` suspended, injects `loader_module`, waits for
    /// readiness and resumes.
    ///
    /// On errors before the inject phase begins (bad loader path, bitness
    /// query failure) the suspended child is terminated, so the caller never
    /// receives or leaks a permanently suspended process.
    pub fn launch_and_inject(
        &self,
        program: &Path,
        args: &[String],
        working_dir: Option<&Path>,
        loader_module: &Path,
        cancel: &CancellationToken,
    ) -> Result<(LaunchedProcess, WorkflowStatus), InjectionError> {
        let mut launched = ProcessLauncher::launch(program, args, working_dir)?;

        let request = match self.build_request(&launched.process, loader_module) {
            Ok(request) => request,
            Err(e) => {
                // Fully terminated beats permanently suspended
                if let Err(kill_err) = launched.process.terminate(1) {
                    log::warn!(
                        "Failed to terminate pid {} after setup error: {}",
                        launched.pid(),
                        kill_err
                    );
                }
                return Err(e);
            }
        };

        let status = self.run(&mut launched, &request, cancel)?;
        Ok((launched, status))
    }

    /// Injects into an already-launched suspended process and resumes it.
    ///
    /// Resumes the primary thread on *every* exit path, including when
    /// injection itself fails with an error.
    pub fn run(
        &self,
        launched: &mut LaunchedProcess,
        request: &InjectionRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkflowStatus, InjectionError> {
        let result = self.inject_and_wait(&launched.process, request, cancel);

        if let Err(e) = launched.main_thread.resume() {
            // Quite possible when the target died mid-flight; the injection
            // result carries the interesting failure
            log::warn!("Failed to resume pid {}: {}", launched.pid(), e);
        } else {
            log::info!("Resumed pid {}", launched.pid());
        }

        result
    }

    fn build_request(
        &self,
        target: &ProcessHandle,
        loader_module: &Path,
    ) -> Result<InjectionRequest, InjectionError> {
        let wide = is_process_64bit(target)?;
        InjectionRequest::new(loader_module, wide)
    }

    fn inject_and_wait(
        &self,
        target: &ProcessHandle,
        request: &InjectionRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkflowStatus, InjectionError> {
        let outcome = self.injector.inject(target, request)?;
        if !outcome.succeeded {
            return Ok(WorkflowStatus::InjectionFailed(outcome));
        }

        let pid = target.pid();
        let keep_waiting = || self.config.debugger_override && debugger_attached(target);

        match wait_for_ready(
            || read_loader_signal(pid),
            keep_waiting,
            &self.config,
            cancel,
        ) {
            Ok(Some(signal)) => Ok(WorkflowStatus::Ready(signal)),
            Ok(None) => Ok(WorkflowStatus::Cancelled),
            Err(InjectionError::ReadyTimedOut(ms)) => {
                log::warn!("Loader in pid {} not ready after {} ms", pid, ms);
                Ok(WorkflowStatus::ReadyTimedOut)
            }
            Err(e) => Err(e),
        }
    }
}
