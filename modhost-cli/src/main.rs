//! CLI front end: launch-and-inject, process watching, address resolution.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use modhost_core::registry::RegistryEvent;
use modhost_core::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "modhost")]
#[command(about = "Loader injection host for game processes", long_about = None)]
struct Args {
    /// Optional JSON config file with defaults for loader/helper paths and timing
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch an executable suspended, inject the loader and wait for readiness
    Launch {
        /// Path to the target executable
        exe: PathBuf,

        /// Arguments passed to the target
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,

        /// Working directory (defaults to the executable's directory)
        #[arg(long, value_name = "DIR")]
        working_dir: Option<PathBuf>,

        /// 32-bit loader module path
        #[arg(long, value_name = "DLL")]
        loader32: Option<PathBuf>,

        /// 64-bit loader module path
        #[arg(long, value_name = "DLL")]
        loader64: Option<PathBuf>,

        /// 32-bit address helper executable
        #[arg(long, value_name = "EXE")]
        helper32: Option<PathBuf>,

        /// 64-bit address helper executable
        #[arg(long, value_name = "EXE")]
        helper64: Option<PathBuf>,

        /// Readiness timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u32>,

        /// Readiness poll interval in milliseconds
        #[arg(long)]
        poll_ms: Option<u32>,
    },

    /// Track processes launched from an executable and report loader presence
    Watch {
        /// Absolute path of the executable to track
        exe: PathBuf,

        /// Loader module file name used for tagged/untagged classification
        #[arg(long, default_value = "modhost_loader.dll")]
        loader_name: String,

        /// Poll interval for the non-elevated watch, in milliseconds
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,
    },

    /// List running processes, optionally filtered by name
    List {
        /// Case-insensitive substring to match against process names
        name: Option<String>,
    },

    /// Resolve the module-load entry point for a bitness (diagnostic)
    Resolve {
        /// Resolve for 64-bit targets instead of 32-bit
        #[arg(long)]
        wide: bool,

        #[arg(long, value_name = "EXE")]
        helper32: Option<PathBuf>,

        #[arg(long, value_name = "EXE")]
        helper64: Option<PathBuf>,
    },
}

/// Defaults loaded from the optional JSON config file; explicit flags win.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct HostConfig {
    timeout_ms: Option<u32>,
    poll_interval_ms: Option<u32>,
    loader32: Option<PathBuf>,
    loader64: Option<PathBuf>,
    helper32: Option<PathBuf>,
    helper64: Option<PathBuf>,
}

impl HostConfig {
    fn load(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing config {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = HostConfig::load(args.config.as_ref())?;

    match args.command {
        Command::Launch {
            exe,
            args,
            working_dir,
            loader32,
            loader64,
            helper32,
            helper64,
            timeout_ms,
            poll_ms,
        } => run_launch(
            &exe,
            &args,
            working_dir.as_deref(),
            loader32.or(config.loader32.clone()),
            loader64.or(config.loader64.clone()),
            helper32.or(config.helper32.clone()),
            helper64.or(config.helper64.clone()),
            timeout_ms.or(config.timeout_ms),
            poll_ms.or(config.poll_interval_ms),
        ),
        Command::Watch {
            exe,
            loader_name,
            poll_ms,
        } => run_watch(&exe, &loader_name, poll_ms),
        Command::List { name } => run_list(name.as_deref()),
        Command::Resolve {
            wide,
            helper32,
            helper64,
        } => run_resolve(
            wide,
            helper32.or(config.helper32.clone()),
            helper64.or(config.helper64.clone()),
        ),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_launch(
    exe: &std::path::Path,
    args: &[String],
    working_dir: Option<&std::path::Path>,
    loader32: Option<PathBuf>,
    loader64: Option<PathBuf>,
    helper32: Option<PathBuf>,
    helper64: Option<PathBuf>,
    timeout_ms: Option<u32>,
    poll_ms: Option<u32>,
) -> anyhow::Result<()> {
    let readiness = ReadinessConfig::new(timeout_ms.unwrap_or(30_000), poll_ms.unwrap_or(32));
    let timeout_ms = readiness.timeout_ms;
    let injector = RemoteInjector::new(HelperPaths {
        helper_32: helper32,
        helper_64: helper64,
    });
    let workflow = LaunchAndInjectWorkflow::new(&injector, readiness);

    let mut launched = ProcessLauncher::launch(exe, args, working_dir)?;
    println!("Launched pid {} (suspended)", launched.pid());

    // The loader binary must match the target's bitness
    let wide = process::is_process_64bit(&launched.process)?;
    let loader = if wide { loader64 } else { loader32 };
    let Some(loader) = loader else {
        launched.process.terminate(1).ok();
        bail!(
            "No {}-bit loader module configured for this target",
            if wide { 64 } else { 32 }
        );
    };

    let request = match InjectionRequest::new(&loader, wide) {
        Ok(request) => request,
        Err(e) => {
            launched.process.terminate(1).ok();
            return Err(e.into());
        }
    };

    let status = workflow.run(&mut launched, &request, &CancellationToken::new())?;

    match status {
        WorkflowStatus::Ready(_) => {
            println!("Loader ready in pid {}", launched.pid());
            Ok(())
        }
        WorkflowStatus::InjectionFailed(outcome) => {
            bail!(
                "Injection failed in pid {} (remote exit code {})",
                launched.pid(),
                outcome.remote_exit_code
            )
        }
        WorkflowStatus::ReadyTimedOut => {
            bail!(
                "Loader in pid {} did not become ready within {} ms",
                launched.pid(),
                timeout_ms
            )
        }
        WorkflowStatus::Cancelled => {
            println!("Cancelled");
            Ok(())
        }
    }
}

fn run_watch(exe: &std::path::Path, loader_name: &str, poll_ms: u64) -> anyhow::Result<()> {
    if !exe.is_absolute() {
        bail!("The watched executable path must be absolute");
    }

    // Elevated hosts get WMI notifications and may open foreign processes
    if PrivilegeManager::is_elevated().unwrap_or(false) {
        if let Err(e) = PrivilegeManager::enable_debug_privilege() {
            log::warn!("Could not enable SeDebugPrivilege: {}", e);
        }
    }

    let registry =
        ProcessRegistry::with_default_watch(exe, loader_name, Duration::from_millis(poll_ms))?;

    registry.subscribe(|event| match event {
        RegistryEvent::Added { pid, current } => {
            println!("+ pid {} (now tracking {})", pid, current.len());
        }
        RegistryEvent::Removed { pid, current } => {
            println!("- pid {} (now tracking {})", pid, current.len());
        }
    });

    println!("Watching {} - press Ctrl+C to stop", exe.display());

    loop {
        std::thread::sleep(Duration::from_secs(2));
        let snapshot = registry.snapshot();
        println!(
            "tagged: {:?}  untagged: {:?}",
            snapshot.tagged, snapshot.untagged
        );
    }
}

fn run_list(name: Option<&str>) -> anyhow::Result<()> {
    let mut processes = match name {
        Some(name) => ProcessEnumerator::find_by_name(name)?,
        None => ProcessEnumerator::enumerate()?,
    };

    processes.sort_by_key(|p| p.pid);
    for mut process in processes {
        process.try_get_path();
        println!("{}", process);
    }
    Ok(())
}

fn run_resolve(
    wide: bool,
    helper32: Option<PathBuf>,
    helper64: Option<PathBuf>,
) -> anyhow::Result<()> {
    let resolver = BitnessAddressResolver::new(HelperPaths {
        helper_32: helper32,
        helper_64: helper64,
    });

    let address = resolver.resolve_load_library(wide)?;
    println!(
        "LoadLibraryW for {}-bit targets: {:#x}",
        if wide { 64 } else { 32 },
        address
    );
    Ok(())
}
