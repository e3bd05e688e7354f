//! Suspended process creation.
//!
//! The target is created with `CREATE_SUSPENDED` so the loader can be
//! injected before any application code runs. Resuming the primary thread is
//! the workflow's responsibility, never the launcher's.

use crate::error::ProcessError;
use crate::process::{ProcessHandle, ThreadHandle};
use std::path::{Path, PathBuf};
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::System::Threading::{
    CreateProcessW, CREATE_SUSPENDED, PROCESS_INFORMATION, STARTUPINFOW,
};

/// A freshly launched, still-suspended process.
///
/// Owns both handles returned by process creation; the primary thread has not
/// executed a single instruction until [`ThreadHandle::resume`] runs.
pub struct LaunchedProcess {
    pub process: ProcessHandle,
    pub main_thread: ThreadHandle,
}

impl LaunchedProcess {
    pub fn pid(&self) -> u32 {
        self.process.pid()
    }
}

/// Creates target processes in a suspended state.
pub struct ProcessLauncher;

impl ProcessLauncher {
    /// Launches `program` with `args`, suspended.
    ///
    /// The working directory defaults to the executable's directory. Fails
    /// with [`ProcessError::ExecutableNotFound`] before any OS call when the
    /// path does not exist; on OS rejection no partial state is left behind.
    pub fn launch(
        program: &Path,
        args: &[String],
        working_dir: Option<&Path>,
    ) -> Result<LaunchedProcess, ProcessError> {
        if !program.exists() {
            return Err(ProcessError::ExecutableNotFound(
                program.display().to_string(),
            ));
        }

        let command_line = build_command_line(program, args);
        let dir = match working_dir {
            Some(d) => d.to_path_buf(),
            None => default_working_dir(program),
        };

        log::info!("Launching suspended: {}", command_line);
        Self::create_suspended(Some(program), &command_line, &dir)
    }

    /// Launches from a full command line, suspended.
    ///
    /// The first token (quoted or bare) names the executable and supplies the
    /// default working directory.
    pub fn launch_command_line(
        command_line: &str,
        working_dir: Option<&Path>,
    ) -> Result<LaunchedProcess, ProcessError> {
        let program = first_token(command_line);
        let dir = match working_dir {
            Some(d) => d.to_path_buf(),
            None => default_working_dir(Path::new(&program)),
        };

        log::info!("Launching suspended: {}", command_line);
        Self::create_suspended(None, command_line, &dir)
    }

    fn create_suspended(
        application: Option<&Path>,
        command_line: &str,
        working_dir: &Path,
    ) -> Result<LaunchedProcess, ProcessError> {
        let app_wide = application.map(|p| to_wide(&p.to_string_lossy()));
        let mut cmd_wide = to_wide(command_line);
        let dir_wide = to_wide(&working_dir.to_string_lossy());

        let startup_info = STARTUPINFOW {
            cb: std::mem::size_of::<STARTUPINFOW>() as u32,
            ..Default::default()
        };
        let mut process_information = PROCESS_INFORMATION::default();

        unsafe {
            CreateProcessW(
                app_wide
                    .as_ref()
                    .map(|w| PCWSTR(w.as_ptr()))
                    .unwrap_or(PCWSTR::null()),
                Some(PWSTR(cmd_wide.as_mut_ptr())),
                None,
                None,
                false,
                CREATE_SUSPENDED,
                None,
                PCWSTR(dir_wide.as_ptr()),
                &startup_info,
                &mut process_information,
            )
            .map_err(|_| ProcessError::StartFailed(std::io::Error::last_os_error()))?;
        }

        log::info!(
            "Created suspended process, pid {}",
            process_information.dwProcessId
        );

        Ok(LaunchedProcess {
            process: unsafe {
                ProcessHandle::from_raw(
                    process_information.hProcess,
                    process_information.dwProcessId,
                )
            },
            main_thread: unsafe { ThreadHandle::from_raw(process_information.hThread) },
        })
    }
}

fn default_working_dir(program: &Path) -> PathBuf {
    program
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Builds a command line in the convention `CreateProcessW` targets parse:
/// the program quoted, arguments quoted when they contain whitespace or
/// quotes, embedded quotes backslash-escaped.
fn build_command_line(program: &Path, args: &[String]) -> String {
    let mut line = format!("\"{}\"", program.display());

    for arg in args {
        line.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) || arg.contains('"') {
            line.push('"');
            line.push_str(&arg.replace('"', "\\\""));
            line.push('"');
        } else {
            line.push_str(arg);
        }
    }

    line
}

fn first_token(command_line: &str) -> String {
    let trimmed = command_line.trim_start();
    if let Some(rest) = trimmed.strip_prefix('"') {
        rest.chars().take_while(|&c| c != '"').collect()
    } else {
        trimmed.chars().take_while(|c| !c.is_whitespace()).collect()
    }
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use windows::Win32::Foundation::{WAIT_OBJECT_0, WAIT_TIMEOUT};
    use windows::Win32::System::Threading::WaitForSingleObject;

    fn cmd_exe() -> PathBuf {
        std::env::var("ComSpec")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Windows\\System32\\cmd.exe"))
    }

    #[test]
    fn test_build_command_line_quoting() {
        let line = build_command_line(
            Path::new("C:\\Games\\my game.exe"),
            &["plain".into(), "with space".into(), "has\"quote".into()],
        );

        assert_eq!(
            line,
            "\"C:\\Games\\my game.exe\" plain \"with space\" \"has\\\"quote\""
        );
    }

    #[test]
    fn test_first_token() {
        assert_eq!(first_token("\"C:\\a b\\x.exe\" -f"), "C:\\a b\\x.exe");
        assert_eq!(first_token("x.exe -f"), "x.exe");
    }

    #[test]
    fn test_launch_missing_executable() {
        let result = ProcessLauncher::launch(
            Path::new("C:\\nonexistent\\modhost-no-such.exe"),
            &[],
            None,
        );

        match result {
            Err(ProcessError::ExecutableNotFound(_)) => {}
            other => panic!("Expected ExecutableNotFound, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_launch_is_suspended_until_resumed() {
        let mut launched =
            ProcessLauncher::launch(&cmd_exe(), &["/c".into(), "exit".into()], None)
                .expect("Launch should succeed");

        // Suspended: the process must not run to completion on its own
        let waited = unsafe { WaitForSingleObject(launched.process.as_handle(), 250) };
        assert_eq!(waited, WAIT_TIMEOUT, "Suspended process must not exit");
        assert!(launched.process.is_alive());
        assert!(!launched.main_thread.is_resumed());

        launched.main_thread.resume().expect("Resume should succeed");
        assert!(launched.main_thread.is_resumed());

        let waited = unsafe { WaitForSingleObject(launched.process.as_handle(), 5000) };
        assert_eq!(waited, WAIT_OBJECT_0, "Resumed process should exit");
    }

    #[test]
    fn test_launch_cleanup_on_kill() {
        let launched = ProcessLauncher::launch(&cmd_exe(), &[], None).expect("Launch");

        launched.process.terminate(1).expect("Terminate");

        let waited = unsafe { WaitForSingleObject(launched.process.as_handle(), 5000) };
        assert_eq!(waited, WAIT_OBJECT_0);
        assert!(!launched.process.is_alive());
    }
}
