//! Process watch strategies.
//!
//! One capability, two interchangeable implementations: snapshot polling
//! (works at any privilege level) here, and the WMI event subscription
//! (elevated only) in `wmi_watch`. The registry picks one at startup via a
//! privilege probe and never mixes them.

use crate::error::RegistryError;
use crate::inject::CancellationToken;
use crate::process::ProcessEnumerator;
use std::collections::HashSet;
use std::time::Duration;

/// A system-wide process lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Started(u32),
    Stopped(u32),
}

/// Source of system-wide process start/stop events.
///
/// `run` executes on the registry's dedicated background thread until `stop`
/// is cancelled or the source fails.
pub trait ProcessWatch: Send {
    fn name(&self) -> &'static str;

    /// Captures the strategy's baseline synchronously, before the registry's
    /// initial enumeration runs. A process that starts after `prime` but
    /// before `run` must still surface as `Started`.
    fn prime(&mut self) -> Result<(), RegistryError> {
        Ok(())
    }

    fn run(
        &mut self,
        emit: &mut dyn FnMut(WatchEvent),
        stop: &CancellationToken,
    ) -> Result<(), RegistryError>;
}

/// Non-elevated strategy: periodic pid-snapshot diffing.
pub struct SnapshotPollingWatch {
    interval: Duration,
    baseline: Option<HashSet<u32>>,
}

impl SnapshotPollingWatch {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            baseline: None,
        }
    }
}

impl ProcessWatch for SnapshotPollingWatch {
    fn name(&self) -> &'static str {
        "snapshot-polling"
    }

    fn prime(&mut self) -> Result<(), RegistryError> {
        self.baseline = Some(ProcessEnumerator::pid_snapshot()?);
        Ok(())
    }

    fn run(
        &mut self,
        emit: &mut dyn FnMut(WatchEvent),
        stop: &CancellationToken,
    ) -> Result<(), RegistryError> {
        // A primed baseline predates the registry's initial enumeration, so
        // starts in between still get diffed in as Started
        let mut previous = match self.baseline.take() {
            Some(baseline) => baseline,
            None => ProcessEnumerator::pid_snapshot()?,
        };

        loop {
            if stop.wait(self.interval) {
                return Ok(());
            }

            let current = match ProcessEnumerator::pid_snapshot() {
                Ok(current) => current,
                Err(e) => {
                    // Transient snapshot failures keep the last known state
                    log::warn!("Pid snapshot failed, retrying: {}", e);
                    continue;
                }
            };

            let (added, removed) = diff_pid_sets(&previous, &current);
            for pid in added {
                emit(WatchEvent::Started(pid));
            }
            for pid in removed {
                emit(WatchEvent::Stopped(pid));
            }

            previous = current;
        }
    }
}

/// Computes which pids appeared and which disappeared between two snapshots.
pub fn diff_pid_sets(old: &HashSet<u32>, new: &HashSet<u32>) -> (Vec<u32>, Vec<u32>) {
    let added = new.difference(old).copied().collect();
    let removed = old.difference(new).copied().collect();
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(pids: &[u32]) -> HashSet<u32> {
        pids.iter().copied().collect()
    }

    #[test]
    fn test_diff_detects_added_and_removed() {
        let (mut added, mut removed) = diff_pid_sets(&set(&[1, 2, 3]), &set(&[2, 3, 4, 5]));
        added.sort_unstable();
        removed.sort_unstable();

        assert_eq!(added, vec![4, 5]);
        assert_eq!(removed, vec![1]);
    }

    #[test]
    fn test_diff_identical_sets_is_empty() {
        let (added, removed) = diff_pid_sets(&set(&[7, 8]), &set(&[7, 8]));
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn test_primed_baseline_catches_pre_run_starts() {
        use crate::process::ProcessLauncher;
        use std::path::PathBuf;
        use std::sync::mpsc;

        let mut watch = SnapshotPollingWatch::new(Duration::from_millis(20));
        watch.prime().expect("prime");

        // Started after the baseline but before the watch loop runs; it must
        // still be diffed in as Started
        let cmd_exe = std::env::var("ComSpec")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Windows\\System32\\cmd.exe"));
        let launched = ProcessLauncher::launch(&cmd_exe, &[], None).expect("Launch");
        let child_pid = launched.pid();

        let stop = CancellationToken::new();
        let watch_stop = stop.clone();
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let _ = watch.run(
                &mut |event| {
                    let _ = tx.send(event);
                },
                &watch_stop,
            );
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut seen = false;
        while std::time::Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(WatchEvent::Started(pid)) if pid == child_pid => {
                    seen = true;
                    break;
                }
                _ => continue,
            }
        }

        stop.cancel();
        handle.join().expect("Watch thread should join");
        launched.process.terminate(0).ok();

        assert!(seen, "A start between prime and run must surface as Started");
    }

    #[test]
    fn test_polling_watch_observes_stop() {
        let watch_stop = CancellationToken::new();
        let stop = watch_stop.clone();

        let handle = std::thread::spawn(move || {
            let mut watch = SnapshotPollingWatch::new(Duration::from_millis(20));
            let mut events = Vec::new();
            watch
                .run(&mut |e| events.push(e), &stop)
                .expect("Watch should exit cleanly");
        });

        std::thread::sleep(Duration::from_millis(100));
        watch_stop.cancel();
        handle.join().expect("Watch thread should join");
    }
}
