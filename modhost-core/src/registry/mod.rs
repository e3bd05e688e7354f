//! Live tracking of processes launched from a given executable.
//!
//! Built once by full enumeration, then kept current by a watch strategy
//! running on a dedicated background thread. The tracked set lives under a
//! single mutex; observer callbacks run with no registry lock held (tracked
//! set released, observer list snapshotted) so subscriber code can re-enter
//! the registry without deadlocking.

pub mod watch;
pub mod wmi_watch;

use crate::error::RegistryError;
use crate::inject::CancellationToken;
use crate::privilege::PrivilegeManager;
use crate::process::{modules, query_image_path, ProcessEnumerator, ProcessHandle};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use windows::Win32::System::Threading::{PROCESS_QUERY_LIMITED_INFORMATION, SYNCHRONIZE};

pub use watch::{diff_pid_sets, ProcessWatch, SnapshotPollingWatch, WatchEvent};
pub use wmi_watch::WmiProcessWatch;

/// Tracked processes partitioned by loader presence.
///
/// Classification is probed live on every snapshot request, never cached, so
/// it follows injections that happened after tracking began.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub tagged: Vec<u32>,
    pub untagged: Vec<u32>,
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added { pid: u32, current: Vec<u32> },
    Removed { pid: u32, current: Vec<u32> },
}

type Observer = Arc<dyn Fn(&RegistryEvent) + Send + Sync + 'static>;

struct RegistryInner {
    exe_path_lower: String,
    loader_module_name: String,
    tracked: Mutex<HashMap<u32, ProcessHandle>>,
    observers: Mutex<Vec<Observer>>,
}

/// Maintains the live set of processes matching one executable path.
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
    stop: CancellationToken,
    watch_thread: Option<std::thread::JoinHandle<()>>,
}

impl ProcessRegistry {
    /// Builds the registry with an explicit watch strategy.
    ///
    /// Enumerates all running processes once, retaining those whose resolved
    /// executable path matches `exe_path` case-insensitively, then starts
    /// the watch on its own thread.
    pub fn new(
        exe_path: &Path,
        loader_module_name: &str,
        mut watch: Box<dyn ProcessWatch>,
    ) -> Result<Self, RegistryError> {
        let inner = Arc::new(RegistryInner {
            exe_path_lower: exe_path.to_string_lossy().to_lowercase(),
            loader_module_name: loader_module_name.to_string(),
            tracked: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        });

        // Baseline first, then the one-time full enumeration: a process that
        // starts in between is seen by both, and on_started never double-adds
        watch.prime()?;
        let initial = ProcessEnumerator::find_by_path(exe_path)?;
        {
            let mut tracked = inner.tracked.lock().unwrap();
            for info in initial {
                match ProcessHandle::open(
                    info.pid,
                    PROCESS_QUERY_LIMITED_INFORMATION | SYNCHRONIZE,
                ) {
                    Ok(handle) => {
                        tracked.insert(info.pid, handle);
                    }
                    Err(e) => {
                        // Likely exited between snapshot and open
                        log::debug!("Skipping pid {} during initial scan: {}", info.pid, e);
                    }
                }
            }
            log::info!(
                "Registry for {} starts with {} tracked process(es)",
                inner.exe_path_lower,
                tracked.len()
            );
        }

        let stop = CancellationToken::new();
        let thread_inner = Arc::clone(&inner);
        let thread_stop = stop.clone();
        let watch_name = watch.name();

        let watch_thread = std::thread::Builder::new()
            .name("modhost-registry-watch".into())
            .spawn(move || {
                let result = watch.run(
                    &mut |event| thread_inner.handle_watch_event(event),
                    &thread_stop,
                );
                if let Err(e) = result {
                    log::error!("Process watch '{}' stopped with error: {}", watch_name, e);
                }
            })
            .map_err(RegistryError::WatchSpawnFailed)?;

        Ok(Self {
            inner,
            stop,
            watch_thread: Some(watch_thread),
        })
    }

    /// Builds the registry with the strategy matching the current privilege
    /// level: WMI events when elevated, snapshot polling otherwise.
    ///
    /// The choice is made exactly once, here.
    pub fn with_default_watch(
        exe_path: &Path,
        loader_module_name: &str,
        poll_interval: Duration,
    ) -> Result<Self, RegistryError> {
        let elevated = PrivilegeManager::is_elevated().unwrap_or(false);

        let watch: Box<dyn ProcessWatch> = if elevated {
            log::info!("Elevated: using WMI process notifications");
            Box::new(WmiProcessWatch::new())
        } else {
            log::info!("Not elevated: using snapshot polling");
            Box::new(SnapshotPollingWatch::new(poll_interval))
        };

        Self::new(exe_path, loader_module_name, watch)
    }

    /// Registers a change observer. Callbacks run on the watch thread with
    /// no registry lock held, so a callback may call back into the registry,
    /// `subscribe` included.
    pub fn subscribe(&self, observer: impl Fn(&RegistryEvent) + Send + Sync + 'static) {
        self.inner.observers.lock().unwrap().push(Arc::new(observer));
    }

    /// Currently tracked pids, unclassified.
    pub fn tracked_pids(&self) -> Vec<u32> {
        let tracked = self.inner.tracked.lock().unwrap();
        tracked.keys().copied().collect()
    }

    /// Partitions the tracked set into loader-tagged and untagged.
    pub fn snapshot(&self) -> RegistrySnapshot {
        // Copy the pid set out, then probe without holding the mutex: the
        // module probe can block and must not stall the watch thread
        let pids = self.tracked_pids();

        let mut snapshot = RegistrySnapshot::default();
        for pid in pids {
            if modules::has_module(pid, &self.inner.loader_module_name) {
                snapshot.tagged.push(pid);
            } else {
                snapshot.untagged.push(pid);
            }
        }

        snapshot
    }
}

impl Drop for ProcessRegistry {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(thread) = self.watch_thread.take() {
            let _ = thread.join();
        }
    }
}

impl RegistryInner {
    fn handle_watch_event(&self, event: WatchEvent) {
        let notification = match event {
            WatchEvent::Started(pid) => self.on_started(pid),
            WatchEvent::Stopped(pid) => self.on_stopped(pid),
        };

        // Dispatch after the tracked mutex is released
        if let Some(notification) = notification {
            self.notify(&notification);
        }
    }

    /// Returns the notification to dispatch, or None when the event does not
    /// concern this registry.
    fn on_started(&self, pid: u32) -> Option<RegistryEvent> {
        if !self.path_matches(pid) {
            return None;
        }

        let mut tracked = self.tracked.lock().unwrap();
        if tracked.contains_key(&pid) {
            // A live pid is never reported as added twice
            return None;
        }

        let handle = match ProcessHandle::open(
            pid,
            PROCESS_QUERY_LIMITED_INFORMATION | SYNCHRONIZE,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                log::debug!("Matched pid {} vanished before open: {}", pid, e);
                return None;
            }
        };

        tracked.insert(pid, handle);
        let current = tracked.keys().copied().collect();
        drop(tracked);

        log::info!("Tracking new process {}", pid);
        Some(RegistryEvent::Added { pid, current })
    }

    fn on_stopped(&self, pid: u32) -> Option<RegistryEvent> {
        let mut tracked = self.tracked.lock().unwrap();
        if tracked.remove(&pid).is_none() {
            // Never tracked (filtered out originally); removal is a no-op
            return None;
        }
        let current = tracked.keys().copied().collect();
        drop(tracked);

        log::info!("Tracked process {} exited", pid);
        Some(RegistryEvent::Removed { pid, current })
    }

    fn path_matches(&self, pid: u32) -> bool {
        match query_image_path(pid) {
            Some(path) => path.to_string_lossy().to_lowercase() == self.exe_path_lower,
            None => false,
        }
    }

    fn notify(&self, event: &RegistryEvent) {
        // Snapshot the list and release the lock before dispatch, so a
        // callback may subscribe without deadlocking
        let observers: Vec<Observer> = self.observers.lock().unwrap().clone();
        for observer in observers {
            observer(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn test_inner(exe_path_lower: String) -> Arc<RegistryInner> {
        Arc::new(RegistryInner {
            exe_path_lower,
            loader_module_name: "kernel32.dll".into(),
            tracked: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        })
    }

    fn own_path_lower() -> String {
        std::env::current_exe()
            .unwrap()
            .to_string_lossy()
            .to_lowercase()
    }

    #[test]
    fn test_started_event_tracks_matching_process() {
        let inner = test_inner(own_path_lower());
        let own_pid = std::process::id();

        let (tx, rx) = mpsc::channel();
        inner.observers.lock().unwrap().push(Arc::new(move |e: &RegistryEvent| {
            tx.send(e.clone()).unwrap();
        }));

        inner.handle_watch_event(WatchEvent::Started(own_pid));

        assert!(inner.tracked.lock().unwrap().contains_key(&own_pid));
        match rx.try_recv().expect("An Added notification must fire") {
            RegistryEvent::Added { pid, current } => {
                assert_eq!(pid, own_pid);
                assert_eq!(current, vec![own_pid]);
            }
            other => panic!("Expected Added, got {:?}", other),
        }

        // A live pid is never added twice
        inner.handle_watch_event(WatchEvent::Started(own_pid));
        assert!(rx.try_recv().is_err(), "No repeated Added for a live pid");
    }

    #[test]
    fn test_started_event_ignores_non_matching_path() {
        let inner = test_inner("c:\\some\\other\\game.exe".into());

        inner.handle_watch_event(WatchEvent::Started(std::process::id()));

        assert!(inner.tracked.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stopped_event_removal_is_idempotent() {
        let inner = test_inner(own_path_lower());
        let own_pid = std::process::id();

        let (tx, rx) = mpsc::channel();
        inner.observers.lock().unwrap().push(Arc::new(move |e: &RegistryEvent| {
            tx.send(e.clone()).unwrap();
        }));

        inner.handle_watch_event(WatchEvent::Started(own_pid));
        let _ = rx.try_recv();

        inner.handle_watch_event(WatchEvent::Stopped(own_pid));
        match rx.try_recv().expect("A Removed notification must fire") {
            RegistryEvent::Removed { pid, current } => {
                assert_eq!(pid, own_pid);
                assert!(current.is_empty());
            }
            other => panic!("Expected Removed, got {:?}", other),
        }

        // Removing an untracked pid is a silent no-op
        inner.handle_watch_event(WatchEvent::Stopped(own_pid));
        inner.handle_watch_event(WatchEvent::Stopped(999_999));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_observer_can_subscribe_from_callback() {
        let inner = test_inner(own_path_lower());
        let own_pid = std::process::id();

        // The first observer registers a second one from inside its callback;
        // dispatch must not hold the observer-list lock
        let (tx, rx) = mpsc::channel();
        let reentrant = Arc::clone(&inner);
        inner
            .observers
            .lock()
            .unwrap()
            .push(Arc::new(move |_e: &RegistryEvent| {
                let tx = tx.clone();
                reentrant
                    .observers
                    .lock()
                    .unwrap()
                    .push(Arc::new(move |e: &RegistryEvent| {
                        let _ = tx.send(e.clone());
                    }));
            }));

        inner.handle_watch_event(WatchEvent::Started(own_pid));
        inner.handle_watch_event(WatchEvent::Stopped(own_pid));

        match rx.try_recv().expect("The late subscriber must see the next event") {
            RegistryEvent::Removed { pid, .. } => assert_eq!(pid, own_pid),
            other => panic!("Expected Removed, got {:?}", other),
        }
    }

    #[test]
    fn test_registry_tracks_self_and_classifies() {
        // Our own process, with kernel32 posing as the loader module: the
        // current process must show up tagged
        let own_path = std::env::current_exe().unwrap();
        let registry = ProcessRegistry::new(
            &own_path,
            "kernel32.dll",
            Box::new(SnapshotPollingWatch::new(Duration::from_millis(50))),
        )
        .expect("Registry construction");

        let own_pid = std::process::id();
        assert!(registry.tracked_pids().contains(&own_pid));

        let snapshot = registry.snapshot();
        assert!(snapshot.tagged.contains(&own_pid));

        // With a module name nothing has loaded, the same process is untagged
        let registry = ProcessRegistry::new(
            &own_path,
            "modhost-never-loaded.dll",
            Box::new(SnapshotPollingWatch::new(Duration::from_millis(50))),
        )
        .expect("Registry construction");

        let snapshot = registry.snapshot();
        assert!(snapshot.untagged.contains(&own_pid));
        assert!(!snapshot.tagged.contains(&own_pid));
    }
}
