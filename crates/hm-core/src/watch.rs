//! Directory watch mode.
//!
//! Polls one directory (non-recursively) for export documents and reports a
//! file once its size has held steady for a number of consecutive polls.
//!
//! ```text
//! poll() ──► scan directory
//!              ├─ NEW       → track, unstable (or baseline on first scan)
//!              ├─ CHANGED   → reset stability, eligible again
//!              ├─ UNCHANGED → bump stability; ready once it reaches the limit
//!              └─ GONE      → forget (warn if it never became ready)
//! ```
//!
//! Files present when the watcher starts form the baseline and are only
//! reported after they change.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, info, warn};

/// File name suffixes picked up by the watcher.
pub const EXPORT_SUFFIXES: [&str; 2] = ["_data.xml", "_data.xml.gz"];

/// Whether a file name looks like an export document.
pub fn is_export_name(name: &str) -> bool {
    EXPORT_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("cannot scan {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Polling knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    /// Pause between directory scans.
    pub interval: Duration,
    /// Consecutive unchanged polls before a file counts as complete.
    pub stable_polls: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            stable_polls: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    len: u64,
    modified: Option<SystemTime>,
}

#[derive(Debug, Clone)]
struct Tracked {
    snapshot: Snapshot,
    unchanged_polls: u32,
    /// Already reported (or baseline) for the current snapshot.
    settled: bool,
}

/// Size-stability tracker over one directory.
pub struct DirectoryWatcher {
    dir: PathBuf,
    config: WatchConfig,
    files: HashMap<PathBuf, Tracked>,
}

impl DirectoryWatcher {
    /// Start watching `dir`; files already there become the baseline.
    pub fn new(dir: impl Into<PathBuf>, config: WatchConfig) -> Result<Self, WatchError> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(WatchError::NotADirectory(dir));
        }
        let config = WatchConfig {
            stable_polls: config.stable_polls.max(1),
            ..config
        };
        let mut watcher = Self {
            dir,
            config,
            files: HashMap::new(),
        };
        for (path, snapshot) in watcher.scan()? {
            watcher.files.insert(
                path,
                Tracked {
                    snapshot,
                    unchanged_polls: 0,
                    settled: true,
                },
            );
        }
        debug!(dir = %watcher.dir.display(), baseline = watcher.files.len(), "watch baseline taken");
        Ok(watcher)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> WatchConfig {
        self.config
    }

    /// Scan once and return the files that just became complete, sorted.
    pub fn poll(&mut self) -> Result<Vec<PathBuf>, WatchError> {
        let current = self.scan()?;
        let present: HashSet<&PathBuf> = current.iter().map(|(path, _)| path).collect();
        self.files.retain(|path, tracked| {
            let keep = present.contains(path);
            if !keep && !tracked.settled {
                warn!(path = %path.display(), "file disappeared before it was complete");
            }
            keep
        });

        let mut ready = Vec::new();
        for (path, snapshot) in current {
            match self.files.get_mut(&path) {
                None => {
                    debug!(path = %path.display(), len = snapshot.len, "new export file");
                    self.files.insert(
                        path,
                        Tracked {
                            snapshot,
                            unchanged_polls: 0,
                            settled: false,
                        },
                    );
                }
                Some(tracked) if tracked.snapshot != snapshot => {
                    tracked.snapshot = snapshot;
                    tracked.unchanged_polls = 0;
                    tracked.settled = false;
                }
                Some(tracked) if tracked.settled || snapshot.len == 0 => {}
                Some(tracked) => {
                    tracked.unchanged_polls += 1;
                    if tracked.unchanged_polls >= self.config.stable_polls {
                        tracked.settled = true;
                        ready.push(path);
                    }
                }
            }
        }
        ready.sort();
        Ok(ready)
    }

    /// Poll until `should_stop` returns true, handing each complete file to
    /// `on_ready`. Scan failures are logged and retried on the next poll.
    pub fn run_until<F, S>(&mut self, mut on_ready: F, mut should_stop: S)
    where
        F: FnMut(&Path),
        S: FnMut() -> bool,
    {
        info!(
            dir = %self.dir.display(),
            interval_ms = self.config.interval.as_millis() as u64,
            stable_polls = self.config.stable_polls,
            "watching for export files"
        );
        loop {
            match self.poll() {
                Ok(ready) => {
                    for path in ready {
                        info!(path = %path.display(), "export file complete");
                        on_ready(&path);
                    }
                }
                Err(e) => warn!(error = %e, "directory scan failed"),
            }
            if should_stop() {
                break;
            }
            std::thread::sleep(self.config.interval);
        }
    }

    fn scan(&self) -> Result<Vec<(PathBuf, Snapshot)>, WatchError> {
        let scan_error = |source| WatchError::Scan {
            path: self.dir.clone(),
            source,
        };
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(scan_error)? {
            let entry = entry.map_err(scan_error)?;
            let name = entry.file_name();
            if !name.to_str().is_some_and(is_export_name) {
                continue;
            }
            // Vanished between listing and stat.
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            found.push((
                entry.path(),
                Snapshot {
                    len: meta.len(),
                    modified: meta.modified().ok(),
                },
            ));
        }
        Ok(found)
    }
}
