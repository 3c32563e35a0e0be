//! Per-process and per-file behavioral state

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Accumulated activity for one (pid, path) pair.
///
/// Exists only for files the pid discovered by listing their parent
/// directory first, whose size at discovery was non-zero (or whose stat
/// failed, recorded as -1: the file vanished before inspection but its
/// reads and terminal event still define the outcome).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProfile {
    /// stat size when first observed; -1 when the stat failed.
    pub size_at_discovery: i64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl FileProfile {
    pub fn new(size_at_discovery: i64) -> Self {
        Self {
            size_at_discovery,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Whether the pid has read at least as many bytes as the file held
    /// when discovered. Trivially true for a vanished file (-1).
    pub fn fully_read(&self) -> bool {
        self.bytes_read as i64 >= self.size_at_discovery
    }

    /// Whether the pid has written the file over completely.
    pub fn fully_written(&self) -> bool {
        self.bytes_written as i64 >= self.size_at_discovery
    }
}

/// Everything the engine knows about one tracked pid.
#[derive(Debug)]
pub struct ProcessProfile {
    pub pid: u32,
    /// Best-effort snapshot; absent when the process exited before it
    /// could be queried.
    pub cmdline: Option<String>,
    /// Directories this pid has enumerated.
    pub listed_dirs: HashSet<PathBuf>,
    /// Files under listed directories this pid has opened.
    pub files: HashMap<PathBuf, FileProfile>,
    /// Most recent event attributed to this pid; ages the profile for the
    /// reaper.
    pub last_seen: Instant,
    /// Cumulative bytes across all tracked files.
    pub total_read: u64,
    /// Cumulative bytes written by this pid while it had tracked files,
    /// including writes to paths that are themselves untracked. A
    /// substitution attack reads the victim and writes the ciphertext to
    /// a brand-new file, so process-level write volume is what the ratio
    /// heuristic has to see.
    pub total_write: u64,
}

impl ProcessProfile {
    pub fn new(pid: u32, cmdline: Option<String>) -> Self {
        Self {
            pid,
            cmdline,
            listed_dirs: HashSet::new(),
            files: HashMap::new(),
            last_seen: Instant::now(),
            total_read: 0,
            total_write: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// The write/read volume ratio condition shared by both patterns:
    /// the pid rewrote at least 1/divisor of what it read. Distinguishes
    /// read-then-destroy from benign bulk deletion or read-only scanning.
    pub fn write_ratio_met(&self, divisor: u64) -> bool {
        self.total_write >= self.total_read / divisor
    }
}

/// Serializable view of one profile, for the status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub pid: u32,
    pub cmdline: Option<String>,
    pub listed_dirs: Vec<PathBuf>,
    pub files: HashMap<PathBuf, FileProfile>,
    pub idle_secs: u64,
    pub total_read: u64,
    pub total_write: u64,
}

impl ProfileSnapshot {
    pub fn of(profile: &ProcessProfile) -> Self {
        let mut listed_dirs: Vec<_> = profile.listed_dirs.iter().cloned().collect();
        listed_dirs.sort();
        Self {
            pid: profile.pid,
            cmdline: profile.cmdline.clone(),
            listed_dirs,
            files: profile.files.clone(),
            idle_secs: profile.last_seen.elapsed().as_secs(),
            total_read: profile.total_read,
            total_write: profile.total_write,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_read_handles_vanished_file() {
        let fp = FileProfile::new(-1);
        assert!(fp.fully_read());
        assert!(fp.fully_written());

        let fp = FileProfile::new(100);
        assert!(!fp.fully_read());
    }

    #[test]
    fn write_ratio_uses_divisor() {
        let mut profile = ProcessProfile::new(1, None);
        profile.total_read = 1000;
        profile.total_write = 500;
        assert!(profile.write_ratio_met(2));

        profile.total_write = 499;
        assert!(!profile.write_ratio_met(2));
        assert!(profile.write_ratio_met(4));
    }
}
