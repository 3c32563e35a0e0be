//! Detection engine
//!
//! Consumes raw file-activity events and maintains one behavioral profile
//! per tracked pid. A pid becomes tracked the first time it lists a
//! directory; files it then opens under listed directories are tracked
//! individually. A file's terminal event (unlink or close) is classified
//! exactly once against the ransomware patterns.
//!
//! The profile table is the only state shared with the reaper, guarded by
//! a single mutex. Profile counts stay small; finer-grained locking buys
//! nothing here.

pub mod profile;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bus::{unexpected_event, Bus, Subscriber};
use crate::config::DetectionConfig;
use crate::event::{Event, EventKind, RansomAlert, RansomPattern};
use crate::process::ProcessControl;

use profile::{FileProfile, ProcessProfile, ProfileSnapshot};

/// Shared pid -> profile table. Event handlers and the reaper both take
/// the lock per operation.
pub type ProfileTable = Arc<Mutex<HashMap<u32, ProcessProfile>>>;

pub struct Engine {
    profiles: ProfileTable,
    control: Arc<dyn ProcessControl>,
    /// Ratio divisor: a terminal event matches only when
    /// `total_write >= total_read / divisor`. Policy, not structure.
    divisor: u64,
}

impl Engine {
    pub fn new(config: &DetectionConfig, control: Arc<dyn ProcessControl>) -> Self {
        Self {
            profiles: Arc::new(Mutex::new(HashMap::new())),
            control,
            divisor: config.write_read_divisor.max(1),
        }
    }

    /// Handle to the profile table, shared with the reaper and the status
    /// query.
    pub fn profiles(&self) -> ProfileTable {
        Arc::clone(&self.profiles)
    }

    /// Serializable view of every tracked profile, for introspection.
    pub fn snapshot(profiles: &ProfileTable) -> Vec<ProfileSnapshot> {
        let table = profiles.lock().expect("profile table poisoned");
        let mut snapshots: Vec<_> = table.values().map(ProfileSnapshot::of).collect();
        snapshots.sort_by_key(|s| s.pid);
        snapshots
    }

    /// First `ListDir` for an unseen pid creates its profile; before that,
    /// every other event for the pid is a no-op.
    fn on_list_dir(&self, pid: u32, path: &Path) {
        let mut table = self.profiles.lock().expect("profile table poisoned");
        let profile = table.entry(pid).or_insert_with(|| {
            // Best effort: ransomware may already have exited by the time
            // we look, which is fine.
            let cmdline = self.control.cmdline(pid);
            debug!("tracking pid {} ({:?})", pid, cmdline);
            ProcessProfile::new(pid, cmdline)
        });
        profile.listed_dirs.insert(path.to_path_buf());
        profile.touch();
    }

    fn on_open(&self, pid: u32, path: &Path) {
        let mut table = self.profiles.lock().expect("profile table poisoned");
        let Some(profile) = table.get_mut(&pid) else {
            return;
        };

        let listed_parent = path
            .parent()
            .map(|dir| profile.listed_dirs.contains(dir))
            .unwrap_or(false);
        if listed_parent && !profile.files.contains_key(path) {
            // -1 means the stat failed: the file vanished before we could
            // inspect it, but its reads and terminal event still define
            // the outcome, so track it anyway.
            let size = match std::fs::metadata(path) {
                Ok(meta) if meta.is_dir() => {
                    profile.touch();
                    return;
                }
                Ok(meta) => meta.len() as i64,
                Err(_) => -1,
            };
            // A zero-size file would satisfy "fully read" on first touch;
            // never track those.
            if size != 0 {
                profile.files.insert(path.to_path_buf(), FileProfile::new(size));
                debug!("pid {} opened victim candidate {:?} ({} bytes)", pid, path, size);
            }
        }
        profile.touch();
    }

    fn on_read(&self, pid: u32, path: &Path, size: u64) {
        let mut table = self.profiles.lock().expect("profile table poisoned");
        let Some(profile) = table.get_mut(&pid) else {
            return;
        };
        let Some(file) = profile.files.get_mut(path) else {
            return;
        };
        file.bytes_read += size;
        profile.total_read += size;
        profile.touch();
    }

    fn on_write(&self, pid: u32, path: &Path, size: u64) {
        let mut table = self.profiles.lock().expect("profile table poisoned");
        let Some(profile) = table.get_mut(&pid) else {
            return;
        };
        // Process-level write volume counts writes to any path, tracked
        // or not, as long as the pid has at least one victim candidate:
        // a substitution attack writes its ciphertext to a file we never
        // tracked. A pid with no tracked files contributes no noise.
        if !profile.files.is_empty() {
            profile.total_write += size;
        }
        if let Some(file) = profile.files.get_mut(path) {
            file.bytes_written += size;
        }
        profile.touch();
    }

    /// Unlink of a fully-read victim while the pid's write volume keeps up
    /// with its read volume: the encrypted copy replaced the original.
    fn on_unlink(&self, pid: u32, path: &Path) -> Option<RansomAlert> {
        let mut table = self.profiles.lock().expect("profile table poisoned");
        let profile = table.get_mut(&pid)?;
        let file = profile.files.get(path)?;

        let matched = file.fully_read() && profile.write_ratio_met(self.divisor);
        profile.touch();
        if matched {
            // Keep the file profile: the pid stays under observation and
            // further events may correlate.
            info!("pid {} matched NewFileSubstitution on {:?}", pid, path);
            Some(RansomAlert {
                pid,
                path: path.to_path_buf(),
                pattern: RansomPattern::NewFileSubstitution,
            })
        } else {
            // This file's story, for this pid, is over.
            profile.files.remove(path);
            None
        }
    }

    /// Close of a victim that was both fully read and fully rewritten in
    /// place. Requires at least one read: pure write volume never fires.
    fn on_close(&self, pid: u32, path: &Path) -> Option<RansomAlert> {
        let mut table = self.profiles.lock().expect("profile table poisoned");
        let profile = table.get_mut(&pid)?;
        let file = profile.files.get(path)?;

        let matched = file.bytes_read > 0
            && file.fully_read()
            && file.fully_written()
            && profile.write_ratio_met(self.divisor);
        profile.touch();
        if matched {
            info!("pid {} matched InPlaceOverwrite on {:?}", pid, path);
            Some(RansomAlert {
                pid,
                path: path.to_path_buf(),
                pattern: RansomPattern::InPlaceOverwrite,
            })
        } else {
            profile.files.remove(path);
            None
        }
    }
}

impl Subscriber for Engine {
    fn name(&self) -> &'static str {
        "engine"
    }

    fn kinds(&self) -> &'static [EventKind] {
        &[
            EventKind::ListDir,
            EventKind::FileOpen,
            EventKind::FileRead,
            EventKind::FileWrite,
            EventKind::FileUnlink,
            EventKind::FileClose,
        ]
    }

    fn handle(&mut self, event: Event, bus: &Bus) {
        match event {
            Event::ListDir { pid, path, .. } => self.on_list_dir(pid, &path),
            Event::FileOpen { pid, path, .. } => self.on_open(pid, &path),
            Event::FileRead { pid, path, size, .. } => self.on_read(pid, &path, size),
            Event::FileWrite { pid, path, size, .. } => self.on_write(pid, &path, size),
            Event::FileUnlink { pid, path, .. } => {
                if let Some(alert) = self.on_unlink(pid, &path) {
                    bus.publish(Event::CryptoRansom(alert));
                }
            }
            Event::FileClose { pid, path, .. } => {
                if let Some(alert) = self.on_close(pid, &path) {
                    bus.publish(Event::CryptoRansom(alert));
                }
            }
            other => unexpected_event("engine", &other),
        }
    }
}

/// One reaper pass: drop every profile that has been idle longer than the
/// obsolescence window and whose pid is confirmed dead. A live pid is
/// never reaped regardless of age.
pub fn reap_once(profiles: &ProfileTable, control: &dyn ProcessControl, window: Duration) {
    let mut table = profiles.lock().expect("profile table poisoned");
    table.retain(|pid, profile| {
        let stale = profile.last_seen.elapsed() > window && !control.is_alive(*pid);
        if stale {
            info!("reaped stale profile for dead pid {}", pid);
        }
        !stale
    });
}

/// Periodic reaper task bounding profile-table growth. Checks the stop
/// flag between periods; never cancelled mid-pass.
pub fn spawn_reaper(
    profiles: ProfileTable,
    control: Arc<dyn ProcessControl>,
    config: &DetectionConfig,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let period = Duration::from_secs(config.reap_period_secs.max(1));
    let window = Duration::from_secs(config.obsolescence_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if stop.load(Ordering::Relaxed) {
                break;
            }
            reap_once(&profiles, control.as_ref(), window);
        }
        debug!("reaper stopped");
    })
}
