//! Tracer feed
//!
//! The tracer itself is an external privileged subsystem; this module is
//! its interface boundary. It spawns the configured tracer command, reads
//! newline-delimited JSON activity records from its stdout and publishes
//! the corresponding raw events. Path resolution is the tracer's contract:
//! records carrying a non-absolute path are dropped with a warning.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::config::TracerConfig;
use crate::event::Event;

/// One activity record on the wire, e.g.
/// `{"action":"read","pid":100,"path":"/tmp/doc.txt","size":4096,"t":12.5}`
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum RawRecord {
    Open {
        pid: u32,
        path: PathBuf,
        #[serde(default)]
        t: f64,
    },
    Listdir {
        pid: u32,
        path: PathBuf,
        #[serde(default)]
        t: f64,
    },
    Read {
        pid: u32,
        path: PathBuf,
        size: u64,
        #[serde(default)]
        t: f64,
    },
    Write {
        pid: u32,
        path: PathBuf,
        size: u64,
        #[serde(default)]
        t: f64,
    },
    Close {
        pid: u32,
        path: PathBuf,
        #[serde(default)]
        t: f64,
    },
    Unlink {
        pid: u32,
        path: PathBuf,
        #[serde(default)]
        t: f64,
    },
}

impl RawRecord {
    fn path(&self) -> &PathBuf {
        match self {
            RawRecord::Open { path, .. }
            | RawRecord::Listdir { path, .. }
            | RawRecord::Read { path, .. }
            | RawRecord::Write { path, .. }
            | RawRecord::Close { path, .. }
            | RawRecord::Unlink { path, .. } => path,
        }
    }

    fn into_event(self) -> Event {
        match self {
            RawRecord::Open { pid, path, t } => Event::FileOpen {
                timestamp: t,
                pid,
                path,
            },
            RawRecord::Listdir { pid, path, t } => Event::ListDir {
                timestamp: t,
                pid,
                path,
            },
            RawRecord::Read { pid, path, size, t } => Event::FileRead {
                timestamp: t,
                pid,
                path,
                size,
            },
            RawRecord::Write { pid, path, size, t } => Event::FileWrite {
                timestamp: t,
                pid,
                path,
                size,
            },
            RawRecord::Close { pid, path, t } => Event::FileClose {
                timestamp: t,
                pid,
                path,
            },
            RawRecord::Unlink { pid, path, t } => Event::FileUnlink {
                timestamp: t,
                pid,
                path,
            },
        }
    }
}

/// Parse one feed line. `None` means the line is unusable (malformed, or
/// the tracer broke the absolute-path contract) and was logged.
fn parse_line(line: &str) -> Option<Event> {
    if line.trim().is_empty() {
        return None;
    }
    let record: RawRecord = match serde_json::from_str(line) {
        Ok(record) => record,
        Err(e) => {
            warn!("unparseable tracer record {:?}: {}", line, e);
            return None;
        }
    };
    if !record.path().is_absolute() {
        warn!(
            "tracer sent non-absolute path {:?}, dropping record",
            record.path()
        );
        return None;
    }
    Some(record.into_event())
}

/// Running tracer subprocess plus the task pumping its output.
pub struct TracerFeed {
    child: Child,
    pump: JoinHandle<()>,
}

impl TracerFeed {
    /// Spawn the tracer command and start publishing its records. The
    /// command is expected to already exclude the daemon's own pid.
    pub fn spawn(bus: Bus, config: &TracerConfig) -> anyhow::Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .context("tracer command is empty")?;

        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn tracer {:?}", program))?;

        let stdout = child
            .stdout
            .take()
            .context("tracer child has no stdout")?;

        info!("tracer started: {:?}", config.command);

        let pump = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_line(&line) {
                            bus.publish(event);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("tracer read error: {}", e);
                        break;
                    }
                }
            }
            debug!("tracer feed ended");
        });

        Ok(Self { child, pump })
    }

    /// Kill the tracer and wait for the feed to drain.
    pub async fn stop(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("failed to kill tracer: {}", e);
        }
        let _ = self.pump.await;
        info!("tracer stopped");
    }
}
