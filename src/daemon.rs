//! Daemon management for ransomwatch
//!
//! Wires the bus, spawns the component workers, runs the unix-socket IPC
//! for introspection and shutdown, and tears everything down in order:
//! tracer feed first, then the reaper, then the bus workers via their stop
//! sentinels.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::bus::{self, Bus, Subscriber};
use crate::config::Config;
use crate::containment::{Containment, Whitelist};
use crate::engine::profile::ProfileSnapshot;
use crate::engine::{self, Engine, ProfileTable};
use crate::event::{Event, EventKind, RansomAlert};
use crate::process::SysProcessControl;
use crate::tracer::TracerFeed;

const ALERT_LOG_CAP: usize = 64;

/// Upper bound on a client frame; a status response can run long, a
/// command never does.
const MAX_IPC_FRAME: usize = 1 << 20;

/// Commands that can be sent to the daemon
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Command {
    /// Get current status
    Status,
    /// Shutdown the daemon
    Shutdown,
}

/// Response from daemon
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Response {
    Ok,
    Error(String),
    Status(DaemonStatus),
}

/// Daemon status information
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DaemonStatus {
    pub pid: u32,
    pub uptime_secs: u64,
    pub profiles: Vec<ProfileSnapshot>,
    pub recent_alerts: Vec<AlertRecord>,
    pub whitelist: Vec<String>,
}

/// One alert as recorded for the status query.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AlertRecord {
    pub at: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub alert: RansomAlert,
}

type AlertLog = Arc<Mutex<VecDeque<AlertRecord>>>;

/// Keeps the bounded ring of recent alerts served by the status query.
struct AlertRecorder {
    log: AlertLog,
}

impl Subscriber for AlertRecorder {
    fn name(&self) -> &'static str {
        "alert-log"
    }

    fn kinds(&self) -> &'static [EventKind] {
        &[EventKind::CryptoRansom]
    }

    fn handle(&mut self, event: Event, _bus: &Bus) {
        match event {
            Event::CryptoRansom(alert) => {
                let mut log = self.log.lock().expect("alert log poisoned");
                if log.len() == ALERT_LOG_CAP {
                    log.pop_front();
                }
                log.push_back(AlertRecord {
                    at: chrono::Utc::now(),
                    alert,
                });
            }
            other => bus::unexpected_event("alert-log", &other),
        }
    }
}

/// Read-only handles the IPC loop answers status queries from.
struct DaemonState {
    started: Instant,
    profiles: ProfileTable,
    whitelist: Whitelist,
    alerts: AlertLog,
}

/// Start the ransomwatch daemon. The background fork must happen before
/// the runtime exists: fork(2) keeps only the calling thread, and a
/// runtime whose worker threads were lost in the child never drives its
/// IO driver again. So this entry point is synchronous, forks first, and
/// only then builds the runtime the daemon runs on.
pub fn start(config: Config, foreground: bool) -> anyhow::Result<()> {
    if is_running(&config) {
        anyhow::bail!("ransomwatch is already running");
    }

    if !foreground {
        daemonize(&config)?;
    }

    tokio::runtime::Runtime::new()?.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    write_pid_file(&config.daemon.pid_file)?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    let _ = std::fs::remove_file(&config.daemon.socket);
    let listener = UnixListener::bind(&config.daemon.socket)?;

    info!(
        "ransomwatch daemon started, listening on {:?}",
        config.daemon.socket
    );

    // Wire the bus. All subscriptions happen before the tracer feed
    // starts, so no event can reach an unregistered kind.
    let bus = Bus::new();
    let control = Arc::new(SysProcessControl);

    let engine = Engine::new(&config.detection, control.clone());
    let profiles = engine.profiles();

    let containment = Containment::new(control.clone(), config.whitelist.cmdlines.clone());
    let whitelist = containment.whitelist();

    let alerts: AlertLog = Arc::new(Mutex::new(VecDeque::new()));
    let recorder = AlertRecorder {
        log: Arc::clone(&alerts),
    };

    let mut workers = vec![
        bus::spawn_worker(&bus, engine),
        bus::spawn_worker(&bus, containment),
        bus::spawn_worker(&bus, recorder),
    ];
    // In background mode stdin is /dev/null, so every prompt falls
    // through to the deny default.
    workers.push(crate::console::spawn(&bus));

    let reaper_stop = Arc::new(AtomicBool::new(false));
    let reaper = engine::spawn_reaper(
        profiles.clone(),
        control,
        &config.detection,
        Arc::clone(&reaper_stop),
    );

    let tracer = TracerFeed::spawn(bus.clone(), &config.tracer)?;

    let state = DaemonState {
        started: Instant::now(),
        profiles,
        whitelist,
        alerts,
    };

    // Main loop: IPC plus signals.
    loop {
        tokio::select! {
            Ok((stream, _)) = listener.accept() => {
                match handle_client(stream, &state).await {
                    Ok(true) => {
                        info!("shutdown requested over IPC");
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("IPC client error: {}", e),
                }
            }

            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down...");
                break;
            }

            _ = sigint.recv() => {
                info!("received SIGINT, shutting down...");
                break;
            }
        }
    }

    // Orderly teardown: stop the feed, then the reaper, then let every
    // worker drain up to its stop sentinel.
    tracer.stop().await;
    reaper_stop.store(true, Ordering::Relaxed);
    bus.shutdown();
    for worker in workers {
        let _ = worker.await;
    }
    // The reaper notices the flag between periods; never cancelled
    // mid-pass.
    let _ = reaper.await;

    cleanup(&config);
    info!("ransomwatch stopped");

    Ok(())
}

/// Stop a running daemon: ask nicely over IPC, fall back to signals.
pub async fn stop(config: &Config) -> anyhow::Result<()> {
    if !is_running(config) {
        println!("ransomwatch is not running");
        return Ok(());
    }

    if send_command(config, Command::Shutdown).await.is_ok() {
        // Give the daemon a moment to unwind.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            if !is_running(config) {
                println!("ransomwatch stopped");
                return Ok(());
            }
        }
    }

    let pid = read_pid_file(&config.daemon.pid_file)?;
    warn!("daemon did not stop over IPC, sending SIGTERM to {}", pid);
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGTERM,
    )?;

    Ok(())
}

/// Check daemon status
pub async fn status(config: &Config) -> anyhow::Result<()> {
    if !is_running(config) {
        println!("ransomwatch is not running");
        return Ok(());
    }

    match send_command(config, Command::Status).await {
        Ok(()) => {}
        Err(e) => println!("ransomwatch is running but not responding: {}", e),
    }

    Ok(())
}

/// Send a command to the running daemon and print its response.
pub async fn send_command(config: &Config, cmd: Command) -> anyhow::Result<()> {
    let mut stream = UnixStream::connect(&config.daemon.socket).await?;

    let cmd_bytes = serde_json::to_vec(&cmd)?;
    stream.write_all(&(cmd_bytes.len() as u32).to_le_bytes()).await?;
    stream.write_all(&cmd_bytes).await?;

    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut response_bytes = vec![0u8; len];
    stream.read_exact(&mut response_bytes).await?;

    match serde_json::from_slice(&response_bytes)? {
        Response::Ok => println!("OK"),
        Response::Error(e) => println!("Error: {}", e),
        Response::Status(status) => print_status(&status),
    }

    Ok(())
}

/// Show daemon logs
pub async fn show_logs(config: &Config, lines: usize, follow: bool) -> anyhow::Result<()> {
    let log_path = &config.daemon.log_file;

    if !log_path.exists() {
        println!("No log file found at {:?}", log_path);
        return Ok(());
    }

    if follow {
        let mut cmd = tokio::process::Command::new("tail")
            .args(["-f", "-n", &lines.to_string()])
            .arg(log_path)
            .spawn()?;
        cmd.wait().await?;
    } else {
        let output = tokio::process::Command::new("tail")
            .args(["-n", &lines.to_string()])
            .arg(log_path)
            .output()
            .await?;
        print!("{}", String::from_utf8_lossy(&output.stdout));
    }

    Ok(())
}

// Helper functions

/// Returns true when the client asked for shutdown.
async fn handle_client(mut stream: UnixStream, state: &DaemonState) -> anyhow::Result<bool> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_IPC_FRAME {
        write_frame(
            &mut stream,
            &Response::Error(format!("oversized frame ({} bytes)", len)),
        )
        .await?;
        return Ok(false);
    }

    let mut cmd_bytes = vec![0u8; len];
    stream.read_exact(&mut cmd_bytes).await?;
    let cmd: Command = serde_json::from_slice(&cmd_bytes)?;

    let (response, shutdown) = match cmd {
        Command::Status => {
            let status = DaemonStatus {
                pid: std::process::id(),
                uptime_secs: state.started.elapsed().as_secs(),
                profiles: Engine::snapshot(&state.profiles),
                recent_alerts: state
                    .alerts
                    .lock()
                    .expect("alert log poisoned")
                    .iter()
                    .cloned()
                    .collect(),
                whitelist: state.whitelist.lock().expect("whitelist poisoned").clone(),
            };
            (Response::Status(status), false)
        }
        Command::Shutdown => (Response::Ok, true),
    };

    write_frame(&mut stream, &response).await?;

    Ok(shutdown)
}

async fn write_frame(stream: &mut UnixStream, response: &Response) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(response)?;
    stream.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    stream.write_all(&bytes).await?;
    Ok(())
}

fn daemonize(config: &Config) -> anyhow::Result<()> {
    use daemonize::Daemonize;

    let stdout = std::fs::File::create(&config.daemon.log_file)?;
    let stderr = stdout.try_clone()?;

    Daemonize::new()
        .pid_file(&config.daemon.pid_file)
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()?;

    Ok(())
}

fn write_pid_file(path: &std::path::Path) -> anyhow::Result<()> {
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

fn read_pid_file(path: &std::path::Path) -> anyhow::Result<u32> {
    let content = std::fs::read_to_string(path)?;
    let pid: u32 = content.trim().parse()?;
    Ok(pid)
}

fn is_running(config: &Config) -> bool {
    if let Ok(pid) = read_pid_file(&config.daemon.pid_file) {
        return PathBuf::from(format!("/proc/{}", pid)).exists();
    }
    false
}

fn cleanup(config: &Config) {
    let _ = std::fs::remove_file(&config.daemon.pid_file);
    let _ = std::fs::remove_file(&config.daemon.socket);
}

fn print_status(status: &DaemonStatus) {
    println!("ransomwatch status");
    println!("──────────────────────────────────");
    println!("PID:              {}", status.pid);
    println!("Uptime:           {} seconds", status.uptime_secs);
    println!("Tracked pids:     {}", status.profiles.len());
    for profile in &status.profiles {
        println!(
            "  pid {:>7}  files: {:>4}  read: {:>10}  written: {:>10}  {}",
            profile.pid,
            profile.files.len(),
            profile.total_read,
            profile.total_write,
            profile.cmdline.as_deref().unwrap_or("<unknown>"),
        );
    }
    println!("Recent alerts:    {}", status.recent_alerts.len());
    for record in &status.recent_alerts {
        println!(
            "  {}  pid {}  {:?}  {}",
            record.at.format("%Y-%m-%d %H:%M:%S"),
            record.alert.pid,
            record.alert.pattern,
            record.alert.path.display(),
        );
    }
    println!("Whitelist:        {}", status.whitelist.len());
    for entry in &status.whitelist {
        println!("  - {}", entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn empty_state() -> DaemonState {
        DaemonState {
            started: Instant::now(),
            profiles: Arc::new(Mutex::new(HashMap::new())),
            whitelist: Arc::new(Mutex::new(Vec::new())),
            alerts: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    // Plain #[test]: start must be callable with no runtime alive, since
    // the background fork has to precede runtime construction.
    #[test]
    fn start_refuses_when_pid_file_names_live_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.daemon.pid_file = dir.path().join("ransomwatch.pid");
        config.daemon.socket = dir.path().join("ransomwatch.sock");
        std::fs::write(&config.daemon.pid_file, std::process::id().to_string()).unwrap();

        let err = start(config, true).unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[tokio::test]
    async fn status_query_answers_over_ipc() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let state = empty_state();
        let server = tokio::spawn(async move { handle_client(server, &state).await });

        let cmd = serde_json::to_vec(&Command::Status).unwrap();
        client
            .write_all(&(cmd.len() as u32).to_le_bytes())
            .await
            .unwrap();
        client.write_all(&cmd).await.unwrap();

        let mut len_bytes = [0u8; 4];
        client.read_exact(&mut len_bytes).await.unwrap();
        let mut body = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
        client.read_exact(&mut body).await.unwrap();

        match serde_json::from_slice::<Response>(&body).unwrap() {
            Response::Status(status) => {
                assert_eq!(status.pid, std::process::id());
                assert!(status.profiles.is_empty());
                assert!(status.recent_alerts.is_empty());
            }
            other => panic!("unexpected response: {:?}", other),
        }
        assert!(!server.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn oversized_frame_is_refused_without_allocation() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let state = empty_state();
        let server = tokio::spawn(async move { handle_client(server, &state).await });

        client
            .write_all(&(64u32 * 1024 * 1024).to_le_bytes())
            .await
            .unwrap();

        let mut len_bytes = [0u8; 4];
        client.read_exact(&mut len_bytes).await.unwrap();
        let mut body = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
        client.read_exact(&mut body).await.unwrap();

        assert!(matches!(
            serde_json::from_slice::<Response>(&body).unwrap(),
            Response::Error(_)
        ));
        assert!(!server.await.unwrap().unwrap());
    }
}
