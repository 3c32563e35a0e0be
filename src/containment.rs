//! Containment handler
//!
//! Turns ransomware alerts into reversible process suspensions and applies
//! the human's allow/deny answer. One suspect pid moves through
//! `Normal -> Suspended -> {Resumed, Terminated}`; duplicate alerts while a
//! decision is pending are ignored, so a storm of alerts for the same pid
//! produces exactly one suspend and one prompt.
//!
//! Process-resolution failures anywhere in this path mean the process
//! already resolved itself; they are logged and never fatal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::bus::{unexpected_event, Bus, Subscriber};
use crate::event::{DecisionPrompt, Event, EventKind, RansomAlert};
use crate::process::ProcessControl;

/// A suspect paused under SIGSTOP, awaiting a decision.
#[derive(Debug, Clone)]
pub struct SuspendedProcess {
    pub pid: u32,
    pub cmdline: String,
}

/// Exact-match command-line trust set. Shared behind a mutex only so the
/// status query can snapshot it; all mutation happens on the containment
/// worker.
pub type Whitelist = Arc<Mutex<Vec<String>>>;

pub struct Containment {
    control: Arc<dyn ProcessControl>,
    whitelist: Whitelist,
    suspended: HashMap<u32, SuspendedProcess>,
}

impl Containment {
    /// `initial_whitelist` is the externally loaded trust set (from
    /// config here; persistence is not the daemon's concern).
    pub fn new(control: Arc<dyn ProcessControl>, initial_whitelist: Vec<String>) -> Self {
        Self {
            control,
            whitelist: Arc::new(Mutex::new(initial_whitelist)),
            suspended: HashMap::new(),
        }
    }

    /// Shared whitelist handle for the status query.
    pub fn whitelist(&self) -> Whitelist {
        Arc::clone(&self.whitelist)
    }

    fn is_whitelisted(&self, cmdline: &str) -> bool {
        self.whitelist
            .lock()
            .expect("whitelist poisoned")
            .iter()
            .any(|entry| entry == cmdline)
    }

    /// Returns the prompt to publish, if the alert led to a suspension.
    fn on_alert(&mut self, alert: RansomAlert) -> Option<DecisionPrompt> {
        if self.suspended.contains_key(&alert.pid) {
            // A decision for this pid is already in flight.
            debug!("ignoring duplicate alert for suspended pid {}", alert.pid);
            return None;
        }

        let Some(cmdline) = self.control.cmdline(alert.pid) else {
            warn!(
                "suspicious process {} exited before it could be contained",
                alert.pid
            );
            return None;
        };

        if self.is_whitelisted(&cmdline) {
            info!("allowed whitelisted process {} ({})", alert.pid, cmdline);
            return None;
        }

        if let Err(e) = self.control.suspend(alert.pid) {
            warn!("could not suspend pid {}: {}", alert.pid, e);
            return None;
        }

        self.suspended.insert(
            alert.pid,
            SuspendedProcess {
                pid: alert.pid,
                cmdline: cmdline.clone(),
            },
        );
        Some(DecisionPrompt {
            pid: alert.pid,
            path: alert.path,
            cmdline,
        })
    }

    fn on_allow(&mut self, pid: u32) {
        let Some(process) = self.suspended.remove(&pid) else {
            // Decision arrived after the process was already resolved.
            debug!("allow for pid {} with no pending suspension", pid);
            return;
        };
        {
            let mut whitelist = self.whitelist.lock().expect("whitelist poisoned");
            if !whitelist.contains(&process.cmdline) {
                whitelist.push(process.cmdline.clone());
            }
        }
        info!("resuming pid {} ({})", pid, process.cmdline);
        if let Err(e) = self.control.resume(pid) {
            warn!("could not resume pid {}: {}", pid, e);
        }
    }

    fn on_deny(&mut self, pid: u32) {
        let Some(process) = self.suspended.remove(&pid) else {
            debug!("deny for pid {} with no pending suspension", pid);
            return;
        };
        info!("killing pid {} ({})", pid, process.cmdline);
        if let Err(e) = self.control.kill(pid) {
            warn!("could not kill pid {}: {}", pid, e);
        }
        // A concurrent allow for another instance of the same command line
        // may have just trusted it; the deny wins.
        let mut whitelist = self.whitelist.lock().expect("whitelist poisoned");
        whitelist.retain(|entry| entry != &process.cmdline);
    }
}

impl Subscriber for Containment {
    fn name(&self) -> &'static str {
        "containment"
    }

    fn kinds(&self) -> &'static [EventKind] {
        &[
            EventKind::CryptoRansom,
            EventKind::UserAllowProcess,
            EventKind::UserDenyProcess,
        ]
    }

    fn handle(&mut self, event: Event, bus: &Bus) {
        match event {
            Event::CryptoRansom(alert) => {
                if let Some(prompt) = self.on_alert(alert) {
                    bus.publish(Event::AskUserAllowOrDeny(prompt));
                }
            }
            Event::UserAllowProcess { pid } => self.on_allow(pid),
            Event::UserDenyProcess { pid } => self.on_deny(pid),
            other => unexpected_event("containment", &other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RansomPattern;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Action {
        Suspend(u32),
        Resume(u32),
        Kill(u32),
    }

    struct FakeControl {
        alive: StdMutex<HashSet<u32>>,
        actions: StdMutex<Vec<Action>>,
        fail_suspend: StdMutex<bool>,
    }

    impl FakeControl {
        fn with_alive(pids: &[u32]) -> Arc<Self> {
            Arc::new(Self {
                alive: StdMutex::new(pids.iter().copied().collect()),
                actions: StdMutex::new(Vec::new()),
                fail_suspend: StdMutex::new(false),
            })
        }

        fn fail_suspend(&self, on: bool) {
            *self.fail_suspend.lock().unwrap() = on;
        }

        fn actions(&self) -> Vec<Action> {
            self.actions.lock().unwrap().clone()
        }
    }

    impl ProcessControl for FakeControl {
        fn cmdline(&self, pid: u32) -> Option<String> {
            self.alive
                .lock()
                .unwrap()
                .contains(&pid)
                .then(|| format!("cmd-{}", pid))
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }

        fn suspend(&self, pid: u32) -> anyhow::Result<()> {
            if *self.fail_suspend.lock().unwrap() {
                anyhow::bail!("Operation not permitted");
            }
            self.actions.lock().unwrap().push(Action::Suspend(pid));
            Ok(())
        }

        fn resume(&self, pid: u32) -> anyhow::Result<()> {
            self.actions.lock().unwrap().push(Action::Resume(pid));
            Ok(())
        }

        fn kill(&self, pid: u32) -> anyhow::Result<()> {
            self.actions.lock().unwrap().push(Action::Kill(pid));
            Ok(())
        }
    }

    fn alert(pid: u32) -> RansomAlert {
        RansomAlert {
            pid,
            path: PathBuf::from("/tmp/doc.txt"),
            pattern: RansomPattern::NewFileSubstitution,
        }
    }

    #[test]
    fn duplicate_alerts_suspend_and_prompt_once() {
        let control = FakeControl::with_alive(&[100]);
        let mut handler = Containment::new(control.clone(), Vec::new());

        let first = handler.on_alert(alert(100));
        let second = handler.on_alert(alert(100));

        let prompt = first.expect("first alert prompts");
        assert_eq!(prompt.pid, 100);
        assert_eq!(prompt.cmdline, "cmd-100");
        assert!(second.is_none());
        assert_eq!(control.actions(), vec![Action::Suspend(100)]);
    }

    #[test]
    fn vanished_process_drops_alert() {
        let control = FakeControl::with_alive(&[]);
        let mut handler = Containment::new(control.clone(), Vec::new());

        assert!(handler.on_alert(alert(100)).is_none());
        assert!(control.actions().is_empty());
    }

    #[test]
    fn whitelisted_cmdline_is_never_contained() {
        let control = FakeControl::with_alive(&[100]);
        let mut handler =
            Containment::new(control.clone(), vec!["cmd-100".to_string()]);

        assert!(handler.on_alert(alert(100)).is_none());
        assert!(control.actions().is_empty());
    }

    #[test]
    fn allow_whitelists_and_resumes() {
        let control = FakeControl::with_alive(&[100]);
        let mut handler = Containment::new(control.clone(), Vec::new());

        handler.on_alert(alert(100)).unwrap();
        handler.on_allow(100);

        assert_eq!(
            control.actions(),
            vec![Action::Suspend(100), Action::Resume(100)]
        );
        assert!(handler.is_whitelisted("cmd-100"));
        assert!(handler.suspended.is_empty());

        // Later alerts for the same command line are allowed outright.
        assert!(handler.on_alert(alert(100)).is_none());
        assert_eq!(control.actions().len(), 2);
    }

    #[test]
    fn deny_kills_and_revokes_trust() {
        let control = FakeControl::with_alive(&[100, 101]);
        let mut handler = Containment::new(control.clone(), Vec::new());

        // Another instance of the same binary was just allowed; the deny
        // must revoke its entry too.
        handler.on_alert(alert(100)).unwrap();
        handler
            .whitelist
            .lock()
            .unwrap()
            .push("cmd-100".to_string());

        handler.on_deny(100);

        assert!(control.actions().contains(&Action::Kill(100)));
        assert!(!handler.is_whitelisted("cmd-100"));
        assert!(handler.suspended.is_empty());
    }

    #[test]
    fn suspend_failure_skips_containment_and_allows_retry() {
        let control = FakeControl::with_alive(&[100]);
        control.fail_suspend(true);
        let mut handler = Containment::new(control.clone(), Vec::new());

        // Signal refused (e.g. insufficient privilege): no suspension is
        // recorded, no prompt goes out, the pid stays eligible.
        assert!(handler.on_alert(alert(100)).is_none());
        assert!(handler.suspended.is_empty());
        assert!(control.actions().is_empty());

        control.fail_suspend(false);
        let prompt = handler.on_alert(alert(100)).expect("retry prompts");
        assert_eq!(prompt.pid, 100);
        assert_eq!(control.actions(), vec![Action::Suspend(100)]);
    }

    #[test]
    fn decisions_without_pending_suspension_are_noops() {
        let control = FakeControl::with_alive(&[100]);
        let mut handler = Containment::new(control.clone(), Vec::new());

        handler.on_allow(100);
        handler.on_deny(100);

        assert!(control.actions().is_empty());
        assert!(!handler.is_whitelisted("cmd-100"));
    }
}
