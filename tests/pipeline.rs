//! End-to-end detection and containment flow over the bus.

use std::collections::HashSet;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use ransomwatch::bus::{spawn_worker, Bus};
use ransomwatch::config::DetectionConfig;
use ransomwatch::event::{Event, EventKind, RansomAlert, RansomPattern};
use ransomwatch::{Containment, Engine, ProcessControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Suspend(u32),
    Resume(u32),
    Kill(u32),
}

struct FakeControl {
    alive: HashSet<u32>,
    actions: Mutex<Vec<Action>>,
}

impl FakeControl {
    fn with_alive(pids: &[u32]) -> Arc<Self> {
        Arc::new(Self {
            alive: pids.iter().copied().collect(),
            actions: Mutex::new(Vec::new()),
        })
    }

    fn actions(&self) -> Vec<Action> {
        self.actions.lock().unwrap().clone()
    }
}

impl ProcessControl for FakeControl {
    fn cmdline(&self, pid: u32) -> Option<String> {
        self.alive.contains(&pid).then(|| format!("cmd-{}", pid))
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.contains(&pid)
    }

    fn suspend(&self, pid: u32) -> anyhow::Result<()> {
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

fn victim_file(dir: &tempfile::TempDir, size: usize) -> PathBuf {
    let path = dir.path().join("doc.txt");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(&vec![b'a'; size]).unwrap();
    path
}

/// pid 100 lists the dir, fully reads a 1000-byte file, writes 600 bytes
/// of ciphertext elsewhere and unlinks the original: one substitution
/// alert, one suspend, one prompt, and a deny kills the process.
#[tokio::test]
async fn substitution_attack_is_contained_once() {
    let dir = tempfile::tempdir().unwrap();
    let victim = victim_file(&dir, 1000);
    let ciphertext = dir.path().join("doc.txt.locked");

    let control = FakeControl::with_alive(&[100]);
    let bus = Bus::new();
    let engine = Engine::new(&DetectionConfig::default(), control.clone());
    let containment = Containment::new(control.clone(), Vec::new());

    let engine_worker = spawn_worker(&bus, engine);
    let containment_worker = spawn_worker(&bus, containment);
    let mut prompts = bus.subscribe("test-ui", &[EventKind::AskUserAllowOrDeny]);

    bus.publish(Event::ListDir {
        timestamp: 0.0,
        pid: 100,
        path: dir.path().to_path_buf(),
    });
    bus.publish(Event::FileOpen {
        timestamp: 0.5,
        pid: 100,
        path: victim.clone(),
    });
    bus.publish(Event::FileRead {
        timestamp: 1.0,
        pid: 100,
        path: victim.clone(),
        size: 1000,
    });
    bus.publish(Event::FileWrite {
        timestamp: 2.0,
        pid: 100,
        path: ciphertext.clone(),
        size: 600,
    });
    bus.publish(Event::FileUnlink {
        timestamp: 3.0,
        pid: 100,
        path: victim.clone(),
    });

    let prompt = match prompts.rx.recv().await {
        Some(Event::AskUserAllowOrDeny(p)) => p,
        other => panic!("expected prompt, got {:?}", other),
    };
    assert_eq!(prompt.pid, 100);
    assert_eq!(prompt.path, victim);
    assert_eq!(prompt.cmdline, "cmd-100");

    // A duplicate alert for the same pid while the decision is pending is
    // ignored: still one suspend, one prompt.
    bus.publish(Event::CryptoRansom(RansomAlert {
        pid: 100,
        path: victim.clone(),
        pattern: RansomPattern::NewFileSubstitution,
    }));
    bus.publish(Event::UserDenyProcess { pid: 100 });

    bus.shutdown();
    engine_worker.await.unwrap();
    containment_worker.await.unwrap();

    assert_eq!(
        control.actions(),
        vec![Action::Suspend(100), Action::Kill(100)]
    );
    // Exactly one prompt: the next thing on the test queue is the stop
    // sentinel.
    assert!(matches!(prompts.rx.recv().await, Some(Event::Stop)));
}

/// Same setup with too little write volume: no alert, the file profile is
/// gone, but the pid stays tracked.
#[tokio::test]
async fn benign_deletion_produces_no_alert() {
    let dir = tempfile::tempdir().unwrap();
    let victim = victim_file(&dir, 1000);

    let control = FakeControl::with_alive(&[100]);
    let bus = Bus::new();
    let engine = Engine::new(&DetectionConfig::default(), control.clone());
    let profiles = engine.profiles();
    let containment = Containment::new(control.clone(), Vec::new());

    let engine_worker = spawn_worker(&bus, engine);
    let containment_worker = spawn_worker(&bus, containment);

    bus.publish(Event::ListDir {
        timestamp: 0.0,
        pid: 100,
        path: dir.path().to_path_buf(),
    });
    bus.publish(Event::FileOpen {
        timestamp: 0.5,
        pid: 100,
        path: victim.clone(),
    });
    bus.publish(Event::FileRead {
        timestamp: 1.0,
        pid: 100,
        path: victim.clone(),
        size: 1000,
    });
    bus.publish(Event::FileWrite {
        timestamp: 2.0,
        pid: 100,
        path: victim.clone(),
        size: 400, // below 1000 / 2
    });
    bus.publish(Event::FileUnlink {
        timestamp: 3.0,
        pid: 100,
        path: victim.clone(),
    });

    bus.shutdown();
    engine_worker.await.unwrap();
    containment_worker.await.unwrap();

    assert!(control.actions().is_empty());
    let table = profiles.lock().unwrap();
    let profile = table.get(&100).expect("pid profile persists");
    assert!(profile.files.is_empty());
}

/// An allow decision whitelists the command line, so a repeat offense by
/// the same command line is let through without containment.
#[tokio::test]
async fn allow_decision_grants_lasting_trust() {
    let dir = tempfile::tempdir().unwrap();
    let victim = victim_file(&dir, 100);

    let control = FakeControl::with_alive(&[100]);
    let bus = Bus::new();
    let engine = Engine::new(&DetectionConfig::default(), control.clone());
    let containment = Containment::new(control.clone(), Vec::new());
    let whitelist = containment.whitelist();

    let engine_worker = spawn_worker(&bus, engine);
    let containment_worker = spawn_worker(&bus, containment);
    let mut prompts = bus.subscribe("test-ui", &[EventKind::AskUserAllowOrDeny]);

    bus.publish(Event::ListDir {
        timestamp: 0.0,
        pid: 100,
        path: dir.path().to_path_buf(),
    });
    bus.publish(Event::FileOpen {
        timestamp: 0.5,
        pid: 100,
        path: victim.clone(),
    });
    bus.publish(Event::FileRead {
        timestamp: 1.0,
        pid: 100,
        path: victim.clone(),
        size: 100,
    });
    bus.publish(Event::FileWrite {
        timestamp: 1.5,
        pid: 100,
        path: victim.clone(),
        size: 100,
    });
    bus.publish(Event::FileClose {
        timestamp: 2.0,
        pid: 100,
        path: victim.clone(),
    });

    assert!(matches!(
        prompts.rx.recv().await,
        Some(Event::AskUserAllowOrDeny(_))
    ));
    bus.publish(Event::UserAllowProcess { pid: 100 });

    // Re-offend after the allow: a fresh alert for the now-whitelisted
    // command line is let through without a prompt.
    bus.publish(Event::CryptoRansom(RansomAlert {
        pid: 100,
        path: victim.clone(),
        pattern: RansomPattern::InPlaceOverwrite,
    }));

    bus.shutdown();
    engine_worker.await.unwrap();
    containment_worker.await.unwrap();

    assert_eq!(
        control.actions(),
        vec![Action::Suspend(100), Action::Resume(100)]
    );
    assert_eq!(*whitelist.lock().unwrap(), vec!["cmd-100".to_string()]);
    assert!(matches!(prompts.rx.recv().await, Some(Event::Stop)));
}
