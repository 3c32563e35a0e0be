//! Event types flowing over the bus
//!
//! Raw file-activity events come from the tracer; alert, prompt and
//! decision events are produced by the core components themselves.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Discriminant used for bus routing. Every [`Event`] maps to exactly
/// one kind; subscribers declare the kinds they handle up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FileOpen,
    ListDir,
    FileRead,
    FileWrite,
    FileUnlink,
    FileClose,
    CryptoRansom,
    AskUserAllowOrDeny,
    UserAllowProcess,
    UserDenyProcess,
}

/// A single event instance.
///
/// `Stop` is the per-subscriber shutdown sentinel. It is never routed by
/// kind; the bus pushes it directly onto each subscriber's own queue.
#[derive(Debug, Clone)]
pub enum Event {
    FileOpen {
        timestamp: f64,
        pid: u32,
        path: PathBuf,
    },
    ListDir {
        timestamp: f64,
        pid: u32,
        path: PathBuf,
    },
    FileRead {
        timestamp: f64,
        pid: u32,
        path: PathBuf,
        size: u64,
    },
    FileWrite {
        timestamp: f64,
        pid: u32,
        path: PathBuf,
        size: u64,
    },
    FileUnlink {
        timestamp: f64,
        pid: u32,
        path: PathBuf,
    },
    FileClose {
        timestamp: f64,
        pid: u32,
        path: PathBuf,
    },
    CryptoRansom(RansomAlert),
    AskUserAllowOrDeny(DecisionPrompt),
    UserAllowProcess {
        pid: u32,
    },
    UserDenyProcess {
        pid: u32,
    },
    Stop,
}

impl Event {
    /// Routing kind of this event. `Stop` has no kind; asking for one is
    /// a programming error.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::FileOpen { .. } => EventKind::FileOpen,
            Event::ListDir { .. } => EventKind::ListDir,
            Event::FileRead { .. } => EventKind::FileRead,
            Event::FileWrite { .. } => EventKind::FileWrite,
            Event::FileUnlink { .. } => EventKind::FileUnlink,
            Event::FileClose { .. } => EventKind::FileClose,
            Event::CryptoRansom(_) => EventKind::CryptoRansom,
            Event::AskUserAllowOrDeny(_) => EventKind::AskUserAllowOrDeny,
            Event::UserAllowProcess { .. } => EventKind::UserAllowProcess,
            Event::UserDenyProcess { .. } => EventKind::UserDenyProcess,
            Event::Stop => panic!("stop sentinel has no routing kind"),
        }
    }
}

/// Which destructive pattern the classifier matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RansomPattern {
    /// Victim file fully read, comparable volume written elsewhere, victim
    /// unlinked: the encrypted copy replaced the original.
    NewFileSubstitution,
    /// Victim file fully read and fully rewritten in place before close.
    InPlaceOverwrite,
}

/// Emitted by the detection engine when a tracked file's terminal event
/// matches a ransomware pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RansomAlert {
    pub pid: u32,
    pub path: PathBuf,
    pub pattern: RansomPattern,
}

/// Emitted by the containment handler after a successful suspend; the
/// front-end renders it and answers with an allow or deny decision.
#[derive(Debug, Clone)]
pub struct DecisionPrompt {
    pub pid: u32,
    pub path: PathBuf,
    pub cmdline: String,
}
