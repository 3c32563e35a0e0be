//! ransomwatch - host-based ransomware early-detection and containment
//!
//! Watches per-process file-system activity delivered by an external
//! tracer, recognizes the behavioral signature of bulk encrypt-and-destroy
//! operations, and reversibly freezes the offending process pending a
//! human decision.
//!
//! # Architecture
//!
//! Three subsystems hang off a typed publish/subscribe [`bus`]:
//!
//! - the [`engine`] consumes raw file events, keeps per-process behavioral
//!   profiles and emits a ransom alert when a tracked file's terminal
//!   event matches an encrypt-and-destroy pattern;
//! - [`containment`] suspends the suspect, consults the command-line
//!   whitelist and applies the operator's allow/deny answer;
//! - the [`console`] front-end renders prompts and publishes the answer.
//!
//! Each subscriber drains its own queue on its own worker, so events are
//! handled in publish order per subscriber with no ordering across
//! subscribers. A background reaper bounds profile-table growth.

pub mod bus;
pub mod config;
pub mod console;
pub mod containment;
pub mod daemon;
pub mod engine;
pub mod event;
pub mod process;
pub mod tracer;

pub use bus::{Bus, Subscriber};
pub use config::Config;
pub use containment::Containment;
pub use engine::Engine;
pub use event::{Event, EventKind, RansomAlert, RansomPattern};
pub use process::{ProcessControl, SysProcessControl};
