//! Installation orchestration engine for source-based Linux distributions.
//!
//! Runs an externally planned, ordered list of privileged shell steps
//! inside a target root filesystem, keeps that root's special filesystems
//! mounted, turns package manager and kernel build output into live
//! progress, and retries the one well-known recoverable package failure.
//!
//! # Architecture
//!
//! ```text
//! distro-installer (binary: CLI + controller)
//!     │
//!     ├── config ──────────── TOML settings, tool vocabularies
//!     ├── plan ────────────── [[step]] plans, validation against disks
//!     │
//!     └── install::start_install
//!             │
//!             ├── credential ── gate: already root / sudo -n / password
//!             ├── sentinel ──── base-system marker, stage unpack
//!             ├── mount ─────── idempotent special-filesystem mounts
//!             └── sequencer ─── worker thread, one step at a time
//!                     │
//!                     ├── step ────── classification by tool token
//!                     ├── runner ──── pty stream / buffered / terminal
//!                     ├── progress ── per-tool line parsers
//!                     └── recovery ── one bounded retry
//! ```
//!
//! The worker reports everything through [`sequencer::RunEvent`]s; the
//! controller owns all rendering state.

pub mod config;
pub mod credential;
pub mod disks;
pub mod error;
pub mod install;
pub mod lock;
pub mod mount;
pub mod plan;
pub mod process;
pub mod progress;
pub mod recovery;
pub mod report;
pub mod runner;
pub mod sentinel;
pub mod sequencer;
pub mod step;
pub mod terminal;

pub use config::InstallerConfig;
pub use credential::Credential;
pub use error::{InstallError, RunResult};
pub use install::{start_install, BaseSystemPolicy, Installation, SystemHost};
pub use sequencer::{RunEvent, RunOutcome, Sequencer, StepStatus};
pub use step::{Step, StepClassification};
