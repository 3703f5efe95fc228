//! Mount-namespace reconciliation for confined applications.
//!
//! Given a *desired* fstab-like mount profile and the *current* one, the
//! engine plans an ordered list of mount, unmount and keep actions,
//! executes them with symlink-attack-resistant filesystem primitives,
//! and persists the resulting profile through a narrow collaborator
//! interface. Mount targets sitting on read-only substrates are handled
//! by transactionally overlaying a private tmpfs that mimics the
//! original directory contents.
//!
//! The crate deliberately excludes profile storage decisions, locking
//! protocols and logging backends; those arrive through the
//! [`update::ProfileUpdate`] trait and the `log` facade.

pub mod assumptions;
pub mod change;
pub mod entry;
pub mod error;
pub mod flags;
pub mod mimic;
pub mod pathiter;
pub mod plan;
pub mod profile;
pub mod safefs;
pub mod syscalls;
#[cfg(test)]
pub mod testing;
pub mod update;

pub use assumptions::{Assumptions, Restrictions};
pub use change::{Action, Change};
pub use entry::{EntryKind, MountEntry};
pub use error::{Error, Result};
pub use profile::MountProfile;
pub use syscalls::{LinuxSystemCalls, SystemCalls};
pub use update::{apply, LockGuard, ProfileUpdate};
