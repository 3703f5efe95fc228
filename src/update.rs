//! Reconciliation
//!
//! One reconciliation cycle loads the desired and current profiles from
//! a collaborator, plans the needed changes, performs them and saves
//! the resulting profile back. The collaborator owns profile storage,
//! locking and the writable-path whitelist; the engine owns everything
//! in between.

use log::{debug, warn};

use crate::assumptions::Assumptions;
use crate::change::{Action, Change};
use crate::error::{Error, Result};
use crate::plan;
use crate::profile::MountProfile;

/// Scoped lock handle; the release action runs when the guard drops,
/// on every exit path.
pub struct LockGuard(Option<Box<dyn FnOnce()>>);

impl LockGuard {
    pub fn new(release: impl FnOnce() + 'static) -> Self {
        LockGuard(Some(Box::new(release)))
    }

    /// A guard that releases nothing.
    pub fn noop() -> Self {
        LockGuard(None)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

/// The capabilities a reconciliation consumes from its collaborator.
///
/// Production implementations exist per profile kind (system-wide and
/// per-user); tests substitute a stub. `needed_changes` and
/// `perform_change` have working defaults and are overridable for
/// testing.
pub trait ProfileUpdate {
    /// Acquire locks appropriate for the update.
    fn lock(&self) -> Result<LockGuard>;

    /// Filesystem mutability assumptions for this update, seeded with
    /// the whitelisted writable prefixes.
    fn assumptions(&self) -> Assumptions;

    /// The mount profile that should be constructed.
    fn load_desired_profile(&self) -> Result<MountProfile>;

    /// The mount profile that is currently applied.
    fn load_current_profile(&self) -> Result<MountProfile>;

    /// Persist the mount profile that is now applied.
    fn save_current_profile(&self, profile: &MountProfile) -> Result<()>;

    /// Compute the set of changes between two profiles.
    fn needed_changes(&self, current: &MountProfile, desired: &MountProfile) -> Vec<Change> {
        plan::needed_changes(current, desired)
    }

    /// Perform a single change, appending any synthesized prerequisite
    /// changes to `synthesized`.
    fn perform_change(
        &self,
        change: &Change,
        assumptions: &mut Assumptions,
        synthesized: &mut Vec<Change>,
    ) -> Result<()>;
}

/// Run one reconciliation cycle.
pub fn apply(up: &dyn ProfileUpdate) -> Result<()> {
    let _lock = up.lock()?;

    let desired = up.load_desired_profile()?;
    debug_show_profile(&desired, "desired mount profile");
    let current = up.load_current_profile()?;
    debug_show_profile(&current, "current mount profile (before applying changes)");

    // Seed the history so the tmpfs detector recognizes mounts applied
    // by earlier reconciliations.
    let mut assumptions = up.assumptions();
    for entry in &current.entries {
        assumptions.add_change(&Change::mount(entry.clone()));
    }

    let planned = up.needed_changes(&current, &desired);
    debug!("mount changes needed:");
    for change in &planned {
        debug!("\t* {change}");
    }

    let mut changes_made: Vec<Change> = Vec::new();
    for change in &planned {
        let mut synthesized = Vec::new();
        let result = up.perform_change(change, &mut assumptions, &mut synthesized);
        // Whatever scaffolding was built must be persisted, even when
        // the change itself then failed.
        changes_made.extend(synthesized);
        match result {
            Ok(()) => changes_made.push(change.clone()),
            Err(err @ Error::Fatal { .. }) => {
                // The namespace is inconsistent; persist nothing.
                return Err(err);
            }
            Err(err) => {
                if matches!(change.entry.origin(), "layout" | "overname") {
                    save_current(up, &changes_made)?;
                    return Err(err);
                }
                if err == Error::IgnoredMissingMount {
                    debug!("cannot change mount namespace according to change {change}: {err}");
                } else {
                    warn!("cannot change mount namespace according to change {change}: {err}");
                }
            }
        }
    }
    save_current(up, &changes_made)
}

fn save_current(up: &dyn ProfileUpdate, changes_made: &[Change]) -> Result<()> {
    let entries = changes_made
        .iter()
        .filter(|c| matches!(c.action, Action::Mount | Action::Keep))
        .map(|c| c.entry.clone())
        .collect();
    let profile = MountProfile::new(entries);
    debug_show_profile(&profile, "current mount profile (after applying changes)");
    up.save_current_profile(&profile)
}

fn debug_show_profile(profile: &MountProfile, name: &str) {
    debug!("{name}:");
    for entry in &profile.entries {
        debug!("\t{entry}");
    }
}
