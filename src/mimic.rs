//! Writable mimics
//!
//! A mimic turns a read-only directory into a writable surface that
//! looks identical to an observer: the original is kept aside with a
//! recursive bind, a tmpfs with matching mode and ownership is mounted
//! over it, every original entry is bound back on top, and the
//! safe-keeping view is dropped. Execution is transactional: any
//! failure rolls the namespace back to the pre-mimic state.

use log::warn;

use crate::assumptions::Assumptions;
use crate::change::{Action, Change};
use crate::entry::{EntryKind, MountEntry, OPT_NEEDED_BY, OPT_SYNTHETIC};
use crate::error::{Error, Result};
use crate::syscalls::{FileKind, SystemCalls};

/// Prefix under which the safe-keeping view of a mimicked directory is
/// temporarily bound.
pub const SAFE_KEEPING_PREFIX: &str = "/tmp/.snap";

/// Plan the changes that transform read-only `dir` into a writable
/// tmpfs populated with bindings to its original content.
///
/// `needed_by` is the mount target whose creation required the mimic;
/// every synthetic entry carries it as a back-reference.
pub fn plan_writable_mimic(
    sys: &dyn SystemCalls,
    dir: &str,
    needed_by: &str,
) -> Result<Vec<Change>> {
    if dir == "/" {
        // There is nowhere to safe-keep the root.
        return Err(Error::MimicOverRoot);
    }
    let info = sys
        .lstat(dir)
        .map_err(|e| Error::syscall(format!("cannot inspect {dir:?}"), e))?;
    let safe_keeping = format!("{SAFE_KEEPING_PREFIX}{dir}");
    let needed_by_opt = format!("{OPT_NEEDED_BY}{needed_by}");

    let mut changes = Vec::new();
    // Keep the original contents reachable while the tmpfs is built.
    changes.push(Change::mount(MountEntry::new(
        dir,
        &safe_keeping,
        "none",
        &["rbind"],
    )));
    // The tmpfs replicates the mode and ownership of the original.
    let mode_opt = format!("mode={:04o}", info.mode);
    let uid_opt = format!("uid={}", info.uid);
    let gid_opt = format!("gid={}", info.gid);
    changes.push(Change::mount(MountEntry::new(
        "tmpfs",
        dir,
        "tmpfs",
        &[
            OPT_SYNTHETIC,
            needed_by_opt.as_str(),
            mode_opt.as_str(),
            uid_opt.as_str(),
            gid_opt.as_str(),
        ],
    )));
    // Nothing is mounted yet; this is still the original directory.
    let entries = sys
        .readdir(dir)
        .map_err(|e| Error::syscall(format!("cannot read directory {dir:?}"), e))?;
    for entry in entries {
        let item = format!("{dir}/{}", entry.name);
        let hosted = format!("{safe_keeping}/{}", entry.name);
        match entry.kind {
            FileKind::Dir => {
                changes.push(Change::mount(MountEntry::new(
                    &hosted,
                    &item,
                    "none",
                    &["rbind", OPT_SYNTHETIC, needed_by_opt.as_str()],
                )));
            }
            FileKind::File => {
                changes.push(Change::mount(MountEntry::new(
                    &hosted,
                    &item,
                    "none",
                    &[
                        "bind",
                        "x-snapd.kind=file",
                        OPT_SYNTHETIC,
                        needed_by_opt.as_str(),
                    ],
                )));
            }
            FileKind::Symlink => match sys.readlink(&item) {
                Ok(target) => {
                    let symlink_opt = format!("x-snapd.symlink={target}");
                    changes.push(Change::mount(MountEntry::new(
                        "none",
                        &item,
                        "none",
                        &[
                            "x-snapd.kind=symlink",
                            symlink_opt.as_str(),
                            OPT_SYNTHETIC,
                            needed_by_opt.as_str(),
                        ],
                    )));
                }
                Err(e) => {
                    warn!("cannot read symlink {item:?}, skipping: {e}");
                }
            },
            FileKind::Other => {
                warn!("cannot replicate {item:?}, unsupported file type");
            }
        }
    }
    // The safe-keeping view is no longer needed once everything that
    // can be rebound has been rebound.
    changes.push(Change::unmount(MountEntry::new(
        "none",
        &safe_keeping,
        "none",
        &["x-snapd.detach"],
    )));
    Ok(changes)
}

/// Execute a mimic plan, returning the changes that must be persisted
/// in the current profile so later reconciliations can unwind the
/// mimic by re-driving the profile diff.
///
/// If any step fails the already-performed steps are compensated in
/// reverse order; a failure during that rollback is fatal.
pub fn exec_writable_mimic(
    sys: &dyn SystemCalls,
    plan: &[Change],
    assumptions: &mut Assumptions,
) -> Result<Vec<Change>> {
    let safe_keeping = &plan[0].entry.dir;
    let original = &plan[0].entry.name;
    let mut undo: Vec<Change> = Vec::new();
    for (index, change) in plan.iter().enumerate() {
        let mut inner = Vec::new();
        if let Err(err) = change.perform(sys, assumptions, &mut inner) {
            rollback(sys, assumptions, plan, &undo, index).map_err(|rollback_err| {
                Error::Fatal {
                    primary: Box::new(err.clone()),
                    rollback: Box::new(rollback_err),
                }
            })?;
            return Err(err);
        }
        if change.action == Action::Mount && change.entry.is_synthetic() {
            let mut stored = change.entry.clone();
            // The safe-keeping view is gone once the mimic is active, so
            // persisted entries reference the mount point itself.
            if let Some(rest) = stored
                .name
                .strip_prefix(safe_keeping.as_str())
                .map(str::to_string)
            {
                stored.name = format!("{original}{rest}");
            }
            // Directory rebinds may host nested mounts; make sure later
            // reconciliations detach them.
            if stored.kind() == EntryKind::Dir && stored.has_opt("rbind") {
                stored = stored.with_detach();
            }
            undo.push(Change::mount(stored));
        }
    }
    Ok(undo)
}

/// Plan and execute a writable mimic over `dir`.
pub fn create_writable_mimic(
    sys: &dyn SystemCalls,
    dir: &str,
    needed_by: &str,
    assumptions: &mut Assumptions,
) -> Result<Vec<Change>> {
    let plan = plan_writable_mimic(sys, dir, needed_by)?;
    exec_writable_mimic(sys, &plan, assumptions)
}

fn rollback(
    sys: &dyn SystemCalls,
    assumptions: &mut Assumptions,
    plan: &[Change],
    undo: &[Change],
    failed_index: usize,
) -> Result<()> {
    // The undo list never contains the initial safe-keeping bind; put it
    // back in front when it was performed.
    let mut recovery: Vec<&Change> = Vec::new();
    if failed_index > 0 {
        recovery.push(&plan[0]);
    }
    recovery.extend(undo.iter());
    for change in recovery.iter().rev() {
        if change.entry.kind() == EntryKind::Symlink {
            // Symlinks vanish together with the tmpfs they live on.
            continue;
        }
        let compensating = Change::unmount(change.entry.with_detach());
        let mut inner = Vec::new();
        match compensating.perform(sys, assumptions, &mut inner) {
            Ok(()) | Err(Error::IgnoredMissingMount) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
