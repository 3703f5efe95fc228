//! Mount changes and their execution
//!
//! A `Change` pairs an action with a mount entry. Performing a `Mount`
//! may synthesize additional changes: when the mount target sits on a
//! read-only substrate or would trespass on the host, a writable mimic
//! is constructed first and its scaffolding is reported back to the
//! caller for persistence.

use std::fmt;

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};

use crate::assumptions::Assumptions;
use crate::entry::{EntryKind, MountEntry};
use crate::error::{Error, Result};
use crate::flags::mount_opts_to_flags;
use crate::mimic;
use crate::safefs;
use crate::syscalls::{FileKind, SystemCalls};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Mount,
    Unmount,
    Keep,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Mount => write!(f, "mount"),
            Action::Unmount => write!(f, "unmount"),
            Action::Keep => write!(f, "keep"),
        }
    }
}

/// A single planned or performed change to the mount namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub action: Action,
    pub entry: MountEntry,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.action, self.entry)
    }
}

impl Change {
    pub fn mount(entry: MountEntry) -> Self {
        Change {
            action: Action::Mount,
            entry,
        }
    }

    pub fn unmount(entry: MountEntry) -> Self {
        Change {
            action: Action::Unmount,
            entry,
        }
    }

    pub fn keep(entry: MountEntry) -> Self {
        Change {
            action: Action::Keep,
            entry,
        }
    }

    /// Perform the change. Changes synthesized as prerequisites (mimic
    /// scaffolding) are appended to `synthesized`; they are performed
    /// and recorded in `assumptions` even when the change itself then
    /// fails.
    pub fn perform(
        &self,
        sys: &dyn SystemCalls,
        assumptions: &mut Assumptions,
        synthesized: &mut Vec<Change>,
    ) -> Result<()> {
        match self.action {
            Action::Keep => Ok(()),
            Action::Unmount => {
                self.low_level_unmount(sys)?;
                assumptions.add_change(self);
                Ok(())
            }
            Action::Mount => {
                self.ensure_target(sys, assumptions, synthesized)?;
                if self.entry.origin() == "layout" && self.entry.is_bind() {
                    self.ensure_source(sys, assumptions, synthesized)?;
                }
                self.low_level_mount(sys)?;
                assumptions.add_change(self);
                Ok(())
            }
        }
    }

    /// Make sure the mount target exists and has the right file type.
    fn ensure_target(
        &self,
        sys: &dyn SystemCalls,
        assumptions: &mut Assumptions,
        synthesized: &mut Vec<Change>,
    ) -> Result<()> {
        let path = &self.entry.dir;
        match sys.lstat(path) {
            Ok(info) => match (self.entry.kind(), info.kind) {
                (EntryKind::Dir, FileKind::Dir) => Ok(()),
                (EntryKind::Dir, _) => Err(Error::NotADirectory(path.clone())),
                (EntryKind::File, FileKind::File) => Ok(()),
                (EntryKind::File, _) => Err(Error::NotAFile(path.clone())),
                (EntryKind::Symlink, FileKind::Symlink) => match sys.readlink(path) {
                    Ok(target) if target == self.entry.symlink_target() => Ok(()),
                    _ => Err(Error::FileInTheWay(path.clone())),
                },
                (EntryKind::Symlink, _) => Err(Error::FileInTheWay(path.clone())),
            },
            Err(Errno::ENOENT) => self.create_path(sys, path, true, assumptions, synthesized),
            Err(e) => Err(Error::syscall(format!("cannot inspect {path:?}"), e)),
        }
    }

    /// Make sure the source of a layout bind mount exists. Layouts may
    /// reference paths inside the application that appear only at run
    /// time; other entries keep strict sources.
    fn ensure_source(
        &self,
        sys: &dyn SystemCalls,
        assumptions: &mut Assumptions,
        synthesized: &mut Vec<Change>,
    ) -> Result<()> {
        let path = &self.entry.name;
        if !path.starts_with('/') {
            return Ok(());
        }
        match sys.lstat(path) {
            Ok(_) => Ok(()),
            Err(Errno::ENOENT) => self.create_path(sys, path, false, assumptions, synthesized),
            Err(e) => Err(Error::syscall(format!("cannot inspect {path:?}"), e)),
        }
    }

    /// Create `path` with the entry's file type, mode and ownership.
    /// With `poke_holes`, a read-only or trespass failure constructs a
    /// writable mimic once and retries.
    fn create_path(
        &self,
        sys: &dyn SystemCalls,
        path: &str,
        poke_holes: bool,
        assumptions: &mut Assumptions,
        synthesized: &mut Vec<Change>,
    ) -> Result<()> {
        let mode = self.entry.mode();
        let uid = self.entry.uid();
        let gid = self.entry.gid();
        let result = {
            let mut rs = assumptions.restrictions_for(path);
            match self.entry.kind() {
                EntryKind::Dir => safefs::mkdir_all(sys, path, mode, uid, gid, &mut rs),
                EntryKind::File => safefs::mkfile_all(sys, path, mode, uid, gid, &mut rs),
                EntryKind::Symlink => safefs::mksymlink_all(
                    sys,
                    path,
                    mode,
                    uid,
                    gid,
                    self.entry.symlink_target(),
                    &mut rs,
                ),
            }
        };
        let obstacle = match result {
            Err(Error::ReadOnlyFs(ref p)) if poke_holes => p.clone(),
            Err(Error::Trespassing { ref violated, .. }) if poke_holes => violated.clone(),
            other => return other,
        };
        let changes = mimic::create_writable_mimic(sys, &obstacle, path, assumptions)?;
        synthesized.extend(changes);
        self.create_path(sys, path, false, assumptions, synthesized)
    }

    fn low_level_mount(&self, sys: &dyn SystemCalls) -> Result<()> {
        if self.entry.kind() == EntryKind::Symlink {
            // Creating the symlink was the whole operation.
            return Ok(());
        }
        let (flags, unparsed) = mount_opts_to_flags(&self.entry.options);
        let data = unparsed.join(",");
        sys.mount(
            &self.entry.name,
            &self.entry.dir,
            &self.entry.fs_type,
            flags,
            &data,
        )
        .map_err(|e| {
            Error::syscall(
                format!("cannot mount {:?} at {:?}", self.entry.name, self.entry.dir),
                e,
            )
        })?;
        // The kernel ignores MS_RDONLY on the initial bind call; a bind
        // mount only becomes read-only through a remount.
        if flags.contains(MsFlags::MS_BIND) && flags.contains(MsFlags::MS_RDONLY) {
            sys.mount(
                "none",
                &self.entry.dir,
                "",
                flags | MsFlags::MS_REMOUNT,
                "",
            )
            .map_err(|e| {
                Error::syscall(
                    format!("cannot remount {:?} read-only", self.entry.dir),
                    e,
                )
            })?;
        }
        Ok(())
    }

    fn low_level_unmount(&self, sys: &dyn SystemCalls) -> Result<()> {
        if self.entry.kind() == EntryKind::Symlink {
            return match sys.remove(&self.entry.dir) {
                Ok(()) => Ok(()),
                Err(Errno::ENOENT) => Err(Error::IgnoredMissingMount),
                Err(e) => Err(Error::syscall(
                    format!("cannot remove {:?}", self.entry.dir),
                    e,
                )),
            };
        }
        let flags = if self.entry.is_detached() {
            // Isolate the mount from propagation first so that the
            // detach does not travel to peer namespaces.
            match sys.mount(
                "none",
                &self.entry.dir,
                "",
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                "",
            ) {
                Ok(()) | Err(Errno::EINVAL) => {}
                Err(Errno::ENOENT) => return Err(Error::IgnoredMissingMount),
                Err(e) => {
                    return Err(Error::syscall(
                        format!("cannot isolate {:?} from propagation", self.entry.dir),
                        e,
                    ))
                }
            }
            MntFlags::MNT_DETACH
        } else {
            MntFlags::UMOUNT_NOFOLLOW
        };
        match sys.unmount(&self.entry.dir, flags) {
            Ok(()) => Ok(()),
            Err(Errno::ENOENT) => Err(Error::IgnoredMissingMount),
            Err(e) => Err(Error::syscall(
                format!("cannot unmount {:?}", self.entry.dir),
                e,
            )),
        }
    }
}
