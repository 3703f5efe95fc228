//! Filesystem mutability assumptions
//!
//! Per-reconciliation scratch state deciding where the engine may write
//! without trespassing on the host filesystem: whitelisted path
//! prefixes, plus the history of changes already performed, which
//! identifies tmpfs mounts that are private to the sandbox.

use std::os::unix::io::RawFd;

use crate::change::{Action, Change};
use crate::error::{Error, Result};
use crate::pathiter::{clean_path, path_has_prefix};
use crate::syscalls::SystemCalls;

// Filesystem magic values from statfs(2).
const SQUASHFS_MAGIC: i64 = 0x7371_7368;
const TMPFS_MAGIC: i64 = 0x0102_1994;

/// Scratch state for one reconciliation cycle.
#[derive(Debug, Default)]
pub struct Assumptions {
    unrestricted_paths: Vec<String>,
    past_changes: Vec<Change>,
}

impl Assumptions {
    pub fn new() -> Self {
        Assumptions::default()
    }

    /// Add path prefixes where writes are permitted to affect the host.
    pub fn add_unrestricted_paths<I, S>(&mut self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for path in paths {
            let mut p = clean_path(path.as_ref());
            if p != "/" {
                p.push('/');
            }
            self.unrestricted_paths.push(p);
        }
    }

    /// Record a successfully performed change; the tmpfs detector scans
    /// this history in reverse.
    pub fn add_change(&mut self, change: &Change) {
        self.past_changes.push(change.clone());
    }

    pub fn past_changes(&self) -> &[Change] {
        &self.past_changes
    }

    /// Restrictions governing a write aimed at `desired_path`.
    ///
    /// Paths under an unrestricted prefix get a disengaged value; all
    /// others start out restricted and stay so until a check passes or a
    /// fresh directory is created along the way.
    pub fn restrictions_for(&self, desired_path: &str) -> Restrictions<'_> {
        Restrictions {
            assumptions: Some(self),
            desired_path: desired_path.to_string(),
            restricted: self.is_restricted(desired_path),
        }
    }

    fn is_restricted(&self, path: &str) -> bool {
        !self
            .unrestricted_paths
            .iter()
            .any(|prefix| path_has_prefix(path, prefix))
    }

    /// Decide whether writing to the directory open as `dir_fd` (named
    /// `dir_name`) can affect the host filesystem.
    ///
    /// Writes are permitted when the directory is under an unrestricted
    /// prefix, sits on a read-only substrate (the write will fail with
    /// EROFS, which callers turn into a mimic), or sits on a tmpfs this
    /// engine mounted during the current reconciliation.
    pub fn can_write_to_directory(
        &self,
        sys: &dyn SystemCalls,
        dir_fd: RawFd,
        dir_name: &str,
    ) -> Result<bool> {
        if !self.is_restricted(dir_name) {
            return Ok(true);
        }
        let fs = sys
            .fstatfs(dir_fd)
            .map_err(|e| Error::syscall(format!("cannot fstatfs {dir_name:?}"), e))?;
        if fs.flags & (libc::ST_RDONLY as i64) != 0 || fs.fs_type == SQUASHFS_MAGIC {
            return Ok(true);
        }
        if fs.fs_type == TMPFS_MAGIC && self.is_private_tmpfs(dir_name) {
            return Ok(true);
        }
        Ok(false)
    }

    fn is_private_tmpfs(&self, dir_name: &str) -> bool {
        // The sandbox initializer mounts a tmpfs over /var/lib before the
        // engine ever runs, so it never shows up in the change history.
        #[cfg(feature = "var-lib-tmpfs")]
        if dir_name == "/var/lib" {
            return true;
        }
        for change in self.past_changes.iter().rev() {
            if change.entry.dir != dir_name {
                continue;
            }
            return match change.action {
                Action::Mount => change.entry.fs_type == "tmpfs",
                Action::Unmount => false,
                Action::Keep => continue,
            };
        }
        false
    }
}

/// Restricted-write latch for a single primitive operation.
///
/// The latch disengages, for the remainder of the operation, as soon as
/// a fresh directory is created on a verified substrate; it never
/// re-engages within one operation.
#[derive(Debug)]
pub struct Restrictions<'a> {
    assumptions: Option<&'a Assumptions>,
    desired_path: String,
    restricted: bool,
}

impl Restrictions<'_> {
    /// A disengaged value for operations exempt from checking.
    pub fn unrestricted() -> Restrictions<'static> {
        Restrictions {
            assumptions: None,
            desired_path: String::new(),
            restricted: false,
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    /// Release the latch for the rest of the operation.
    pub fn lift(&mut self) {
        self.restricted = false;
    }

    /// Verify that writing into the directory open as `dir_fd` does not
    /// trespass on the host.
    pub fn check(&mut self, sys: &dyn SystemCalls, dir_fd: RawFd, dir_name: &str) -> Result<()> {
        if !self.restricted {
            return Ok(());
        }
        let assumptions = match self.assumptions {
            Some(a) => a,
            None => return Ok(()),
        };
        if assumptions.can_write_to_directory(sys, dir_fd, dir_name)? {
            return Ok(());
        }
        Err(Error::Trespassing {
            violated: clean_path(dir_name),
            desired: self.desired_path.clone(),
        })
    }
}
