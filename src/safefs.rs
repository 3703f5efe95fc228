//! Safe filesystem primitives
//!
//! Creation of directories, files and symlinks along an absolute path
//! with descriptor-based traversal: every component is opened with
//! O_NOFOLLOW relative to its parent, so no step can be redirected
//! through a symlink planted by the confined application. All writes go
//! through the restricted-write check carried by [`Restrictions`].

use std::os::unix::io::RawFd;

use nix::errno::Errno;

use crate::assumptions::Restrictions;
use crate::error::{Error, Result};
use crate::pathiter::{clean_path, split_dir_leaf, PathIterator};
use crate::syscalls::{
    FileKind, SystemCalls, O_CLOEXEC, O_CREAT, O_DIRECTORY, O_EXCL, O_NOFOLLOW, O_PATH, O_RDONLY,
};

const OPEN_FLAGS: i32 = O_NOFOLLOW | O_CLOEXEC | O_DIRECTORY;
const PATH_FLAGS: i32 = O_PATH | O_NOFOLLOW | O_CLOEXEC;

/// Descriptors held during one traversal, closed LIFO on every exit.
struct FdStack<'a> {
    sys: &'a dyn SystemCalls,
    fds: Vec<RawFd>,
}

impl<'a> FdStack<'a> {
    fn new(sys: &'a dyn SystemCalls) -> Self {
        FdStack { sys, fds: Vec::new() }
    }

    fn push(&mut self, fd: RawFd) {
        self.fds.push(fd);
    }
}

impl Drop for FdStack<'_> {
    fn drop(&mut self) {
        while let Some(fd) = self.fds.pop() {
            let _ = self.sys.close(fd);
        }
    }
}

/// A descriptor returned by [`open_path`]; closed when dropped. Opened
/// with O_PATH, so it carries no I/O privilege.
pub struct PathFd<'a> {
    sys: &'a dyn SystemCalls,
    fd: RawFd,
}

impl std::fmt::Debug for PathFd<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathFd").field("fd", &self.fd).finish()
    }
}

impl PathFd<'_> {
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for PathFd<'_> {
    fn drop(&mut self) {
        let _ = self.sys.close(self.fd);
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::RelativePath(path.to_string()));
    }
    if clean_path(path) != path {
        return Err(Error::UncleanPath(path.to_string()));
    }
    Ok(())
}

/// Open `path` while verifying that no component is a symbolic link.
pub fn open_path<'a>(sys: &'a dyn SystemCalls, path: &str) -> Result<PathFd<'a>> {
    validate_path(path)?;
    let mut iter = PathIterator::new(path)?;
    iter.next(); // the leading "/"
    let mut fd = sys
        .open("/", PATH_FLAGS | O_DIRECTORY, 0)
        .map_err(|e| Error::syscall("cannot open root directory", e))?;
    while iter.next() {
        // Every non-final component must be a directory; the leaf may be
        // anything but a symlink, which the final fstat rules out.
        let leaf = iter.current_path().len() == iter.path().len();
        let flags = if leaf { PATH_FLAGS } else { PATH_FLAGS | O_DIRECTORY };
        let name = iter.current_clean_name();
        match sys.openat(fd, name, flags, 0) {
            Ok(next) => {
                let _ = sys.close(fd);
                fd = next;
            }
            Err(e) => {
                let _ = sys.close(fd);
                return Err(Error::syscall(
                    format!(
                        "cannot open path segment {:?} (got up to {:?})",
                        name,
                        iter.current_base()
                    ),
                    e,
                ));
            }
        }
    }
    match sys.fstat(fd) {
        Ok(info) if info.kind == FileKind::Symlink => {
            let _ = sys.close(fd);
            Err(Error::SymlinkInPath(path.to_string()))
        }
        Ok(_) => Ok(PathFd { sys, fd }),
        Err(e) => {
            let _ = sys.close(fd);
            Err(Error::syscall(format!("cannot inspect {path:?}"), e))
        }
    }
}

/// Create one directory inside the directory open as `dir_fd`.
/// Returns true when the directory was actually created.
fn mk_dir(
    sys: &dyn SystemCalls,
    dir_fd: RawFd,
    dir_name: &str,
    name: &str,
    mode: u32,
    rs: &mut Restrictions<'_>,
) -> Result<bool> {
    check_before_write(sys, dir_fd, dir_name, name, rs)?;
    match sys.mkdirat(dir_fd, name, mode) {
        Ok(()) => Ok(true),
        Err(Errno::EEXIST) => Ok(false),
        Err(Errno::EROFS) => Err(Error::ReadOnlyFs(dir_name.to_string())),
        Err(e) => Err(Error::syscall(
            format!("cannot create directory segment {name:?}"),
            e,
        )),
    }
}

/// Create one empty file inside the directory open as `dir_fd`.
fn mk_file(
    sys: &dyn SystemCalls,
    dir_fd: RawFd,
    dir_name: &str,
    name: &str,
    mode: u32,
    uid: u32,
    gid: u32,
    rs: &mut Restrictions<'_>,
    fds: &mut FdStack<'_>,
) -> Result<()> {
    check_before_write(sys, dir_fd, dir_name, name, rs)?;
    const CREATE_FLAGS: i32 = O_CREAT | O_EXCL | O_NOFOLLOW | O_CLOEXEC | O_RDONLY;
    match sys.openat(dir_fd, name, CREATE_FLAGS, mode) {
        Ok(fd) => {
            fds.push(fd);
            sys.fchown(fd, uid, gid)
                .map_err(|e| Error::syscall(format!("cannot chown file {name:?}"), e))?;
            rs.lift();
            Ok(())
        }
        Err(Errno::EEXIST) => Ok(()),
        Err(Errno::EROFS) => Err(Error::ReadOnlyFs(dir_name.to_string())),
        Err(e) => Err(Error::syscall(format!("cannot create file {name:?}"), e)),
    }
}

/// Create one symlink inside the directory open as `dir_fd`. An
/// existing symlink with the same target is a no-op success.
fn mk_symlink(
    sys: &dyn SystemCalls,
    dir_fd: RawFd,
    dir_name: &str,
    name: &str,
    target: &str,
    path: &str,
    rs: &mut Restrictions<'_>,
) -> Result<()> {
    check_before_write(sys, dir_fd, dir_name, name, rs)?;
    match sys.symlinkat(target, dir_fd, name) {
        Ok(()) => {
            rs.lift();
            Ok(())
        }
        Err(Errno::EEXIST) => match sys.readlinkat(dir_fd, name) {
            Ok(existing) if existing == target => Ok(()),
            _ => Err(Error::FileInTheWay(path.to_string())),
        },
        Err(Errno::EROFS) => Err(Error::ReadOnlyFs(dir_name.to_string())),
        Err(e) => Err(Error::syscall(format!("cannot create symlink {name:?}"), e)),
    }
}

/// In restricted mode, verify the write before it happens. Existing
/// objects are probed first so that an operation which creates nothing
/// can never trespass.
fn check_before_write(
    sys: &dyn SystemCalls,
    dir_fd: RawFd,
    dir_name: &str,
    name: &str,
    rs: &mut Restrictions<'_>,
) -> Result<()> {
    if !rs.is_restricted() {
        return Ok(());
    }
    if sys.fstatat(dir_fd, name).is_ok() {
        return Ok(());
    }
    rs.check(sys, dir_fd, dir_name)
}

/// Create every missing directory along `base`, returning a descriptor
/// of the deepest one. Descriptors stay open in `fds` until the whole
/// operation finishes.
fn mk_prefix(
    sys: &dyn SystemCalls,
    base: &str,
    mode: u32,
    uid: u32,
    gid: u32,
    rs: &mut Restrictions<'_>,
    fds: &mut FdStack<'_>,
) -> Result<RawFd> {
    let mut iter = PathIterator::new(base)?;
    iter.next(); // the leading "/"
    let mut fd = sys
        .open("/", OPEN_FLAGS, 0)
        .map_err(|e| Error::syscall("cannot open root directory", e))?;
    fds.push(fd);
    while iter.next() {
        let name = iter.current_clean_name();
        let dir_name = iter.current_base();
        let made = mk_dir(sys, fd, dir_name, name, mode, rs)?;
        fd = sys.openat(fd, name, OPEN_FLAGS, 0).map_err(|e| {
            Error::syscall(
                format!("cannot open path segment {name:?} (got up to {dir_name:?})"),
                e,
            )
        })?;
        fds.push(fd);
        if made {
            sys.fchown(fd, uid, gid)
                .map_err(|e| Error::syscall(format!("cannot chown directory {name:?}"), e))?;
            rs.lift();
        }
    }
    Ok(fd)
}

/// Create a directory and all of its missing parents.
pub fn mkdir_all(
    sys: &dyn SystemCalls,
    path: &str,
    mode: u32,
    uid: u32,
    gid: u32,
    rs: &mut Restrictions<'_>,
) -> Result<()> {
    validate_path(path)?;
    let mut fds = FdStack::new(sys);
    mk_prefix(sys, path, mode, uid, gid, rs, &mut fds)?;
    Ok(())
}

/// Create a zero-byte file and all of its missing parents.
pub fn mkfile_all(
    sys: &dyn SystemCalls,
    path: &str,
    mode: u32,
    uid: u32,
    gid: u32,
    rs: &mut Restrictions<'_>,
) -> Result<()> {
    validate_path(path)?;
    let (base, leaf) = split_dir_leaf(path);
    if leaf.is_empty() {
        return Err(Error::RootPath);
    }
    let mut fds = FdStack::new(sys);
    let dir_fd = mk_prefix(sys, base, mode, uid, gid, rs, &mut fds)?;
    mk_file(sys, dir_fd, base, leaf, mode, uid, gid, rs, &mut fds)
}

/// Create a symlink pointing at `target` and all of its missing parents.
pub fn mksymlink_all(
    sys: &dyn SystemCalls,
    path: &str,
    mode: u32,
    uid: u32,
    gid: u32,
    target: &str,
    rs: &mut Restrictions<'_>,
) -> Result<()> {
    validate_path(path)?;
    if target.is_empty() {
        return Err(Error::EmptySymlinkTarget);
    }
    let (base, leaf) = split_dir_leaf(path);
    if leaf.is_empty() {
        return Err(Error::RootPath);
    }
    let mut fds = FdStack::new(sys);
    let dir_fd = mk_prefix(sys, base, mode, uid, gid, rs, &mut fds)?;
    mk_symlink(sys, dir_fd, base, leaf, target, path, rs)
}
