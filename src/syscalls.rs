//! System call capability
//!
//! Every kernel interaction the engine performs goes through the
//! [`SystemCalls`] trait so that the primitive layer can be exercised
//! against a recording implementation. The production implementation
//! talks to the kernel directly; descriptor-relative calls use the raw
//! `*at` family because symlink-attack resistance depends on the exact
//! flags passed at each traversal step.

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};

/// Result of a raw system call; context is added by the caller.
pub type OsResult<T> = std::result::Result<T, Errno>;

/// File type as reported by the stat family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Dir,
    File,
    Symlink,
    Other,
}

/// The slice of stat(2) output the engine consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl FileInfo {
    pub fn dir(mode: u32) -> Self {
        FileInfo {
            kind: FileKind::Dir,
            mode,
            uid: 0,
            gid: 0,
        }
    }

    pub fn file(mode: u32) -> Self {
        FileInfo {
            kind: FileKind::File,
            mode,
            uid: 0,
            gid: 0,
        }
    }

    pub fn symlink() -> Self {
        FileInfo {
            kind: FileKind::Symlink,
            mode: 0o777,
            uid: 0,
            gid: 0,
        }
    }
}

/// The slice of statfs(2) output the engine consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsInfo {
    /// Filesystem magic (`f_type`).
    pub fs_type: i64,
    /// Mount flags (`f_flags`), notably `ST_RDONLY`.
    pub flags: i64,
}

/// One directory entry, as needed for mimic planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub kind: FileKind,
}

/// Kernel operations used by the engine.
///
/// Path arguments are `str` because mount entries are fstab text; the
/// engine only ever passes clean absolute paths.
pub trait SystemCalls {
    fn open(&self, path: &str, flags: i32, mode: u32) -> OsResult<RawFd>;
    fn openat(&self, dirfd: RawFd, name: &str, flags: i32, mode: u32) -> OsResult<RawFd>;
    fn close(&self, fd: RawFd) -> OsResult<()>;
    fn mkdirat(&self, dirfd: RawFd, name: &str, mode: u32) -> OsResult<()>;
    fn fchown(&self, fd: RawFd, uid: u32, gid: u32) -> OsResult<()>;
    /// fstatat(2) with `AT_SYMLINK_NOFOLLOW`.
    fn fstatat(&self, dirfd: RawFd, name: &str) -> OsResult<FileInfo>;
    fn symlinkat(&self, target: &str, dirfd: RawFd, name: &str) -> OsResult<()>;
    fn readlinkat(&self, dirfd: RawFd, name: &str) -> OsResult<String>;
    fn fstat(&self, fd: RawFd) -> OsResult<FileInfo>;
    fn fstatfs(&self, fd: RawFd) -> OsResult<FsInfo>;
    fn lstat(&self, path: &str) -> OsResult<FileInfo>;
    fn readlink(&self, path: &str) -> OsResult<String>;
    fn readdir(&self, path: &str) -> OsResult<Vec<DirEntryInfo>>;
    fn remove(&self, path: &str) -> OsResult<()>;
    fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        flags: MsFlags,
        data: &str,
    ) -> OsResult<()>;
    fn unmount(&self, target: &str, flags: MntFlags) -> OsResult<()>;
}

/// Production implementation backed by the kernel.
#[derive(Debug, Default)]
pub struct LinuxSystemCalls;

fn cstr(s: &str) -> OsResult<CString> {
    CString::new(s).map_err(|_| Errno::EINVAL)
}

fn check(res: i32) -> OsResult<i32> {
    if res < 0 {
        Err(Errno::last())
    } else {
        Ok(res)
    }
}

fn kind_of(file_type: fs::FileType) -> FileKind {
    if file_type.is_dir() {
        FileKind::Dir
    } else if file_type.is_file() {
        FileKind::File
    } else if file_type.is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::Other
    }
}

fn kind_of_mode(mode: u32) -> FileKind {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileKind::Dir,
        libc::S_IFREG => FileKind::File,
        libc::S_IFLNK => FileKind::Symlink,
        _ => FileKind::Other,
    }
}

fn io_errno(err: &std::io::Error) -> Errno {
    Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO))
}

impl SystemCalls for LinuxSystemCalls {
    fn open(&self, path: &str, flags: i32, mode: u32) -> OsResult<RawFd> {
        let path = cstr(path)?;
        check(unsafe { libc::open(path.as_ptr(), flags, mode as libc::mode_t) })
    }

    fn openat(&self, dirfd: RawFd, name: &str, flags: i32, mode: u32) -> OsResult<RawFd> {
        let name = cstr(name)?;
        check(unsafe { libc::openat(dirfd, name.as_ptr(), flags, mode as libc::mode_t) })
    }

    fn close(&self, fd: RawFd) -> OsResult<()> {
        check(unsafe { libc::close(fd) }).map(|_| ())
    }

    fn mkdirat(&self, dirfd: RawFd, name: &str, mode: u32) -> OsResult<()> {
        let name = cstr(name)?;
        check(unsafe { libc::mkdirat(dirfd, name.as_ptr(), mode as libc::mode_t) }).map(|_| ())
    }

    fn fchown(&self, fd: RawFd, uid: u32, gid: u32) -> OsResult<()> {
        check(unsafe { libc::fchown(fd, uid, gid) }).map(|_| ())
    }

    fn fstatat(&self, dirfd: RawFd, name: &str) -> OsResult<FileInfo> {
        let name = cstr(name)?;
        let mut stat = unsafe { std::mem::zeroed::<libc::stat>() };
        check(unsafe {
            libc::fstatat(dirfd, name.as_ptr(), &mut stat, libc::AT_SYMLINK_NOFOLLOW)
        })?;
        Ok(FileInfo {
            kind: kind_of_mode(stat.st_mode),
            mode: stat.st_mode & 0o7777,
            uid: stat.st_uid,
            gid: stat.st_gid,
        })
    }

    fn symlinkat(&self, target: &str, dirfd: RawFd, name: &str) -> OsResult<()> {
        let target = cstr(target)?;
        let name = cstr(name)?;
        check(unsafe { libc::symlinkat(target.as_ptr(), dirfd, name.as_ptr()) }).map(|_| ())
    }

    fn readlinkat(&self, dirfd: RawFd, name: &str) -> OsResult<String> {
        let name = cstr(name)?;
        let mut buf = vec![0u8; libc::PATH_MAX as usize];
        let len = unsafe {
            libc::readlinkat(
                dirfd,
                name.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        };
        if len < 0 {
            return Err(Errno::last());
        }
        buf.truncate(len as usize);
        String::from_utf8(buf).map_err(|_| Errno::EINVAL)
    }

    fn fstat(&self, fd: RawFd) -> OsResult<FileInfo> {
        let mut stat = unsafe { std::mem::zeroed::<libc::stat>() };
        check(unsafe { libc::fstat(fd, &mut stat) })?;
        Ok(FileInfo {
            kind: kind_of_mode(stat.st_mode),
            mode: stat.st_mode & 0o7777,
            uid: stat.st_uid,
            gid: stat.st_gid,
        })
    }

    fn fstatfs(&self, fd: RawFd) -> OsResult<FsInfo> {
        let mut statfs = unsafe { std::mem::zeroed::<libc::statfs>() };
        check(unsafe { libc::fstatfs(fd, &mut statfs) })?;
        let mut statvfs = unsafe { std::mem::zeroed::<libc::statvfs>() };
        check(unsafe { libc::fstatvfs(fd, &mut statvfs) })?;
        Ok(FsInfo {
            fs_type: statfs.f_type as i64,
            flags: statvfs.f_flag as i64,
        })
    }

    fn lstat(&self, path: &str) -> OsResult<FileInfo> {
        let meta = fs::symlink_metadata(path).map_err(|e| io_errno(&e))?;
        Ok(FileInfo {
            kind: kind_of(meta.file_type()),
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
        })
    }

    fn readlink(&self, path: &str) -> OsResult<String> {
        let target = fs::read_link(path).map_err(|e| io_errno(&e))?;
        String::from_utf8(target.as_os_str().as_bytes().to_vec()).map_err(|_| Errno::EINVAL)
    }

    fn readdir(&self, path: &str) -> OsResult<Vec<DirEntryInfo>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| io_errno(&e))? {
            let entry = entry.map_err(|e| io_errno(&e))?;
            let file_type = entry.file_type().map_err(|e| io_errno(&e))?;
            entries.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: kind_of(file_type),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn remove(&self, path: &str) -> OsResult<()> {
        let meta = fs::symlink_metadata(path).map_err(|e| io_errno(&e))?;
        let res = if meta.file_type().is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        res.map_err(|e| io_errno(&e))
    }

    fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        flags: MsFlags,
        data: &str,
    ) -> OsResult<()> {
        let source = if source.is_empty() { None } else { Some(source) };
        let fs_type = if fs_type.is_empty() { None } else { Some(fs_type) };
        let data = if data.is_empty() { None } else { Some(data) };
        nix::mount::mount(source, Path::new(target), fs_type, flags, data)
    }

    fn unmount(&self, target: &str, flags: MntFlags) -> OsResult<()> {
        nix::mount::umount2(Path::new(target), flags)
    }
}

// Flag bits used when walking paths; grouped here so the primitive layer
// and its tests agree on the exact traversal contract.
pub const O_NOFOLLOW: i32 = libc::O_NOFOLLOW;
pub const O_CLOEXEC: i32 = libc::O_CLOEXEC;
pub const O_DIRECTORY: i32 = libc::O_DIRECTORY;
pub const O_PATH: i32 = libc::O_PATH;
pub const O_CREAT: i32 = libc::O_CREAT;
pub const O_EXCL: i32 = libc::O_EXCL;
pub const O_RDONLY: i32 = libc::O_RDONLY;

/// Render open flags the way traces spell them.
pub fn open_flags_repr(flags: i32) -> String {
    let known = [
        (O_RDONLY, "O_RDONLY"),
        (libc::O_WRONLY, "O_WRONLY"),
        (libc::O_RDWR, "O_RDWR"),
        (O_CREAT, "O_CREAT"),
        (O_EXCL, "O_EXCL"),
        (O_NOFOLLOW, "O_NOFOLLOW"),
        (O_CLOEXEC, "O_CLOEXEC"),
        (O_DIRECTORY, "O_DIRECTORY"),
        (O_PATH, "O_PATH"),
    ];
    let mut parts = Vec::new();
    let mut rest = flags;
    for (bit, name) in known {
        if bit != 0 && rest & bit == bit {
            parts.push(name);
            rest &= !bit;
        }
    }
    if parts.is_empty() {
        return format!("{flags:#x}");
    }
    if rest != 0 {
        return format!("{}|{rest:#x}", parts.join("|"));
    }
    parts.join("|")
}

/// Render mount flags the way traces spell them.
pub fn mount_flags_repr(flags: MsFlags) -> String {
    if flags.is_empty() {
        return "0".to_string();
    }
    format!("{flags:?}")
        .replace("MsFlags(", "")
        .replace(')', "")
        .replace(" | ", "|")
}

/// Render unmount flags the way traces spell them.
pub fn unmount_flags_repr(flags: MntFlags) -> String {
    if flags.is_empty() {
        return "0".to_string();
    }
    format!("{flags:?}")
        .replace("MntFlags(", "")
        .replace(')', "")
        .replace(" | ", "|")
}
