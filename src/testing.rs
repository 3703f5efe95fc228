//! Recording system-call implementation for tests
//!
//! Records every call as a compact string, simulates descriptor
//! allocation and supports fault and result injection keyed by the same
//! strings, so tests can assert the exact traversal a primitive
//! performed and that no descriptor leaked on any exit path.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};

use crate::syscalls::{
    mount_flags_repr, open_flags_repr, unmount_flags_repr, DirEntryInfo, FileInfo, FsInfo,
    OsResult, SystemCalls,
};

fn mode_repr(mode: u32) -> String {
    if mode == 0 {
        "0".to_string()
    } else {
        format!("{mode:#o}")
    }
}

enum Fault {
    Always(Errno),
    Sequence(VecDeque<Errno>),
}

#[derive(Default)]
struct State {
    calls: Vec<String>,
    open_fds: BTreeMap<RawFd, String>,
    faults: HashMap<String, Fault>,
    lstat_results: HashMap<String, FileInfo>,
    fstatat_results: HashMap<String, FileInfo>,
    fstat_results: HashMap<RawFd, FileInfo>,
    fstatfs_results: HashMap<RawFd, VecDeque<FsInfo>>,
    readdir_results: HashMap<String, Vec<DirEntryInfo>>,
    readlink_results: HashMap<String, String>,
}

/// Recording, fault-injecting implementation of [`SystemCalls`].
#[derive(Default)]
pub struct Recorder {
    state: RefCell<State>,
}

impl Recorder {
    pub fn new() -> Self {
        Recorder::default()
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    /// True when the given call string was recorded.
    pub fn called(&self, call: &str) -> bool {
        self.state.borrow().calls.iter().any(|c| c == call)
    }

    /// Descriptors that were opened and never closed.
    pub fn open_fds(&self) -> Vec<RawFd> {
        self.state.borrow().open_fds.keys().copied().collect()
    }

    /// Panic if any descriptor is still open; call at the end of a test.
    pub fn check_no_stray_descriptors(&self) {
        let state = self.state.borrow();
        assert!(
            state.open_fds.is_empty(),
            "stray file descriptors: {:?}",
            state.open_fds
        );
    }

    /// Make every occurrence of `call` fail with `errno`.
    pub fn insert_fault(&self, call: &str, errno: Errno) {
        self.state
            .borrow_mut()
            .faults
            .insert(call.to_string(), Fault::Always(errno));
    }

    /// Make the next occurrences of `call` fail with the given errnos,
    /// in order, succeeding once the sequence is exhausted.
    pub fn insert_fault_seq(&self, call: &str, errnos: &[Errno]) {
        self.state.borrow_mut().faults.insert(
            call.to_string(),
            Fault::Sequence(errnos.iter().copied().collect()),
        );
    }

    pub fn insert_lstat_result(&self, path: &str, info: FileInfo) {
        self.state
            .borrow_mut()
            .lstat_results
            .insert(path.to_string(), info);
    }

    pub fn insert_fstatat_result(&self, dirfd: RawFd, name: &str, info: FileInfo) {
        self.state
            .borrow_mut()
            .fstatat_results
            .insert(format!("{dirfd} {name}"), info);
    }

    pub fn insert_fstat_result(&self, fd: RawFd, info: FileInfo) {
        self.state.borrow_mut().fstat_results.insert(fd, info);
    }

    /// Queue a statfs result for `fd`; earlier results are consumed
    /// first and the last one repeats.
    pub fn insert_fstatfs_result(&self, fd: RawFd, info: FsInfo) {
        self.state
            .borrow_mut()
            .fstatfs_results
            .entry(fd)
            .or_default()
            .push_back(info);
    }

    pub fn insert_readdir_result(&self, path: &str, entries: Vec<DirEntryInfo>) {
        self.state
            .borrow_mut()
            .readdir_results
            .insert(path.to_string(), entries);
    }

    pub fn insert_readlink_result(&self, path: &str, target: &str) {
        self.state
            .borrow_mut()
            .readlink_results
            .insert(path.to_string(), target.to_string());
    }

    fn record(&self, call: String) -> OsResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(call.clone());
        match state.faults.get_mut(&call) {
            Some(Fault::Always(errno)) => Err(*errno),
            Some(Fault::Sequence(seq)) => match seq.pop_front() {
                Some(errno) => Err(errno),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn allocate_fd(&self, label: String) -> RawFd {
        let mut state = self.state.borrow_mut();
        let mut fd = 3;
        while state.open_fds.contains_key(&fd) {
            fd += 1;
        }
        state.open_fds.insert(fd, label);
        fd
    }
}

impl SystemCalls for Recorder {
    fn open(&self, path: &str, flags: i32, mode: u32) -> OsResult<RawFd> {
        self.record(format!(
            "open {path:?} {} {}",
            open_flags_repr(flags),
            mode_repr(mode)
        ))?;
        Ok(self.allocate_fd(path.to_string()))
    }

    fn openat(&self, dirfd: RawFd, name: &str, flags: i32, mode: u32) -> OsResult<RawFd> {
        self.record(format!(
            "openat {dirfd} {name:?} {} {}",
            open_flags_repr(flags),
            mode_repr(mode)
        ))?;
        let label = {
            let state = self.state.borrow();
            let base = state.open_fds.get(&dirfd).cloned().unwrap_or_default();
            if base.ends_with('/') {
                format!("{base}{name}")
            } else {
                format!("{base}/{name}")
            }
        };
        Ok(self.allocate_fd(label))
    }

    fn close(&self, fd: RawFd) -> OsResult<()> {
        self.record(format!("close {fd}"))?;
        if self.state.borrow_mut().open_fds.remove(&fd).is_none() {
            return Err(Errno::EBADF);
        }
        Ok(())
    }

    fn mkdirat(&self, dirfd: RawFd, name: &str, mode: u32) -> OsResult<()> {
        self.record(format!("mkdirat {dirfd} {name:?} {}", mode_repr(mode)))
    }

    fn fchown(&self, fd: RawFd, uid: u32, gid: u32) -> OsResult<()> {
        self.record(format!("fchown {fd} {uid} {gid}"))
    }

    fn fstatat(&self, dirfd: RawFd, name: &str) -> OsResult<FileInfo> {
        self.record(format!("fstatat {dirfd} {name:?}"))?;
        let state = self.state.borrow();
        state
            .fstatat_results
            .get(&format!("{dirfd} {name}"))
            .copied()
            .ok_or(Errno::ENOENT)
    }

    fn symlinkat(&self, target: &str, dirfd: RawFd, name: &str) -> OsResult<()> {
        self.record(format!("symlinkat {target:?} {dirfd} {name:?}"))
    }

    fn readlinkat(&self, dirfd: RawFd, name: &str) -> OsResult<String> {
        self.record(format!("readlinkat {dirfd} {name:?}"))?;
        let state = self.state.borrow();
        state
            .readlink_results
            .get(&format!("{dirfd} {name}"))
            .cloned()
            .ok_or(Errno::EINVAL)
    }

    fn fstat(&self, fd: RawFd) -> OsResult<FileInfo> {
        self.record(format!("fstat {fd}"))?;
        let state = self.state.borrow();
        Ok(state
            .fstat_results
            .get(&fd)
            .copied()
            .unwrap_or(FileInfo::dir(0o755)))
    }

    fn fstatfs(&self, fd: RawFd) -> OsResult<FsInfo> {
        self.record(format!("fstatfs {fd}"))?;
        let mut state = self.state.borrow_mut();
        match state.fstatfs_results.get_mut(&fd) {
            Some(queue) if queue.len() > 1 => Ok(queue.pop_front().unwrap()),
            Some(queue) => Ok(*queue.front().unwrap()),
            None => Ok(FsInfo::default()),
        }
    }

    fn lstat(&self, path: &str) -> OsResult<FileInfo> {
        self.record(format!("lstat {path:?}"))?;
        let state = self.state.borrow();
        state.lstat_results.get(path).copied().ok_or(Errno::ENOENT)
    }

    fn readlink(&self, path: &str) -> OsResult<String> {
        self.record(format!("readlink {path:?}"))?;
        let state = self.state.borrow();
        state
            .readlink_results
            .get(path)
            .cloned()
            .ok_or(Errno::EINVAL)
    }

    fn readdir(&self, path: &str) -> OsResult<Vec<DirEntryInfo>> {
        self.record(format!("readdir {path:?}"))?;
        let state = self.state.borrow();
        Ok(state.readdir_results.get(path).cloned().unwrap_or_default())
    }

    fn remove(&self, path: &str) -> OsResult<()> {
        self.record(format!("remove {path:?}"))
    }

    fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        flags: MsFlags,
        data: &str,
    ) -> OsResult<()> {
        self.record(format!(
            "mount {source:?} {target:?} {fs_type:?} {} {data:?}",
            mount_flags_repr(flags)
        ))
    }

    fn unmount(&self, target: &str, flags: MntFlags) -> OsResult<()> {
        self.record(format!("unmount {target:?} {}", unmount_flags_repr(flags)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_and_allocates_fds() {
        let sys = Recorder::new();
        let fd = sys.open("/", 0, 0).unwrap();
        assert_eq!(fd, 3);
        let fd2 = sys.openat(fd, "etc", 0, 0).unwrap();
        assert_eq!(fd2, 4);
        sys.close(fd).unwrap();
        let fd3 = sys.open("/", 0, 0).unwrap();
        assert_eq!(fd3, 3);
        assert_eq!(sys.open_fds(), vec![3, 4]);
    }

    #[test]
    fn test_fault_injection() {
        let sys = Recorder::new();
        sys.insert_fault(r#"mkdirat 3 "etc" 0o755"#, Errno::EROFS);
        assert_eq!(sys.mkdirat(3, "etc", 0o755), Err(Errno::EROFS));
        assert_eq!(sys.mkdirat(3, "etc", 0o755), Err(Errno::EROFS));
    }

    #[test]
    fn test_fault_sequence_then_success() {
        let sys = Recorder::new();
        sys.insert_fault_seq(r#"mkdirat 3 "etc" 0o755"#, &[Errno::EROFS]);
        assert_eq!(sys.mkdirat(3, "etc", 0o755), Err(Errno::EROFS));
        assert_eq!(sys.mkdirat(3, "etc", 0o755), Ok(()));
    }

    #[test]
    fn test_result_injection() {
        let sys = Recorder::new();
        assert_eq!(sys.lstat("/x"), Err(Errno::ENOENT));
        sys.insert_lstat_result("/x", FileInfo::dir(0o700));
        assert_eq!(sys.lstat("/x"), Ok(FileInfo::dir(0o700)));
    }
}
