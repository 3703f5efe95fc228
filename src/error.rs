use nix::errno::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A write failed with EROFS; `0` is the directory where a tmpfs
    /// mimic must be constructed before retrying.
    #[error("cannot operate on read-only filesystem at {0}")]
    ReadOnlyFs(String),

    /// A write would land on the host filesystem outside the sandbox's
    /// writable zone.
    #[error("cannot write to {desired} because it would affect the host in {violated}")]
    Trespassing { violated: String, desired: String },

    /// Undo failed after a primary failure; the mount namespace is in an
    /// inconsistent state and no further writes may be attempted.
    #[error("cannot undo change after failure: {rollback} (original error: {primary})")]
    Fatal {
        primary: Box<Error>,
        rollback: Box<Error>,
    },

    /// A benign unmount target was absent.
    #[error("cannot unmount absent mount point")]
    IgnoredMissingMount,

    #[error("cannot operate on relative path {0:?}")]
    RelativePath(String),

    #[error("cannot iterate over unclean path {0:?}")]
    UncleanPath(String),

    #[error("cannot create symlink with empty target")]
    EmptySymlinkTarget,

    #[error("cannot use {0:?} for mounting, not a directory")]
    NotADirectory(String),

    #[error("cannot use {0:?} for mounting, not a regular file")]
    NotAFile(String),

    #[error("cannot create symlink in {0:?}, existing file in the way")]
    FileInTheWay(String),

    #[error("cannot open path {0:?}, it is a symbolic link")]
    SymlinkInPath(String),

    #[error("cannot create writable mimic over /")]
    MimicOverRoot,

    #[error("cannot create file or symlink at /")]
    RootPath,

    #[error("cannot parse mount profile: {0}")]
    ParseProfile(String),

    /// Any other failed system call, wrapped with a short context line.
    #[error("{context}: {errno}")]
    Syscall { context: String, errno: Errno },
}

impl Error {
    pub(crate) fn syscall(context: impl Into<String>, errno: Errno) -> Self {
        Error::Syscall {
            context: context.into(),
            errno,
        }
    }

    /// Errno of the underlying system call, if this error wraps one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Syscall { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}
