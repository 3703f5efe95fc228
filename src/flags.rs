//! Mount option translation
//!
//! Kernel-recognized option tokens map to `MsFlags` bits; everything
//! else is passed to the kernel as the opaque data string, preserving
//! token order. Engine-private `x-snapd.*` tokens are stripped without
//! error so that newer profiles keep working with older engines.

use nix::mount::MsFlags;

/// Translate mount options into kernel flags and the opaque data list.
pub fn mount_opts_to_flags(options: &[String]) -> (MsFlags, Vec<String>) {
    let mut flags = MsFlags::empty();
    let mut unparsed = Vec::new();
    for opt in options {
        match opt.as_str() {
            // No flag exists for rw or defaults; they are the absence of ro.
            "rw" | "defaults" => {}
            "ro" => flags |= MsFlags::MS_RDONLY,
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "remount" => flags |= MsFlags::MS_REMOUNT,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "dirsync" => flags |= MsFlags::MS_DIRSYNC,
            "mand" => flags |= MsFlags::MS_MANDLOCK,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "strictatime" => flags |= MsFlags::MS_STRICTATIME,
            "lazytime" => flags |= MsFlags::MS_LAZYTIME,
            "silent" => flags |= MsFlags::MS_SILENT,
            "private" => flags |= MsFlags::MS_PRIVATE,
            "rprivate" => flags |= MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            "shared" => flags |= MsFlags::MS_SHARED,
            "rshared" => flags |= MsFlags::MS_SHARED | MsFlags::MS_REC,
            "slave" => flags |= MsFlags::MS_SLAVE,
            "rslave" => flags |= MsFlags::MS_SLAVE | MsFlags::MS_REC,
            "unbindable" => flags |= MsFlags::MS_UNBINDABLE,
            "runbindable" => flags |= MsFlags::MS_UNBINDABLE | MsFlags::MS_REC,
            other => {
                if !other.starts_with("x-snapd.") {
                    unparsed.push(other.to_string());
                }
            }
        }
    }
    (flags, unparsed)
}
