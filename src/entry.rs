//! Mount entry model
//!
//! A `MountEntry` is one fstab-style line. Engine-private metadata rides
//! in `x-snapd.*` pseudo-options which are stripped before any kernel
//! call.

use std::collections::BTreeSet;
use std::fmt;

/// Option designating the entry's provenance; `layout` and `overname`
/// entries are fatal on error.
pub const OPT_ORIGIN: &str = "x-snapd.origin=";
/// Option selecting the leaf file type created at the mount target.
pub const OPT_KIND: &str = "x-snapd.kind=";
/// Option carrying the target of a symlink-kind entry.
pub const OPT_SYMLINK: &str = "x-snapd.symlink=";
/// Option marking an entry produced by mimic construction.
pub const OPT_SYNTHETIC: &str = "x-snapd.synthetic";
/// Option back-referencing the entry that required a synthetic one.
pub const OPT_NEEDED_BY: &str = "x-snapd.needed-by=";
/// Option requesting detach semantics on unmount.
pub const OPT_DETACH: &str = "x-snapd.detach";

/// Leaf file type to create at a mount target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryKind {
    /// A directory, also used for plain bind mounts.
    #[default]
    Dir,
    File,
    Symlink,
}

/// A single fstab-style mount entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MountEntry {
    /// Mount source: a path, a pseudo-filesystem name or `none`.
    pub name: String,
    /// Mount target, an absolute canonical path.
    pub dir: String,
    /// Filesystem type (`tmpfs`, `none`, `squashfs`, ...).
    pub fs_type: String,
    /// Mount options, kernel flags and `x-snapd.*` metadata alike.
    pub options: Vec<String>,
    pub dump_frequency: u32,
    pub check_pass: u32,
}

impl MountEntry {
    pub fn new(name: &str, dir: &str, fs_type: &str, options: &[&str]) -> Self {
        MountEntry {
            name: name.to_string(),
            dir: dir.to_string(),
            fs_type: fs_type.to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
            dump_frequency: 0,
            check_pass: 0,
        }
    }

    /// True when `opt` is present verbatim.
    pub fn has_opt(&self, opt: &str) -> bool {
        self.options.iter().any(|o| o == opt)
    }

    /// Value of the first `prefix=<value>` option, if any.
    pub fn opt_val<'a>(&'a self, prefix: &str) -> Option<&'a str> {
        self.options
            .iter()
            .find_map(|o| o.strip_prefix(prefix))
    }

    /// Entry provenance: empty, `layout`, `overname` or `rootfs`.
    pub fn origin(&self) -> &str {
        self.opt_val(OPT_ORIGIN).unwrap_or("")
    }

    pub fn kind(&self) -> EntryKind {
        match self.opt_val(OPT_KIND) {
            Some("file") => EntryKind::File,
            Some("symlink") => EntryKind::Symlink,
            _ => EntryKind::Dir,
        }
    }

    /// Target of a symlink-kind entry.
    pub fn symlink_target(&self) -> &str {
        self.opt_val(OPT_SYMLINK).unwrap_or("")
    }

    /// True when the entry was produced by mimic construction.
    pub fn is_synthetic(&self) -> bool {
        self.has_opt(OPT_SYNTHETIC)
    }

    /// Directory of the entry that caused this synthetic entry.
    pub fn needed_by(&self) -> &str {
        self.opt_val(OPT_NEEDED_BY).unwrap_or("")
    }

    /// True when unmounting must use detach semantics.
    pub fn is_detached(&self) -> bool {
        self.has_opt(OPT_DETACH)
    }

    /// True for bind and recursive-bind mounts.
    pub fn is_bind(&self) -> bool {
        self.has_opt("bind") || self.has_opt("rbind")
    }

    /// Mode requested via `mode=` for created mount targets.
    pub fn mode(&self) -> u32 {
        self.opt_val("mode=")
            .and_then(|v| u32::from_str_radix(v, 8).ok())
            .unwrap_or(0o755)
    }

    /// Owner requested via `uid=` for created mount targets.
    pub fn uid(&self) -> u32 {
        self.opt_val("uid=")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Group requested via `gid=` for created mount targets.
    pub fn gid(&self) -> u32 {
        self.opt_val("gid=")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Options that matter for planner identity: everything except the
    /// engine-appended detach marker, as an unordered set.
    pub fn significant_options(&self) -> BTreeSet<&str> {
        self.options
            .iter()
            .map(|o| o.as_str())
            .filter(|o| *o != OPT_DETACH)
            .collect()
    }

    /// True when two entries request the same mount, ignoring option
    /// order and the detach marker.
    pub fn same_mount_as(&self, other: &MountEntry) -> bool {
        self.name == other.name
            && self.dir == other.dir
            && self.fs_type == other.fs_type
            && self.significant_options() == other.significant_options()
    }

    /// A copy of the entry with `x-snapd.detach` appended when absent.
    pub fn with_detach(&self) -> MountEntry {
        let mut entry = self.clone();
        if !entry.is_detached() {
            entry.options.push(OPT_DETACH.to_string());
        }
        entry
    }
}

impl fmt::Display for MountEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.name.is_empty() { "none" } else { &self.name };
        let fs_type = if self.fs_type.is_empty() {
            "none"
        } else {
            &self.fs_type
        };
        let options = if self.options.is_empty() {
            "defaults".to_string()
        } else {
            self.options.join(",")
        };
        write!(
            f,
            "{} {} {} {} {} {}",
            escape(name),
            escape(&self.dir),
            fs_type,
            options,
            self.dump_frequency,
            self.check_pass
        )
    }
}

/// Escape whitespace and backslashes the way fstab does.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push_str("\\040"),
            '\t' => out.push_str("\\011"),
            '\n' => out.push_str("\\012"),
            '\\' => out.push_str("\\134"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse of [`escape`]; unknown escapes are preserved literally.
pub fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        if c == '\\'
            && i + 4 <= bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            if let Ok(code) = u8::from_str_radix(&s[i + 1..i + 4], 8) {
                out.push(code as char);
                chars.next();
                chars.next();
                chars.next();
                continue;
            }
        }
        out.push(c);
    }
    out
}
