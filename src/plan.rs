//! Change planning
//!
//! Diff a current profile against a desired one, producing the ordered
//! change list whose execution transforms the namespace. Unmounts come
//! out in reverse current order so leaves go before roots; mounts come
//! out in desired order so roots go before leaves; keeps interleave in
//! the reverse current order.

use std::collections::HashSet;

use crate::change::Change;
use crate::entry::{EntryKind, MountEntry};
use crate::pathiter::{clean_path, path_has_prefix, path_strictly_under};
use crate::profile::MountProfile;

/// Compute the changes needed to transform `current` into `desired`.
pub fn needed_changes(current: &MountProfile, desired: &MountProfile) -> Vec<Change> {
    let current: Vec<MountEntry> = current.entries.iter().map(normalize).collect();
    let desired: Vec<MountEntry> = desired.entries.iter().map(normalize).collect();

    let desired_dirs: HashSet<&str> = desired.iter().map(|e| e.dir.as_str()).collect();

    // An entry can be reused when the desired profile still wants the
    // same mount; synthetic scaffolding is reused as long as the entry
    // it was built for still has a desired mount point.
    let mut reusable: Vec<bool> = current
        .iter()
        .map(|entry| {
            if entry.is_synthetic() {
                desired_dirs.contains(entry.needed_by())
            } else {
                desired.iter().any(|d| d.same_mount_as(entry))
            }
        })
        .collect();

    // Entries that bind from, or live inside, something that goes away
    // must be refreshed as well, recursively. This is what remounts a
    // layout when the content connection backing its source changes.
    loop {
        let invalidated: Vec<&str> = current
            .iter()
            .enumerate()
            .filter(|(i, _)| !reusable[*i])
            .map(|(_, e)| e.dir.as_str())
            .collect();
        let mut changed = false;
        for (i, entry) in current.iter().enumerate() {
            if !reusable[i] {
                continue;
            }
            let affected = invalidated
                .iter()
                .any(|d| path_has_prefix(&entry.name, d) || path_strictly_under(&entry.dir, d));
            if affected {
                reusable[i] = false;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Desired entries already covered by a kept current entry.
    let mut satisfied = vec![false; desired.len()];
    for (i, entry) in current.iter().enumerate() {
        if reusable[i] && !entry.is_synthetic() {
            if let Some(j) = desired.iter().position(|d| d.same_mount_as(entry)) {
                satisfied[j] = true;
            }
        }
    }

    let mut changes = Vec::new();
    for (i, entry) in current.iter().enumerate().rev() {
        if reusable[i] {
            changes.push(Change::keep(entry.clone()));
        } else {
            changes.push(Change::unmount(unmount_entry(entry)));
        }
    }
    for (j, entry) in desired.iter().enumerate() {
        if !satisfied[j] && !entry.is_synthetic() {
            changes.push(Change::mount(entry.clone()));
        }
    }
    changes
}

fn normalize(entry: &MountEntry) -> MountEntry {
    let mut entry = entry.clone();
    entry.dir = clean_path(&entry.dir);
    entry
}

/// Bind mounts and tmpfs may host nested mounts; unmount them detached
/// so the kernel cleans up the whole subtree. Symlink entries are
/// removed, not unmounted, and never need it.
fn unmount_entry(entry: &MountEntry) -> MountEntry {
    if entry.kind() == EntryKind::Symlink {
        return entry.clone();
    }
    if entry.is_bind() || entry.fs_type == "tmpfs" {
        entry.with_detach()
    } else {
        entry.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Action;

    // A content snap feeding a layout: the layout bind-mounts the
    // attached content onward, supported by mimic scaffolding over
    // /usr/share/secureboot.
    const CURRENT_CONNECTED: &str = "\
tmpfs / tmpfs x-snapd.origin=rootfs 0 0
/snap/test-snapd-content/x1 /snap/test-snapd-content-layout/x2/attached-content none bind,ro 0 0
tmpfs /usr/share/secureboot tmpfs x-snapd.synthetic,x-snapd.needed-by=/usr/share/secureboot/potato,mode=0755,uid=0,gid=0 0 0
/usr/share/secureboot/updates /usr/share/secureboot/updates none rbind,x-snapd.synthetic,x-snapd.needed-by=/usr/share/secureboot/potato,x-snapd.detach 0 0
/snap/test-snapd-content-layout/x2/attached-content /usr/share/secureboot/potato none rbind,rw,x-snapd.origin=layout 0 0
";

    const DESIRED_CONNECTED: &str = "\
tmpfs / tmpfs x-snapd.origin=rootfs 0 0
/snap/test-snapd-content/x1 /snap/test-snapd-content-layout/x2/attached-content none bind,ro 0 0
/snap/test-snapd-content-layout/x2/attached-content /usr/share/secureboot/potato none rbind,rw,x-snapd.origin=layout 0 0
";

    const DESIRED_DISCONNECTED: &str = "\
tmpfs / tmpfs x-snapd.origin=rootfs 0 0
/snap/test-snapd-content-layout/x2/attached-content /usr/share/secureboot/potato none rbind,rw,x-snapd.origin=layout 0 0
";

    // The current profile after the disconnect reconciliation, in
    // execution order.
    const CURRENT_DISCONNECTED: &str = "\
/usr/share/secureboot/updates /usr/share/secureboot/updates none rbind,x-snapd.synthetic,x-snapd.needed-by=/usr/share/secureboot/potato,x-snapd.detach 0 0
tmpfs /usr/share/secureboot tmpfs x-snapd.synthetic,x-snapd.needed-by=/usr/share/secureboot/potato,mode=0755,uid=0,gid=0 0 0
tmpfs / tmpfs x-snapd.origin=rootfs 0 0
/snap/test-snapd-content-layout/x2/attached-content /usr/share/secureboot/potato none rbind,rw,x-snapd.origin=layout 0 0
";

    const DESIRED_RECONNECTED: &str = "\
tmpfs / tmpfs x-snapd.origin=rootfs 0 0
/snap/test-snapd-content/x1 /snap/test-snapd-content-layout/x2/attached-content none bind,ro 0 0
/snap/test-snapd-content-layout/x2/attached-content /usr/share/secureboot/potato none rbind,rw,x-snapd.origin=layout 0 0
";

    fn profile(text: &str) -> MountProfile {
        MountProfile::parse(text).unwrap()
    }

    #[test]
    fn test_identity_plans_only_keeps_in_reverse_order() {
        let p = profile(CURRENT_CONNECTED);
        let changes = needed_changes(&p, &p);
        assert_eq!(changes.len(), p.entries.len());
        for (change, entry) in changes.iter().zip(p.entries.iter().rev()) {
            assert_eq!(change.action, Action::Keep);
            assert_eq!(&change.entry, entry);
        }
    }

    #[test]
    fn test_content_layout_initially_connected_no_changes() {
        let current = profile(CURRENT_CONNECTED);
        let desired = profile(DESIRED_CONNECTED);
        let changes = needed_changes(&current, &desired);
        assert_eq!(
            changes,
            vec![
                Change::keep(current.entries[4].clone()),
                Change::keep(current.entries[3].clone()),
                Change::keep(current.entries[2].clone()),
                Change::keep(current.entries[1].clone()),
                Change::keep(current.entries[0].clone()),
            ]
        );
    }

    #[test]
    fn test_content_layout_now_disconnected() {
        let current = profile(CURRENT_CONNECTED);
        let desired = profile(DESIRED_DISCONNECTED);
        let changes = needed_changes(&current, &desired);
        // Dropping the content connection invalidates the layout whose
        // source it backed: the layout is detached and mounted afresh
        // while the mimic scaffolding survives.
        assert_eq!(
            changes,
            vec![
                Change::unmount(current.entries[4].with_detach()),
                Change::keep(current.entries[3].clone()),
                Change::keep(current.entries[2].clone()),
                Change::unmount(current.entries[1].with_detach()),
                Change::keep(current.entries[0].clone()),
                Change::mount(current.entries[4].clone()),
            ]
        );
    }

    #[test]
    fn test_content_layout_then_reconnected() {
        let current = profile(CURRENT_DISCONNECTED);
        let desired = profile(DESIRED_RECONNECTED);
        let changes = needed_changes(&current, &desired);
        assert_eq!(
            changes,
            vec![
                Change::keep(current.entries[3].clone()),
                Change::keep(current.entries[2].clone()),
                Change::keep(current.entries[1].clone()),
                Change::keep(current.entries[0].clone()),
                Change::mount(desired.entries[1].clone()),
            ]
        );
        assert_eq!(
            changes[4].entry,
            MountEntry::new(
                "/snap/test-snapd-content/x1",
                "/snap/test-snapd-content-layout/x2/attached-content",
                "none",
                &["bind", "ro"],
            )
        );
    }

    #[test]
    fn test_option_order_is_insignificant() {
        let current = profile("/a /b none bind,ro 0 0\n");
        let desired = profile("/a /b none ro,bind 0 0\n");
        let changes = needed_changes(&current, &desired);
        assert_eq!(changes, vec![Change::keep(current.entries[0].clone())]);
    }

    #[test]
    fn test_changed_options_unmount_then_mount() {
        let current = profile("/a /b none bind,ro 0 0\n");
        let desired = profile("/a /b none bind,rw 0 0\n");
        let changes = needed_changes(&current, &desired);
        assert_eq!(
            changes,
            vec![
                Change::unmount(current.entries[0].with_detach()),
                Change::mount(desired.entries[0].clone()),
            ]
        );
    }

    #[test]
    fn test_synthetic_entries_follow_their_anchor() {
        let current = profile(
            "\
tmpfs /usr/share/secureboot tmpfs x-snapd.synthetic,x-snapd.needed-by=/usr/share/secureboot/potato,mode=0755,uid=0,gid=0 0 0
/snap/demo/1/data /usr/share/secureboot/potato none rbind,x-snapd.origin=layout 0 0
",
        );
        // Nothing desired any more: the anchor goes, the scaffolding goes.
        let desired = MountProfile::default();
        let changes = needed_changes(&current, &desired);
        assert_eq!(
            changes,
            vec![
                Change::unmount(current.entries[1].with_detach()),
                Change::unmount(current.entries[0].with_detach()),
            ]
        );
    }

    #[test]
    fn test_entries_under_removed_mount_are_refreshed() {
        let current = profile(
            "\
/snap/demo/1 /opt/demo none rbind 0 0
/snap/extra/2 /opt/demo/extra none bind 0 0
",
        );
        // /opt/demo goes away; the nested bind cannot be kept even
        // though it is still desired, so it is remounted.
        let desired = profile("/snap/extra/2 /opt/demo/extra none bind 0 0\n");
        let changes = needed_changes(&current, &desired);
        assert_eq!(
            changes,
            vec![
                Change::unmount(current.entries[1].with_detach()),
                Change::unmount(current.entries[0].with_detach()),
                Change::mount(desired.entries[0].clone()),
            ]
        );
    }

    #[test]
    fn test_unclean_dirs_are_normalized_before_planning() {
        let current = profile("/a /b/ none bind 0 0\n");
        let desired = profile("/a /b none bind 0 0\n");
        let changes = needed_changes(&current, &desired);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, Action::Keep);
        assert_eq!(changes[0].entry.dir, "/b");
    }

    #[test]
    fn test_symlink_entries_never_get_detach() {
        let current = profile(
            "none /etc/demo.conf none x-snapd.kind=symlink,x-snapd.symlink=/snap/demo/1/conf 0 0\n",
        );
        let desired = MountProfile::default();
        let changes = needed_changes(&current, &desired);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, Action::Unmount);
        assert!(!changes[0].entry.is_detached());
    }
}
