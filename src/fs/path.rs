//! Path handling and the access-mode check.

use crate::fs::FileMode;
use crate::sffs::FstEntry;

/// A usable non-root path: absolute, 2..=64 bytes, no trailing separator.
pub(crate) fn is_valid_non_root_path(path: &str) -> bool {
    path.len() > 1 && path.len() <= 64 && path.starts_with('/') && !path.ends_with('/')
}

/// Split a *valid non-root* path into its parent path and file name.
///
/// Example: `/shared2/sys/SYSCONF` => (`/shared2/sys`, `SYSCONF`).
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    let sep = path.rfind('/').unwrap_or(0);
    let parent = if sep == 0 { "/" } else { &path[..sep] };
    (parent, &path[sep + 1..])
}

/// Check an entry's access byte against the requested mode.
///
/// uid 0 is root and is always granted. Otherwise the owner, group or
/// other field applies, in that order, and every requested bit must be
/// present in the granted field.
pub(crate) fn has_permission(entry: &FstEntry, uid: u32, gid: u16, requested: FileMode) -> bool {
    if uid == 0 {
        return true;
    }

    let granted = if entry.uid == uid {
        entry.owner_mode()
    } else if entry.gid == gid {
        entry.group_mode()
    } else {
        entry.other_mode()
    };
    granted.contains(requested)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validity() {
        assert!(is_valid_non_root_path("/a"));
        assert!(is_valid_non_root_path("/shared2/sys/SYSCONF"));
        assert!(!is_valid_non_root_path("/"));
        assert!(!is_valid_non_root_path(""));
        assert!(!is_valid_non_root_path("a/b"));
        assert!(!is_valid_non_root_path("/a/"));
        // 64 bytes is the limit, 65 is out.
        let long = format!("/{}", "x".repeat(63));
        assert!(is_valid_non_root_path(&long));
        assert!(!is_valid_non_root_path(&format!("{long}x")));
    }

    #[test]
    fn split_path_examples() {
        assert_eq!(split_path("/a"), ("/", "a"));
        assert_eq!(split_path("/shared2/sys/SYSCONF"), ("/shared2/sys", "SYSCONF"));
    }

    #[test]
    fn permission_classes() {
        let mut entry = FstEntry::default();
        entry.mode = 1;
        entry.uid = 5;
        entry.gid = 3;
        entry.set_access_mode(
            FileMode::READ | FileMode::WRITE,
            FileMode::READ,
            FileMode::empty(),
        );

        // Root always passes.
        assert!(has_permission(&entry, 0, 0, FileMode::READ | FileMode::WRITE));
        // Owner gets the owner field.
        assert!(has_permission(&entry, 5, 9, FileMode::READ | FileMode::WRITE));
        // Group member gets the group field.
        assert!(has_permission(&entry, 6, 3, FileMode::READ));
        assert!(!has_permission(&entry, 6, 3, FileMode::WRITE));
        // Everyone else gets the other field.
        assert!(!has_permission(&entry, 6, 9, FileMode::READ));
        // An empty request always passes.
        assert!(has_permission(&entry, 6, 9, FileMode::empty()));
    }
}
