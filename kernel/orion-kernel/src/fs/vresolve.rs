//! Path resolution.
//!
//! `vresolve` turns a path into a ventry reference. Absolute paths first
//! consult the path cache; on a miss the resolver walks component by
//! component from the root (or `at` for relative paths), consulting each
//! directory's cached children before falling back to the filesystem's
//! `lookup` op. Mount points need no special casing — the mount swapped
//! the ventry's vnode for the mounted root, so descending just works.
//! Symlinks are followed by recursing on their target (depth-limited),
//! except on a final component with [`VrFlags::NOFOLLOW`].

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use orion_syscall::Errno;

use super::path;
use super::vcache;
use super::ventry::Ventry;
use super::vnode::VnodeType;
use super::MAX_LINK_DEPTH;

bitflags! {
    /// Resolution flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VrFlags: u32 {
        /// Return the parent when the last component is missing.
        const PARENT = 1 << 0;
        /// Require the last component to be missing (create paths).
        const EXCLUSV = 1 << 1;
        /// The final entry must be a directory.
        const DIR = 1 << 2;
        /// The final entry must be a block device.
        const BLK = 1 << 3;
        /// The final entry must be a symlink (implies no follow).
        const LNK = 1 << 4;
        /// Do not follow a symlink in the final component.
        const NOFOLLOW = 1 << 5;
        /// Historical: the caller re-locks as needed (resolution always
        /// returns unlocked references).
        const UNLOCKED = 1 << 6;
    }
}

/// A successful resolution.
pub enum Resolved {
    /// The path resolved fully.
    Found(Arc<Ventry>),
    /// Only the parent exists (`PARENT`/`EXCLUSV` requests): the final
    /// component `name` is missing from `dir`.
    Parent {
        /// The existing parent directory.
        dir: Arc<Ventry>,
        /// The missing final component.
        name: String,
    },
}

/// Resolves `path` from `at` (relative) or from `at`'s root ancestor
/// (absolute).
pub fn vresolve(at: &Arc<Ventry>, path: &str, flags: VrFlags) -> Result<Resolved, Errno> {
    path::validate(path)?;
    resolve_depth(at, path, flags, 0)
}

/// The root ancestor of a ventry.
fn root_of(at: &Arc<Ventry>) -> Arc<Ventry> {
    let mut cur = at.clone();
    while let Some(parent) = cur.parent() {
        cur = parent;
    }
    cur
}

fn resolve_depth(
    at: &Arc<Ventry>,
    path: &str,
    flags: VrFlags,
    depth: u32,
) -> Result<Resolved, Errno> {
    if depth > MAX_LINK_DEPTH {
        return Err(Errno::ELOOP);
    }

    let absolute = path::is_absolute(path);
    let start = if absolute { root_of(at) } else { at.clone() };

    // Path-cache fast path for plain absolute lookups rooted in the
    // global namespace.
    let cacheable = absolute
        && !flags.intersects(VrFlags::PARENT | VrFlags::EXCLUSV)
        && super::vfs::root_ventry().is_some_and(|r| Arc::ptr_eq(&r, &start));
    if cacheable && let Some(ve) = vcache::lookup(path) {
        return finalize(&start, ve, flags, depth);
    }

    let comps: Vec<&str> = path::components(path).collect();
    let mut cur = start.clone();

    for (i, comp) in comps.iter().enumerate() {
        let last = i == comps.len() - 1;

        if *comp == ".." {
            if let Some(parent) = cur.parent() {
                cur = parent;
            }
            continue;
        }

        let next = match walk_child(&cur, comp) {
            Ok(next) => next,
            Err(Errno::ENOENT)
                if last && flags.intersects(VrFlags::PARENT | VrFlags::EXCLUSV) =>
            {
                return Ok(Resolved::Parent { dir: cur, name: String::from(*comp) });
            }
            Err(e) => return Err(e),
        };

        if next.vtype() == VnodeType::Lnk && !last {
            // Mid-path symlink: splice the target in front of the rest.
            let target = next.vnode()?.readlink()?;
            let rest = comps[i + 1..].join("/");
            let spliced = if rest.is_empty() { target } else { path::join(&target, &rest) };
            let base = if path::is_absolute(&spliced) { root_of(&cur) } else { cur };
            return resolve_depth(&base, &spliced, flags, depth + 1);
        }

        cur = next;
    }

    finalize(&start, cur, flags, depth)
}

/// Applies the final-component rules: exclusivity, symlink follow, and
/// type constraints. Inserts cache entries for global absolute hits.
fn finalize(
    start: &Arc<Ventry>,
    ve: Arc<Ventry>,
    flags: VrFlags,
    depth: u32,
) -> Result<Resolved, Errno> {
    if flags.contains(VrFlags::EXCLUSV) {
        return Err(Errno::EEXIST);
    }

    if ve.vtype() == VnodeType::Lnk && !flags.contains(VrFlags::LNK) {
        if flags.contains(VrFlags::NOFOLLOW) {
            return Err(Errno::ELOOP);
        }
        let target = ve.vnode()?.readlink()?;
        let base = match ve.parent() {
            Some(parent) if !path::is_absolute(&target) => parent,
            _ => root_of(start),
        };
        return resolve_depth(&base, &target, flags, depth + 1);
    }

    if flags.contains(VrFlags::DIR) && ve.vtype() != VnodeType::Dir {
        return Err(Errno::ENOTDIR);
    }
    if flags.contains(VrFlags::BLK) && ve.vtype() != VnodeType::Blk {
        return Err(Errno::ENOTBLK);
    }
    if flags.contains(VrFlags::LNK) && ve.vtype() != VnodeType::Lnk {
        return Err(Errno::EINVAL);
    }

    // Populate the path cache when the walk started at the global root.
    if super::vfs::root_ventry().is_some_and(|r| Arc::ptr_eq(&r, start)) {
        vcache::insert(&ve.abs_path(), &ve);
    }

    Ok(Resolved::Found(ve))
}

/// One step of the walk: cached child or the filesystem `lookup` op.
fn walk_child(dir: &Arc<Ventry>, name: &str) -> Result<Arc<Ventry>, Errno> {
    if !dir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    if let Some(child) = dir.find_child(name)
        && child.flags().contains(super::VentryFlags::LINKED)
    {
        return Ok(child);
    }

    let dvn = dir.vnode()?;
    let vn = dvn.lookup(name)?;
    vn.load()?;
    let child = Ventry::alloc_linked(name, &vn);
    dir.add_child(&child);
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::vfs::tests::fresh_test_root;

    /// Builds `/etc/target`, `/etc/link -> /etc/target`, `/dir/sub`.
    fn build_tree(root: &Arc<Ventry>) {
        let root_vn = root.vnode().unwrap();
        let etc = root_vn.mkdir("etc", 0o755).unwrap();
        etc.create("target", 0o644).unwrap();
        etc.symlink("link", "/etc/target").unwrap();
        etc.symlink("loop", "/etc/loop").unwrap();
        etc.symlink("rel", "target").unwrap();
        let dir = root_vn.mkdir("dir", 0o755).unwrap();
        dir.mkdir("sub", 0o755).unwrap();
    }

    fn found(r: Result<Resolved, Errno>) -> Arc<Ventry> {
        match r.expect("resolved") {
            Resolved::Found(ve) => ve,
            Resolved::Parent { .. } => panic!("expected Found"),
        }
    }

    #[test]
    fn plain_walk() {
        let (_vfs, root) = fresh_test_root();
        build_tree(&root);
        let ve = found(vresolve(&root, "/etc/target", VrFlags::empty()));
        assert_eq!(ve.name(), "target");
        assert_eq!(ve.abs_path(), "/etc/target");
    }

    #[test]
    fn resolution_is_idempotent_under_dot() {
        let (_vfs, root) = fresh_test_root();
        build_tree(&root);
        let a = found(vresolve(&root, "/dir/sub", VrFlags::empty()));
        let b = found(vresolve(&root, "/dir/sub/.", VrFlags::empty()));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn dotdot_walks_up() {
        let (_vfs, root) = fresh_test_root();
        build_tree(&root);
        let ve = found(vresolve(&root, "/dir/sub/../../etc/target", VrFlags::empty()));
        assert_eq!(ve.abs_path(), "/etc/target");
        // `..` at the root stays at the root.
        let ve = found(vresolve(&root, "/../etc/target", VrFlags::empty()));
        assert_eq!(ve.abs_path(), "/etc/target");
    }

    #[test]
    fn missing_is_enoent() {
        let (_vfs, root) = fresh_test_root();
        build_tree(&root);
        assert_eq!(
            vresolve(&root, "/etc/absent", VrFlags::empty()).err(),
            Some(Errno::ENOENT)
        );
        assert_eq!(
            vresolve(&root, "/absent/deep", VrFlags::empty()).err(),
            Some(Errno::ENOENT)
        );
    }

    #[test]
    fn nondir_component_is_enotdir() {
        let (_vfs, root) = fresh_test_root();
        build_tree(&root);
        assert_eq!(
            vresolve(&root, "/etc/target/x", VrFlags::empty()).err(),
            Some(Errno::ENOTDIR)
        );
    }

    #[test]
    fn parent_flag_returns_parent_on_missing_last() {
        let (_vfs, root) = fresh_test_root();
        build_tree(&root);
        match vresolve(&root, "/etc/newfile", VrFlags::PARENT).expect("parent") {
            Resolved::Parent { dir, name } => {
                assert_eq!(dir.name(), "etc");
                assert_eq!(name, "newfile");
            }
            Resolved::Found(_) => panic!("expected Parent"),
        }
        // An existing last component still resolves normally.
        assert!(matches!(
            vresolve(&root, "/etc/target", VrFlags::PARENT).unwrap(),
            Resolved::Found(_)
        ));
    }

    #[test]
    fn exclusive_requires_missing_last() {
        let (_vfs, root) = fresh_test_root();
        build_tree(&root);
        assert!(matches!(
            vresolve(&root, "/etc/newfile", VrFlags::EXCLUSV).unwrap(),
            Resolved::Parent { .. }
        ));
        assert_eq!(
            vresolve(&root, "/etc/target", VrFlags::EXCLUSV).err(),
            Some(Errno::EEXIST)
        );
    }

    #[test]
    fn symlink_follow_and_nofollow() {
        let (_vfs, root) = fresh_test_root();
        build_tree(&root);

        // Following lands on the target.
        let ve = found(vresolve(&root, "/etc/link", VrFlags::empty()));
        assert_eq!(ve.abs_path(), "/etc/target");

        // A relative target resolves from the link's directory.
        let ve = found(vresolve(&root, "/etc/rel", VrFlags::empty()));
        assert_eq!(ve.abs_path(), "/etc/target");

        // NOFOLLOW on the final component reports ELOOP.
        assert_eq!(
            vresolve(&root, "/etc/link", VrFlags::NOFOLLOW).err(),
            Some(Errno::ELOOP)
        );

        // LNK returns the link object itself (readlink).
        let ve = found(vresolve(&root, "/etc/link", VrFlags::LNK | VrFlags::NOFOLLOW));
        assert_eq!(ve.vtype(), VnodeType::Lnk);
    }

    #[test]
    fn symlink_loop_is_eloop() {
        let (_vfs, root) = fresh_test_root();
        build_tree(&root);
        assert_eq!(
            vresolve(&root, "/etc/loop", VrFlags::empty()).err(),
            Some(Errno::ELOOP)
        );
    }

    #[test]
    fn type_constraints() {
        let (_vfs, root) = fresh_test_root();
        build_tree(&root);
        assert_eq!(
            vresolve(&root, "/etc/target", VrFlags::DIR).err(),
            Some(Errno::ENOTDIR)
        );
        assert!(matches!(
            vresolve(&root, "/dir", VrFlags::DIR).unwrap(),
            Resolved::Found(_)
        ));
        assert_eq!(
            vresolve(&root, "/etc/target", VrFlags::BLK).err(),
            Some(Errno::ENOTBLK)
        );
    }

    #[test]
    fn mid_path_symlink_to_directory() {
        let (_vfs, root) = fresh_test_root();
        build_tree(&root);
        let root_vn = root.vnode().unwrap();
        root_vn.symlink("d", "/dir").unwrap();
        let ve = found(vresolve(&root, "/d/sub", VrFlags::empty()));
        assert_eq!(ve.abs_path(), "/dir/sub");
    }

    #[test]
    fn mount_descends_through_shadow() {
        let (_vfs, root) = fresh_test_root();
        let root_vn = root.vnode().unwrap();
        root_vn.mkdir("mnt", 0o755).unwrap();

        let mnt = found(vresolve(&root, "/mnt", VrFlags::DIR));
        crate::fs::vfs::mount_at(&mnt, crate::fs::testfs::fs_type()).expect("mount");

        // Create a file inside the mounted filesystem.
        let mounted_root_vn = mnt.vnode().unwrap();
        mounted_root_vn.create("inside", 0o644).unwrap();

        let ve = found(vresolve(&root, "/mnt/inside", VrFlags::empty()));
        assert_eq!(ve.name(), "inside");
        // The entry belongs to the mounted filesystem, not the host.
        assert_eq!(
            ve.vnode().unwrap().vfs().unwrap().id,
            mounted_root_vn.vfs().unwrap().id
        );

        // After unmount the same path is gone.
        crate::fs::vfs::unmount_at(&mnt).expect("unmount");
        assert_eq!(
            vresolve(&root, "/mnt/inside", VrFlags::empty()).err(),
            Some(Errno::ENOENT)
        );
    }
}
