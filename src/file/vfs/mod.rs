/*
 * Copyright 2026 The Opal developers
 *
 * This file is part of Opal.
 *
 * Opal is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Opal is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Opal. If not, see <https://www.gnu.org/licenses/>.
 */

//! The virtual filesystem.
//!
//! The VFS aggregates every mounted filesystem into one tree. Lookups walk
//! paths segment by segment from the root mount's root node; a segment
//! landing on a node with a filesystem mounted over it is redirected into
//! the mounted root, so the walk keeps descending inside the overlay.

pub mod mountpoint;
pub mod node;

use crate::{
	errno,
	errno::EResult,
	file::{fs, path::PathBuf, perm::AccessProfile, FileType, Stat},
};
use alloc::sync::Arc;
use mountpoint::MountTable;
use node::Vnode;

/// Follows mounts: while a filesystem is mounted over the node, descend
/// into its root.
fn redirect(mut node: Arc<Vnode>) -> Arc<Vnode> {
	while let Some(mount) = node.mounted_here() {
		node = mount.root.clone();
	}
	node
}

/// Resolves `path` inside the given mount table, walking from the root.
///
/// The returned node holds a new reference. Fails with `ENOENT` on a
/// missing segment, `ENOTDIR` on a non-directory intermediate segment and
/// `EACCES` when `ap` lacks search permission on a traversed directory.
pub fn resolve_in(table: &MountTable, path: &PathBuf, ap: &AccessProfile) -> EResult<Arc<Vnode>> {
	let root = table.root_mount()?.root.clone();
	let mut cur = redirect(root);
	for comp in path.components() {
		if !cur.is_dir() {
			return Err(errno!(ENOTDIR));
		}
		if !ap.can_search(&cur.stat.lock()) {
			return Err(errno!(EACCES));
		}
		let next = cur.ops.lookup(&cur, comp)?;
		cur = redirect(next);
	}
	Ok(cur)
}

/// Resolves `path` against the system's mount table.
pub fn find_by_path(path: &PathBuf, ap: &AccessProfile) -> EResult<Arc<Vnode>> {
	resolve_in(&mountpoint::table().lock(), path, ap)
}

/// Resolves the parent directory of `path` inside the given table and
/// returns it with the final component.
fn resolve_parent_in<'p>(
	table: &MountTable,
	path: &'p PathBuf,
	ap: &AccessProfile,
) -> EResult<(Arc<Vnode>, &'p [u8])> {
	let name = path.file_name().ok_or_else(|| errno!(ENOENT))?;
	let parent_path = path.parent().ok_or_else(|| errno!(ENOENT))?;
	let parent = resolve_in(table, &parent_path, ap)?;
	if !parent.is_dir() {
		return Err(errno!(ENOTDIR));
	}
	Ok((parent, name))
}

/// Creates the node at `path`, delegating to the parent directory's
/// operations.
pub fn create_in(
	table: &MountTable,
	path: &PathBuf,
	ftype: FileType,
	ap: &AccessProfile,
) -> EResult<Arc<Vnode>> {
	let (parent, name) = resolve_parent_in(table, path, ap)?;
	if !ap.can_write(&parent.stat.lock()) {
		return Err(errno!(EACCES));
	}
	parent.ops.create(&parent, name, ftype)
}

/// Creates the node at `path` against the system's mount table.
pub fn create(path: &PathBuf, ftype: FileType, ap: &AccessProfile) -> EResult<Arc<Vnode>> {
	create_in(&mountpoint::table().lock(), path, ftype, ap)
}

/// Removes the node at `path`, delegating to the parent directory's
/// operations.
pub fn remove_in(table: &MountTable, path: &PathBuf, ap: &AccessProfile) -> EResult<()> {
	let (parent, name) = resolve_parent_in(table, path, ap)?;
	if !ap.can_write(&parent.stat.lock()) {
		return Err(errno!(EACCES));
	}
	parent.ops.remove(&parent, name)
}

/// Removes the node at `path` against the system's mount table.
pub fn remove(path: &PathBuf, ap: &AccessProfile) -> EResult<()> {
	remove_in(&mountpoint::table().lock(), path, ap)
}

/// Returns the status of the node at `path`.
pub fn stat(path: &PathBuf, ap: &AccessProfile) -> EResult<Stat> {
	let node = find_by_path(path, ap)?;
	let stat = node.stat.lock().clone();
	Ok(stat)
}

/// Mounts a filesystem of type `fs_type` over the node at `path`, backed by
/// the device `dev`.
pub fn mount_in(
	table: &mut MountTable,
	path: &PathBuf,
	fs_type: &str,
	dev: Option<Arc<crate::device::BlkDev>>,
	ap: &AccessProfile,
) -> EResult<()> {
	let fs = fs::get_type(fs_type)?.load(dev)?;
	let at = resolve_in(table, path, ap)?;
	table.mount(fs, at)?;
	Ok(())
}

/// Mounts a filesystem over the node at `path` in the system's mount
/// table.
pub fn mount(
	path: &PathBuf,
	fs_type: &str,
	dev: Option<Arc<crate::device::BlkDev>>,
	ap: &AccessProfile,
) -> EResult<()> {
	mount_in(&mut mountpoint::table().lock(), path, fs_type, dev, ap)
}

/// Installs the root filesystem in the system's mount table.
pub fn mount_root(fs_type: &str, dev: Option<Arc<crate::device::BlkDev>>) -> EResult<()> {
	let fs = fs::get_type(fs_type)?.load(dev)?;
	mountpoint::table().lock().mount_root(fs)?;
	Ok(())
}

/// Unmounts the filesystem mounted at `path`.
pub fn unmount_in(table: &mut MountTable, path: &PathBuf, ap: &AccessProfile) -> EResult<()> {
	let node = resolve_in(table, path, ap)?;
	table.unmount(&node)
}

/// Unmounts the filesystem mounted at `path` from the system's mount
/// table.
pub fn unmount(path: &PathBuf, ap: &AccessProfile) -> EResult<()> {
	unmount_in(&mut mountpoint::table().lock(), path, ap)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::file::fs::tmp::TmpFsType;
	use crate::file::fs::FilesystemType;

	const AP: AccessProfile = AccessProfile::KERNEL;

	fn path(s: &str) -> PathBuf {
		PathBuf::from_bytes(s.as_bytes()).unwrap()
	}

	/// Builds a table with a tmpfs root holding `/bin/busybox` and
	/// `/etc/passwd`.
	fn new_table() -> MountTable {
		let mut table = MountTable::new();
		let fs = TmpFsType.load(None).unwrap();
		table.mount_root(fs).unwrap();
		create_in(&table, &path("/bin"), FileType::Directory, &AP).unwrap();
		create_in(&table, &path("/bin/busybox"), FileType::Regular, &AP).unwrap();
		create_in(&table, &path("/etc"), FileType::Directory, &AP).unwrap();
		create_in(&table, &path("/etc/passwd"), FileType::Regular, &AP).unwrap();
		table
	}

	#[test]
	fn vfs_resolution() {
		let table = new_table();
		let node = resolve_in(&table, &path("/bin/busybox"), &AP).unwrap();
		assert_eq!(node.vtype, FileType::Regular);
		// Missing segment
		let Err(e) = resolve_in(&table, &path("/bin/sh"), &AP) else {
			panic!("missing entry resolved");
		};
		assert_eq!(e, errno!(ENOENT));
		// Non-directory intermediate segment
		let Err(e) = resolve_in(&table, &path("/etc/passwd/x"), &AP) else {
			panic!("walked through a regular file");
		};
		assert_eq!(e, errno!(ENOTDIR));
	}

	#[test]
	fn vfs_search_permission() {
		let table = new_table();
		let etc = resolve_in(&table, &path("/etc"), &AP).unwrap();
		etc.stat.lock().mode = 0o600;
		let user = AccessProfile { uid: 1000, gid: 1000 };
		let Err(e) = resolve_in(&table, &path("/etc/passwd"), &user) else {
			panic!("searched a directory without permission");
		};
		assert_eq!(e, errno!(EACCES));
		// The superuser still passes
		resolve_in(&table, &path("/etc/passwd"), &AP).unwrap();
	}

	#[test]
	fn vfs_remove() {
		let table = new_table();
		remove_in(&table, &path("/etc/passwd"), &AP).unwrap();
		assert!(resolve_in(&table, &path("/etc/passwd"), &AP).is_err());
	}

	#[test]
	fn vfs_mount_stacking() {
		// The mount stacking scenario: an overlay mounted on /bin shadows
		// the underlying tree until unmounted; the second unmount fails
		let mut table = new_table();
		// Build the overlay: a tmpfs with /usr/bin and its own busybox
		let overlay = TmpFsType.load(None).unwrap();
		{
			let root = overlay.root().unwrap();
			let usr = root.ops.create(&root, b"usr", FileType::Directory).unwrap();
			usr.ops.create(&usr, b"bin", FileType::Directory).unwrap();
			root.ops.create(&root, b"busybox", FileType::Regular).unwrap();
		}
		let underlying = resolve_in(&table, &path("/bin/busybox"), &AP).unwrap();
		let at = resolve_in(&table, &path("/bin"), &AP).unwrap();
		table.mount(overlay, at).unwrap();
		// The overlay's content is visible through the mount point
		resolve_in(&table, &path("/bin/usr/bin"), &AP).unwrap();
		let shadowed = resolve_in(&table, &path("/bin/busybox"), &AP).unwrap();
		assert!(!Arc::ptr_eq(&shadowed, &underlying));
		// Mounting again over the same node is refused
		let second = TmpFsType.load(None).unwrap();
		let at = {
			// Resolving /bin now lands inside the overlay; take the
			// underlying node directly
			let root = table.root_mount().unwrap().root.clone();
			root.ops.lookup(&root, b"bin").unwrap()
		};
		let Err(e) = table.mount(second, at) else {
			panic!("double mount accepted");
		};
		assert_eq!(e, errno!(EBUSY));
		// Unmount: the underlying tree is visible again
		unmount_in(&mut table, &path("/bin"), &AP).unwrap();
		let visible = resolve_in(&table, &path("/bin/busybox"), &AP).unwrap();
		assert!(Arc::ptr_eq(&visible, &underlying));
		// The second unmount finds no mounted filesystem
		let Err(e) = unmount_in(&mut table, &path("/bin"), &AP) else {
			panic!("second unmount succeeded");
		};
		assert_eq!(e, errno!(EINVAL));
	}

	#[test]
	fn vfs_unmount_root_refused() {
		let mut table = new_table();
		let Err(e) = unmount_in(&mut table, &path("/"), &AP) else {
			panic!("root unmounted");
		};
		assert_eq!(e, errno!(EBUSY));
	}
}
