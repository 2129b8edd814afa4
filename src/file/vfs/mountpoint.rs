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

//! Mount points.
//!
//! Mounts form an insertion-ordered list; the first entry is the root
//! mount, which has no mount point node.

use crate::{
	errno,
	errno::EResult,
	file::fs::Filesystem,
	sync::Mutex,
};
use alloc::{sync::Arc, vec::Vec};

use super::node::Vnode;

/// A mounted filesystem.
pub struct Mount {
	/// The filesystem instance.
	pub fs: Arc<dyn Filesystem>,
	/// The root node of the mounted filesystem.
	pub root: Arc<Vnode>,
	/// The node the filesystem is mounted over. `None` for the root mount,
	/// which holds the underlying node alive otherwise.
	pub mountpoint: Option<Arc<Vnode>>,
}

/// The ordered list of mounts of one namespace.
#[derive(Default)]
pub struct MountTable {
	/// The mounts, in insertion order. The first is the root.
	mounts: Vec<Arc<Mount>>,
}

impl MountTable {
	/// Creates an empty table.
	pub const fn new() -> Self {
		Self {
			mounts: Vec::new(),
		}
	}

	/// Installs the root mount. Refused if a root is already installed.
	pub fn mount_root(&mut self, fs: Arc<dyn Filesystem>) -> EResult<Arc<Mount>> {
		if !self.mounts.is_empty() {
			return Err(errno!(EBUSY));
		}
		let mount = Arc::new(Mount {
			root: fs.root()?,
			fs,
			mountpoint: None,
		});
		self.mounts.push(mount.clone());
		Ok(mount)
	}

	/// Mounts `fs` over the given node.
	///
	/// The node must be a directory and not already host a mount.
	pub fn mount(&mut self, fs: Arc<dyn Filesystem>, at: Arc<Vnode>) -> EResult<Arc<Mount>> {
		if self.mounts.is_empty() {
			return Err(errno!(EINVAL));
		}
		if !at.is_dir() {
			return Err(errno!(ENOTDIR));
		}
		let mount = Arc::new(Mount {
			root: fs.root()?,
			fs,
			mountpoint: Some(at.clone()),
		});
		at.attach_mount(mount.clone())?;
		self.mounts.push(mount.clone());
		Ok(mount)
	}

	/// Unmounts the filesystem whose root is the given node.
	///
	/// Returns `EINVAL` when the node is not the root of a mounted
	/// filesystem, and `EBUSY` for the root mount.
	pub fn unmount(&mut self, root: &Arc<Vnode>) -> EResult<()> {
		let i = self
			.mounts
			.iter()
			.position(|m| Arc::ptr_eq(&m.root, root))
			.ok_or_else(|| errno!(EINVAL))?;
		let mount = &self.mounts[i];
		let Some(mountpoint) = &mount.mountpoint else {
			// The root mount cannot be detached
			return Err(errno!(EBUSY));
		};
		mountpoint.detach_mount();
		self.mounts.remove(i);
		Ok(())
	}

	/// Returns the root mount.
	pub fn root_mount(&self) -> EResult<Arc<Mount>> {
		self.mounts.first().cloned().ok_or_else(|| errno!(ENOENT))
	}

	/// Returns the mounts, in insertion order.
	pub fn iter(&self) -> impl Iterator<Item = &Arc<Mount>> {
		self.mounts.iter()
	}
}

/// The system's mount table.
static MOUNTS: Mutex<MountTable> = Mutex::new(MountTable::new());

/// Returns the system's mount table.
pub fn table() -> &'static Mutex<MountTable> {
	&MOUNTS
}
