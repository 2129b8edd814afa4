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

//! Filesystem nodes.
//!
//! A [`Vnode`] is the filesystem-agnostic handle to a filesystem object.
//! Filesystem drivers provide an operations table per node; slots a driver
//! does not implement fall back to defaults returning `ENOTSUP`.
//!
//! While a filesystem is mounted over a node, the node holds the mount and
//! path walks through it are redirected to the mounted root.

use crate::{
	errno,
	errno::EResult,
	file::{FileType, Stat},
	sync::Mutex,
};
use alloc::{boxed::Box, sync::Arc};
use core::fmt;

use super::mountpoint::Mount;

/// Operations table of a filesystem node.
///
/// The object carries the driver's private data for the node. Unimplemented
/// slots return `ENOTSUP`.
pub trait NodeOps: Send + Sync {
	/// Looks up the entry `name` inside the directory `dir`.
	///
	/// Returns `ENOENT` if the entry does not exist.
	fn lookup(&self, dir: &Vnode, name: &[u8]) -> EResult<Arc<Vnode>> {
		let _ = (dir, name);
		Err(errno!(ENOTSUP))
	}

	/// Creates the entry `name` of the given type inside the directory
	/// `dir`.
	fn create(&self, dir: &Vnode, name: &[u8], ftype: FileType) -> EResult<Arc<Vnode>> {
		let _ = (dir, name, ftype);
		Err(errno!(ENOTSUP))
	}

	/// Removes the entry `name` from the directory `dir`.
	fn remove(&self, dir: &Vnode, name: &[u8]) -> EResult<()> {
		let _ = (dir, name);
		Err(errno!(ENOTSUP))
	}

	/// Called when the node is opened.
	fn open(&self, node: &Vnode) -> EResult<()> {
		let _ = node;
		Ok(())
	}

	/// Called when the last open file on the node is closed.
	fn close(&self, node: &Vnode) {
		let _ = node;
	}

	/// Reads from the node's content at offset `off` into `buf`, returning
	/// the number of bytes read.
	fn read_at(&self, node: &Vnode, off: u64, buf: &mut [u8]) -> EResult<usize> {
		let _ = (node, off, buf);
		Err(errno!(ENOTSUP))
	}

	/// Writes `buf` to the node's content at offset `off`, returning the
	/// number of bytes written.
	fn write_at(&self, node: &Vnode, off: u64, buf: &[u8]) -> EResult<usize> {
		let _ = (node, off, buf);
		Err(errno!(ENOTSUP))
	}

	/// Truncates or extends the node's content to `size` bytes.
	fn truncate(&self, node: &Vnode, size: u64) -> EResult<()> {
		let _ = (node, size);
		Err(errno!(ENOTSUP))
	}

	/// Binds the node to an address (sockets).
	fn bind(&self, node: &Vnode, addr: &[u8]) -> EResult<()> {
		let _ = (node, addr);
		Err(errno!(ENOTSUP))
	}

	/// Connects the node to an address (sockets).
	fn connect(&self, node: &Vnode, addr: &[u8]) -> EResult<()> {
		let _ = (node, addr);
		Err(errno!(ENOTSUP))
	}

	/// Sends a message on the node (sockets).
	fn sendmsg(&self, node: &Vnode, buf: &[u8]) -> EResult<usize> {
		let _ = (node, buf);
		Err(errno!(ENOTSUP))
	}

	/// Receives a message from the node (sockets).
	fn recvmsg(&self, node: &Vnode, buf: &mut [u8]) -> EResult<usize> {
		let _ = (node, buf);
		Err(errno!(ENOTSUP))
	}

	/// Called on the node's final release.
	fn release(&self) {}
}

/// A filesystem node handle.
///
/// The reference count of the `Arc` holding the node is the node's own
/// reference count; the driver's `release` operation runs on final drop.
pub struct Vnode {
	/// The node's type.
	pub vtype: FileType,
	/// The driver's operations and private data.
	pub ops: Box<dyn NodeOps>,
	/// The node's status.
	pub stat: Mutex<Stat>,
	/// The filesystem mounted over this node, if any.
	mounted_here: Mutex<Option<Arc<Mount>>>,
}

impl Vnode {
	/// Creates a node handle.
	pub fn new(vtype: FileType, ops: Box<dyn NodeOps>, stat: Stat) -> Arc<Self> {
		Arc::new(Self {
			vtype,
			ops,
			stat: Mutex::new(stat),
			mounted_here: Mutex::new(None),
		})
	}

	/// Tells whether the node is a directory.
	pub fn is_dir(&self) -> bool {
		self.vtype == FileType::Directory
	}

	/// Returns the filesystem mounted over this node, if any.
	pub fn mounted_here(&self) -> Option<Arc<Mount>> {
		self.mounted_here.lock().clone()
	}

	/// Attaches a mount over this node. Refused if one is already attached.
	pub(super) fn attach_mount(&self, mount: Arc<Mount>) -> EResult<()> {
		let mut mounted = self.mounted_here.lock();
		if mounted.is_some() {
			return Err(errno!(EBUSY));
		}
		*mounted = Some(mount);
		Ok(())
	}

	/// Detaches the mount over this node.
	pub(super) fn detach_mount(&self) {
		self.mounted_here.lock().take();
	}

	/// Returns the size of the node's content.
	pub fn size(&self) -> u64 {
		self.stat.lock().size
	}
}

impl Drop for Vnode {
	fn drop(&mut self) {
		self.ops.release();
	}
}

impl fmt::Debug for Vnode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Vnode")
			.field("vtype", &self.vtype)
			.field("size", &self.size())
			.finish()
	}
}
