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

//! Temporary filesystem, storing its content in memory.
//!
//! It is the root filesystem when no initramfs is handed over by the
//! bootloader, and the reference implementation of the filesystem
//! contract.

use super::{Filesystem, FilesystemType};
use crate::{
	device::BlkDev,
	errno,
	errno::EResult,
	file::{
		vfs::node::{NodeOps, Vnode},
		FileType, Stat,
	},
	sync::Mutex,
	time,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};

/// The content of a tmpfs node.
enum TmpContent {
	/// A regular file's bytes.
	Regular(Vec<u8>),
	/// A directory's entries.
	Directory(Vec<(Vec<u8>, Arc<Vnode>)>),
}

/// A tmpfs node: the driver's private data behind a [`Vnode`].
struct TmpNode {
	content: Mutex<TmpContent>,
}

impl TmpNode {
	/// Creates a node handle of the given type.
	fn new_vnode(ftype: FileType) -> Arc<Vnode> {
		let content = match ftype {
			FileType::Directory => TmpContent::Directory(Vec::new()),
			_ => TmpContent::Regular(Vec::new()),
		};
		let mut stat = Stat::new(ftype);
		stat.ctime = time::uptime_ms();
		stat.mtime = stat.ctime;
		Vnode::new(
			ftype,
			Box::new(TmpNode {
				content: Mutex::new(content),
			}),
			stat,
		)
	}
}

impl NodeOps for TmpNode {
	fn lookup(&self, dir: &Vnode, name: &[u8]) -> EResult<Arc<Vnode>> {
		if !dir.is_dir() {
			return Err(errno!(ENOTDIR));
		}
		let content = self.content.lock();
		let TmpContent::Directory(entries) = &*content else {
			return Err(errno!(ENOTDIR));
		};
		entries
			.iter()
			.find(|(n, _)| n == name)
			.map(|(_, node)| node.clone())
			.ok_or_else(|| errno!(ENOENT))
	}

	fn create(&self, dir: &Vnode, name: &[u8], ftype: FileType) -> EResult<Arc<Vnode>> {
		if !dir.is_dir() {
			return Err(errno!(ENOTDIR));
		}
		let mut content = self.content.lock();
		let TmpContent::Directory(entries) = &mut *content else {
			return Err(errno!(ENOTDIR));
		};
		if entries.iter().any(|(n, _)| n == name) {
			return Err(errno!(EEXIST));
		}
		let node = TmpNode::new_vnode(ftype);
		entries.push((name.to_vec(), node.clone()));
		let mut stat = dir.stat.lock();
		stat.size = entries.len() as u64;
		stat.mtime = time::uptime_ms();
		Ok(node)
	}

	fn remove(&self, dir: &Vnode, name: &[u8]) -> EResult<()> {
		if !dir.is_dir() {
			return Err(errno!(ENOTDIR));
		}
		let mut content = self.content.lock();
		let TmpContent::Directory(entries) = &mut *content else {
			return Err(errno!(ENOTDIR));
		};
		let i = entries
			.iter()
			.position(|(n, _)| n == name)
			.ok_or_else(|| errno!(ENOENT))?;
		// A non-empty directory cannot be removed
		let (_, node) = &entries[i];
		if node.is_dir() && node.size() > 0 {
			return Err(errno!(EBUSY));
		}
		if node.mounted_here().is_some() {
			return Err(errno!(EBUSY));
		}
		entries.remove(i);
		let mut stat = dir.stat.lock();
		stat.size = entries.len() as u64;
		stat.mtime = time::uptime_ms();
		Ok(())
	}

	fn read_at(&self, node: &Vnode, off: u64, buf: &mut [u8]) -> EResult<usize> {
		if node.is_dir() {
			return Err(errno!(EISDIR));
		}
		let content = self.content.lock();
		let TmpContent::Regular(data) = &*content else {
			return Err(errno!(EISDIR));
		};
		let off = off as usize;
		if off >= data.len() {
			return Ok(0);
		}
		let len = buf.len().min(data.len() - off);
		buf[..len].copy_from_slice(&data[off..off + len]);
		Ok(len)
	}

	fn write_at(&self, node: &Vnode, off: u64, buf: &[u8]) -> EResult<usize> {
		if node.is_dir() {
			return Err(errno!(EISDIR));
		}
		let mut content = self.content.lock();
		let TmpContent::Regular(data) = &mut *content else {
			return Err(errno!(EISDIR));
		};
		let off = off as usize;
		let end = off + buf.len();
		if data.len() < end {
			data.resize(end, 0);
		}
		data[off..end].copy_from_slice(buf);
		let mut stat = node.stat.lock();
		stat.size = data.len() as u64;
		stat.mtime = time::uptime_ms();
		Ok(buf.len())
	}

	fn truncate(&self, node: &Vnode, size: u64) -> EResult<()> {
		if node.is_dir() {
			return Err(errno!(EISDIR));
		}
		let mut content = self.content.lock();
		let TmpContent::Regular(data) = &mut *content else {
			return Err(errno!(EISDIR));
		};
		data.resize(size as usize, 0);
		node.stat.lock().size = size;
		Ok(())
	}
}

/// A mounted tmpfs.
pub struct TmpFs {
	root: Arc<Vnode>,
}

impl Filesystem for TmpFs {
	fn name(&self) -> &'static str {
		"tmpfs"
	}

	fn root(&self) -> EResult<Arc<Vnode>> {
		Ok(self.root.clone())
	}
}

/// The tmpfs filesystem type.
pub struct TmpFsType;

impl FilesystemType for TmpFsType {
	fn name(&self) -> &'static str {
		"tmpfs"
	}

	fn load(&self, _dev: Option<Arc<BlkDev>>) -> EResult<Arc<dyn Filesystem>> {
		Ok(Arc::new(TmpFs {
			root: TmpNode::new_vnode(FileType::Directory),
		}))
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn new_fs() -> Arc<dyn Filesystem> {
		TmpFsType.load(None).unwrap()
	}

	#[test]
	fn tmpfs_create_lookup_remove() {
		let fs = new_fs();
		let root = fs.root().unwrap();
		let file = root.ops.create(&root, b"hello", FileType::Regular).unwrap();
		assert_eq!(file.vtype, FileType::Regular);
		let found = root.ops.lookup(&root, b"hello").unwrap();
		assert!(Arc::ptr_eq(&file, &found));
		// Creating over an existing entry is refused
		let Err(e) = root.ops.create(&root, b"hello", FileType::Regular) else {
			panic!("duplicate entry accepted");
		};
		assert_eq!(e, errno!(EEXIST));
		root.ops.remove(&root, b"hello").unwrap();
		let Err(e) = root.ops.lookup(&root, b"hello") else {
			panic!("removed entry still resolves");
		};
		assert_eq!(e, errno!(ENOENT));
	}

	#[test]
	fn tmpfs_read_write() {
		let fs = new_fs();
		let root = fs.root().unwrap();
		let file = root.ops.create(&root, b"data", FileType::Regular).unwrap();
		assert_eq!(file.ops.write_at(&file, 0, b"hello world").unwrap(), 11);
		assert_eq!(file.size(), 11);
		// Sparse write past the end zero-fills the hole
		file.ops.write_at(&file, 16, b"!").unwrap();
		let mut buf = [0xff_u8; 32];
		let n = file.ops.read_at(&file, 0, &mut buf).unwrap();
		assert_eq!(n, 17);
		assert_eq!(&buf[..11], b"hello world");
		assert_eq!(buf[11..16], [0; 5]);
		// Reads past the end return zero bytes
		assert_eq!(file.ops.read_at(&file, 100, &mut buf).unwrap(), 0);
	}

	#[test]
	fn tmpfs_remove_non_empty_dir_refused() {
		let fs = new_fs();
		let root = fs.root().unwrap();
		let dir = root.ops.create(&root, b"sub", FileType::Directory).unwrap();
		dir.ops.create(&dir, b"child", FileType::Regular).unwrap();
		let Err(e) = root.ops.remove(&root, b"sub") else {
			panic!("non-empty directory removed");
		};
		assert_eq!(e, errno!(EBUSY));
		dir.ops.remove(&dir, b"child").unwrap();
		root.ops.remove(&root, b"sub").unwrap();
	}

	#[test]
	fn tmpfs_defaults_not_supported() {
		let fs = new_fs();
		let root = fs.root().unwrap();
		let file = root.ops.create(&root, b"f", FileType::Regular).unwrap();
		// Slots the driver does not implement fall back to `ENOTSUP`
		let Err(e) = file.ops.bind(&file, b"addr") else {
			panic!("bind succeeded on a tmpfs file");
		};
		assert_eq!(e, errno!(ENOTSUP));
		let Err(e) = file.ops.sendmsg(&file, b"msg") else {
			panic!("sendmsg succeeded on a tmpfs file");
		};
		assert_eq!(e, errno!(ENOTSUP));
	}
}
