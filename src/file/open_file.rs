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

//! Open file descriptions.
//!
//! An open file description carries the offset and status flags of an open
//! file. It is shared by every file descriptor that refers to it, across
//! duplication and `fork`: a read through one descriptor advances the
//! offset seen by the others.

use crate::{
	errno,
	errno::EResult,
	file::{
		path::PathBuf,
		perm::AccessProfile,
		vfs,
		vfs::node::Vnode,
		FileType,
	},
	sync::Mutex,
};
use alloc::sync::Arc;

/// Open for reading only.
pub const O_RDONLY: i32 = 0o0;
/// Open for writing only.
pub const O_WRONLY: i32 = 0o1;
/// Open for reading and writing.
pub const O_RDWR: i32 = 0o2;
/// Mask of the access mode bits.
pub const O_ACCMODE: i32 = 0o3;
/// Create the file if it does not exist.
pub const O_CREAT: i32 = 0o100;
/// With `O_CREAT`, fail if the file already exists.
pub const O_EXCL: i32 = 0o200;
/// Truncate the file to length zero on open.
pub const O_TRUNC: i32 = 0o1000;
/// Every write is preceded by a seek to the end of the file.
pub const O_APPEND: i32 = 0o2000;
/// Fail if the file is not a directory.
pub const O_DIRECTORY: i32 = 0o200000;

/// The `whence` values of a seek.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Whence {
	/// Seek from the beginning of the file.
	Set,
	/// Seek from the current offset.
	Cur,
	/// Seek from the end of the file.
	End,
}

impl TryFrom<i32> for Whence {
	type Error = crate::errno::Errno;

	fn try_from(val: i32) -> EResult<Self> {
		match val {
			0 => Ok(Self::Set),
			1 => Ok(Self::Cur),
			2 => Ok(Self::End),
			_ => Err(errno!(EINVAL)),
		}
	}
}

/// An open file description.
pub struct OpenFile {
	/// The node the description points to.
	node: Arc<Vnode>,
	/// The status flags given at open time.
	flags: i32,
	/// The current offset, shared by every descriptor on this description.
	off: Mutex<u64>,
}

impl OpenFile {
	/// Opens the file at `path` with the given flags, enforcing `ap`'s
	/// permissions.
	///
	/// `O_CREAT` creates a regular file when the path does not resolve;
	/// `O_APPEND` starts at the end of the file; incompatible combinations
	/// are refused.
	pub fn open(path: &PathBuf, flags: i32, ap: &AccessProfile) -> EResult<Arc<Self>> {
		let node = match vfs::find_by_path(path, ap) {
			Ok(node) => {
				if flags & O_CREAT != 0 && flags & O_EXCL != 0 {
					return Err(errno!(EEXIST));
				}
				node
			}
			Err(e) if e == errno!(ENOENT) && flags & O_CREAT != 0 => {
				vfs::create(path, FileType::Regular, ap)?
			}
			Err(e) => return Err(e),
		};
		Self::open_node(node, flags, ap)
	}

	/// Opens the given node directly.
	pub fn open_node(node: Arc<Vnode>, flags: i32, ap: &AccessProfile) -> EResult<Arc<Self>> {
		if flags & O_DIRECTORY != 0 && !node.is_dir() {
			return Err(errno!(ENOTDIR));
		}
		// A directory cannot be opened for writing
		let accmode = flags & O_ACCMODE;
		if node.is_dir() && accmode != O_RDONLY {
			return Err(errno!(EISDIR));
		}
		{
			let stat = node.stat.lock();
			if (accmode == O_RDONLY || accmode == O_RDWR) && !ap.can_read(&stat) {
				return Err(errno!(EACCES));
			}
			if (accmode == O_WRONLY || accmode == O_RDWR) && !ap.can_write(&stat) {
				return Err(errno!(EACCES));
			}
		}
		node.ops.open(&node)?;
		if flags & O_TRUNC != 0 && accmode != O_RDONLY {
			node.ops.truncate(&node, 0)?;
		}
		let off = if flags & O_APPEND != 0 {
			node.size()
		} else {
			0
		};
		Ok(Arc::new(Self {
			node,
			flags,
			off: Mutex::new(off),
		}))
	}

	/// Returns the node the description points to.
	pub fn node(&self) -> &Arc<Vnode> {
		&self.node
	}

	/// Returns the status flags.
	pub fn flags(&self) -> i32 {
		self.flags
	}

	/// Tells whether the description allows reading.
	pub fn can_read(&self) -> bool {
		matches!(self.flags & O_ACCMODE, O_RDONLY | O_RDWR)
	}

	/// Tells whether the description allows writing.
	pub fn can_write(&self) -> bool {
		matches!(self.flags & O_ACCMODE, O_WRONLY | O_RDWR)
	}

	/// Returns the current offset.
	pub fn offset(&self) -> u64 {
		*self.off.lock()
	}

	/// Reads from the file at the current offset, advancing it by the
	/// number of bytes read.
	pub fn read(&self, buf: &mut [u8]) -> EResult<usize> {
		if !self.can_read() {
			return Err(errno!(EACCES));
		}
		let mut off = self.off.lock();
		let len = self.node.ops.read_at(&self.node, *off, buf)?;
		*off += len as u64;
		Ok(len)
	}

	/// Writes to the file at the current offset, advancing it by the number
	/// of bytes written. With `O_APPEND`, the write lands at the end of the
	/// file.
	pub fn write(&self, buf: &[u8]) -> EResult<usize> {
		if !self.can_write() {
			return Err(errno!(EACCES));
		}
		let mut off = self.off.lock();
		if self.flags & O_APPEND != 0 {
			*off = self.node.size();
		}
		let len = self.node.ops.write_at(&self.node, *off, buf)?;
		*off += len as u64;
		Ok(len)
	}

	/// Adjusts the offset and returns the new value.
	///
	/// This is the default seek of the file operation table: the offset
	/// moves relative to the beginning, the current value or the end,
	/// according to `whence`.
	pub fn seek(&self, offset: i64, whence: Whence) -> EResult<u64> {
		let mut off = self.off.lock();
		let base = match whence {
			Whence::Set => 0,
			Whence::Cur => *off as i64,
			Whence::End => self.node.size() as i64,
		};
		let new = base.checked_add(offset).ok_or_else(|| errno!(EINVAL))?;
		if new < 0 {
			return Err(errno!(EINVAL));
		}
		*off = new as u64;
		Ok(*off)
	}

	/// Returns the size of the underlying file.
	pub fn size(&self) -> u64 {
		self.node.size()
	}

	/// Binds the file to an address. Only legal on sockets.
	pub fn bind(&self, addr: &[u8]) -> EResult<()> {
		if self.node.vtype != FileType::Socket {
			return Err(errno!(ENOTSOCK));
		}
		self.node.ops.bind(&self.node, addr)
	}

	/// Connects the file to an address. Only legal on sockets.
	pub fn connect(&self, addr: &[u8]) -> EResult<()> {
		if self.node.vtype != FileType::Socket {
			return Err(errno!(ENOTSOCK));
		}
		self.node.ops.connect(&self.node, addr)
	}

	/// Sends a message on the file. Only legal on sockets.
	pub fn sendmsg(&self, buf: &[u8]) -> EResult<usize> {
		if self.node.vtype != FileType::Socket {
			return Err(errno!(ENOTSOCK));
		}
		self.node.ops.sendmsg(&self.node, buf)
	}

	/// Receives a message from the file. Only legal on sockets.
	pub fn recvmsg(&self, buf: &mut [u8]) -> EResult<usize> {
		if self.node.vtype != FileType::Socket {
			return Err(errno!(ENOTSOCK));
		}
		self.node.ops.recvmsg(&self.node, buf)
	}
}

impl Drop for OpenFile {
	fn drop(&mut self) {
		self.node.ops.close(&self.node);
	}
}

impl core::fmt::Debug for OpenFile {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("OpenFile")
			.field("node", &self.node)
			.field("flags", &self.flags)
			.field("off", &self.offset())
			.finish()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::file::fs::{tmp::TmpFsType, FilesystemType};

	const AP: AccessProfile = AccessProfile::KERNEL;

	fn new_file() -> Arc<Vnode> {
		let fs = TmpFsType.load(None).unwrap();
		let root = fs.root().unwrap();
		root.ops.create(&root, b"f", FileType::Regular).unwrap()
	}

	#[test]
	fn open_file_read_write_offset() {
		let node = new_file();
		let file = OpenFile::open_node(node, O_RDWR, &AP).unwrap();
		assert_eq!(file.write(b"hello").unwrap(), 5);
		assert_eq!(file.offset(), 5);
		file.seek(0, Whence::Set).unwrap();
		let mut buf = [0_u8; 5];
		assert_eq!(file.read(&mut buf).unwrap(), 5);
		assert_eq!(&buf, b"hello");
	}

	#[test]
	fn open_file_shared_offset() {
		// Two descriptors on the same description observe each other's
		// offset updates, as after a fork
		let node = new_file();
		let file = OpenFile::open_node(node, O_RDWR, &AP).unwrap();
		let dup = file.clone();
		file.write(b"abcdef").unwrap();
		dup.seek(2, Whence::Set).unwrap();
		let mut buf = [0_u8; 2];
		file.read(&mut buf).unwrap();
		assert_eq!(&buf, b"cd");
		assert_eq!(dup.offset(), 4);
	}

	#[test]
	fn open_file_append() {
		let node = new_file();
		{
			let file = OpenFile::open_node(node.clone(), O_WRONLY, &AP).unwrap();
			file.write(b"base").unwrap();
		}
		let file = OpenFile::open_node(node.clone(), O_WRONLY | O_APPEND, &AP).unwrap();
		// The offset starts at the end
		assert_eq!(file.offset(), 4);
		file.write(b"+more").unwrap();
		let check = OpenFile::open_node(node, O_RDONLY, &AP).unwrap();
		let mut buf = [0_u8; 16];
		let n = check.read(&mut buf).unwrap();
		assert_eq!(&buf[..n], b"base+more");
	}

	#[test]
	fn open_file_seek_whence() {
		let node = new_file();
		let file = OpenFile::open_node(node, O_RDWR, &AP).unwrap();
		file.write(b"0123456789").unwrap();
		assert_eq!(file.seek(-3, Whence::End).unwrap(), 7);
		assert_eq!(file.seek(1, Whence::Cur).unwrap(), 8);
		assert_eq!(file.seek(2, Whence::Set).unwrap(), 2);
		// Seeking before the beginning is refused
		assert!(file.seek(-1, Whence::Set).is_err());
	}

	#[test]
	fn open_file_mode_enforcement() {
		let node = new_file();
		let ro = OpenFile::open_node(node.clone(), O_RDONLY, &AP).unwrap();
		assert!(ro.write(b"x").is_err());
		let wo = OpenFile::open_node(node, O_WRONLY, &AP).unwrap();
		let mut buf = [0_u8; 1];
		assert!(wo.read(&mut buf).is_err());
	}

	#[test]
	fn open_file_socket_ops_on_regular() {
		let node = new_file();
		let file = OpenFile::open_node(node, O_RDWR, &AP).unwrap();
		assert_eq!(file.bind(b"x").unwrap_err(), errno!(ENOTSOCK));
		assert_eq!(file.connect(b"x").unwrap_err(), errno!(ENOTSOCK));
	}

	#[test]
	fn open_file_directory_restrictions() {
		let fs = TmpFsType.load(None).unwrap();
		let root = fs.root().unwrap();
		assert_eq!(
			OpenFile::open_node(root.clone(), O_RDWR, &AP).unwrap_err(),
			errno!(EISDIR)
		);
		let file = root.ops.create(&root, b"f", FileType::Regular).unwrap();
		assert_eq!(
			OpenFile::open_node(file, O_RDONLY | O_DIRECTORY, &AP).unwrap_err(),
			errno!(ENOTDIR)
		);
	}
}
