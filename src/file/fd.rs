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

//! File descriptor tables.
//!
//! Each process maps small integers to open file descriptions through a
//! fixed-width table. Duplicating the table (for `fork`) shares the
//! descriptions, not just the nodes.

use crate::{
	errno,
	errno::EResult,
	file::open_file::OpenFile,
	limits::OPEN_MAX,
};
use alloc::sync::Arc;
use core::array;

/// Close the descriptor on `execve`.
pub const FD_CLOEXEC: i32 = 1;

/// A file descriptor table entry.
#[derive(Clone, Debug)]
struct FdEntry {
	/// Descriptor flags (`FD_CLOEXEC`).
	flags: i32,
	/// The open file description.
	file: Arc<OpenFile>,
}

/// A process's file descriptor table.
#[derive(Debug)]
pub struct FdTable {
	/// The entries, indexed by descriptor.
	fds: [Option<FdEntry>; OPEN_MAX],
}

impl FdTable {
	/// Creates an empty table.
	pub fn new() -> Self {
		Self {
			fds: array::from_fn(|_| None),
		}
	}

	/// Installs `file` on the lowest free descriptor and returns it.
	pub fn alloc(&mut self, file: Arc<OpenFile>, cloexec: bool) -> EResult<i32> {
		let fd = self
			.fds
			.iter()
			.position(|e| e.is_none())
			.ok_or_else(|| errno!(ENOMEM))?;
		self.fds[fd] = Some(FdEntry {
			flags: if cloexec { FD_CLOEXEC } else { 0 },
			file,
		});
		Ok(fd as i32)
	}

	/// Returns the open file description behind descriptor `fd`.
	pub fn get(&self, fd: i32) -> EResult<Arc<OpenFile>> {
		usize::try_from(fd)
			.ok()
			.and_then(|fd| self.fds.get(fd)?.as_ref())
			.map(|e| e.file.clone())
			.ok_or_else(|| errno!(EINVAL))
	}

	/// Closes descriptor `fd`. The description is released with its last
	/// descriptor.
	pub fn close(&mut self, fd: i32) -> EResult<()> {
		let entry = usize::try_from(fd)
			.ok()
			.and_then(|fd| self.fds.get_mut(fd))
			.ok_or_else(|| errno!(EINVAL))?;
		entry.take().map(|_| ()).ok_or_else(|| errno!(EINVAL))
	}

	/// Duplicates the table for `fork`: descriptors point to the same
	/// descriptions.
	pub fn duplicate(&self) -> Self {
		Self {
			fds: self.fds.clone(),
		}
	}

	/// Closes every descriptor carrying `FD_CLOEXEC`, for `execve`.
	pub fn close_on_exec(&mut self) {
		for entry in &mut self.fds {
			if entry.as_ref().is_some_and(|e| e.flags & FD_CLOEXEC != 0) {
				entry.take();
			}
		}
	}

	/// Returns the number of open descriptors.
	pub fn open_count(&self) -> usize {
		self.fds.iter().filter(|e| e.is_some()).count()
	}
}

impl Default for FdTable {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::file::{
		fs::{tmp::TmpFsType, FilesystemType},
		open_file::O_RDWR,
		perm::AccessProfile,
		FileType,
	};

	fn new_open_file() -> Arc<OpenFile> {
		let fs = TmpFsType.load(None).unwrap();
		let root = fs.root().unwrap();
		let node = root.ops.create(&root, b"f", FileType::Regular).unwrap();
		OpenFile::open_node(node, O_RDWR, &AccessProfile::KERNEL).unwrap()
	}

	#[test]
	fn fd_alloc_lowest_free() {
		let mut table = FdTable::new();
		let file = new_open_file();
		assert_eq!(table.alloc(file.clone(), false).unwrap(), 0);
		assert_eq!(table.alloc(file.clone(), false).unwrap(), 1);
		assert_eq!(table.alloc(file.clone(), false).unwrap(), 2);
		table.close(1).unwrap();
		assert_eq!(table.alloc(file, false).unwrap(), 1);
	}

	#[test]
	fn fd_errors() {
		let mut table = FdTable::new();
		assert!(table.get(0).is_err());
		assert!(table.get(-1).is_err());
		assert!(table.close(7).is_err());
		// The table is fixed-width
		let file = new_open_file();
		for _ in 0..OPEN_MAX {
			table.alloc(file.clone(), false).unwrap();
		}
		assert!(table.alloc(file, false).is_err());
	}

	#[test]
	fn fd_fork_shares_descriptions() {
		let mut table = FdTable::new();
		let file = new_open_file();
		let fd = table.alloc(file, false).unwrap();
		let copy = table.duplicate();
		let a = table.get(fd).unwrap();
		let b = copy.get(fd).unwrap();
		assert!(Arc::ptr_eq(&a, &b));
	}

	#[test]
	fn fd_close_on_exec() {
		let mut table = FdTable::new();
		let file = new_open_file();
		let keep = table.alloc(file.clone(), false).unwrap();
		let drop_fd = table.alloc(file, true).unwrap();
		table.close_on_exec();
		assert!(table.get(keep).is_ok());
		assert!(table.get(drop_fd).is_err());
	}
}
