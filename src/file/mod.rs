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

//! File handling.
//!
//! Files are reached through the virtual filesystem (see [`vfs`]), which
//! aggregates every mounted filesystem into a single tree.

pub mod fd;
pub mod fs;
pub mod open_file;
pub mod path;
pub mod perm;
pub mod vfs;

use perm::{Gid, Uid};

/// The type of a filesystem node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileType {
	/// A regular file.
	Regular,
	/// A directory.
	Directory,
	/// A device file.
	Device,
	/// A symbolic link.
	Link,
	/// A named pipe.
	Fifo,
	/// A socket.
	Socket,
}

/// Status information of a filesystem node.
#[derive(Clone, Debug)]
pub struct Stat {
	/// The file's permission bits.
	pub mode: u16,
	/// The owning user.
	pub uid: Uid,
	/// The owning group.
	pub gid: Gid,
	/// The size of the file's content in bytes.
	pub size: u64,
	/// The number of hard links to the node.
	pub nlink: u16,
	/// Timestamp of the last access, in milliseconds since boot.
	pub atime: u64,
	/// Timestamp of the last content modification.
	pub mtime: u64,
	/// Timestamp of the last status change.
	pub ctime: u64,
}

impl Stat {
	/// Returns a default status for a new node of the given type.
	pub fn new(file_type: FileType) -> Self {
		let mode = match file_type {
			FileType::Directory => 0o755,
			_ => 0o644,
		};
		Self {
			mode,
			uid: perm::ROOT_UID,
			gid: perm::ROOT_GID,
			size: 0,
			nlink: 1,
			atime: 0,
			mtime: 0,
			ctime: 0,
		}
	}
}
