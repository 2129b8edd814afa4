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

//! The `stat` and `lstat` system calls return the status of a file.

use crate::{
	errno::EResult,
	file::vfs,
	memory::{user, VirtAddr},
	syscall::{current_proc, user_path},
};
use core::{mem::size_of, slice};

/// Status record handed to userspace.
#[repr(C)]
struct UserStat {
	st_mode: u16,
	st_uid: u16,
	st_gid: u16,
	st_nlink: u16,
	st_size: u64,
	st_atime: u64,
	st_mtime: u64,
	st_ctime: u64,
}

pub fn stat(path: VirtAddr, stat_ptr: VirtAddr) -> EResult<usize> {
	let proc = current_proc()?;
	let path = user_path(&proc, path)?;
	let ap = *proc.creds.lock();
	let stat = vfs::stat(&path, &ap)?;
	let out = UserStat {
		st_mode: stat.mode,
		st_uid: stat.uid,
		st_gid: stat.gid,
		st_nlink: stat.nlink,
		st_size: stat.size,
		st_atime: stat.atime,
		st_mtime: stat.mtime,
		st_ctime: stat.ctime,
	};
	let bytes = unsafe {
		slice::from_raw_parts(&out as *const UserStat as *const u8, size_of::<UserStat>())
	};
	user::copy_to_user(&mut proc.mem_space().lock(), stat_ptr, bytes)?;
	Ok(0)
}
