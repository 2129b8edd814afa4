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

//! The `open` system call opens a file and returns a descriptor on it.

use crate::{
	errno::EResult,
	file::open_file::OpenFile,
	memory::VirtAddr,
	syscall::{current_proc, user_path},
};

pub fn open(path: VirtAddr, flags: i32) -> EResult<usize> {
	let proc = current_proc()?;
	let path = user_path(&proc, path)?;
	let ap = *proc.creds.lock();
	let file = OpenFile::open(&path, flags, &ap)?;
	let fd = proc.fds.lock().alloc(file, false)?;
	Ok(fd as usize)
}
