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

//! The `lseek` system call moves the offset of an open file.

use crate::{errno::EResult, file::open_file::Whence, syscall::current_proc};

pub fn lseek(fd: i32, offset: i64, whence: i32) -> EResult<usize> {
	let proc = current_proc()?;
	let file = proc.fds.lock().get(fd)?;
	let off = file.seek(offset, Whence::try_from(whence)?)?;
	Ok(off as usize)
}
