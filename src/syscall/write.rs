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

//! The `write` system call writes to a file descriptor.

use crate::{
	errno::EResult,
	memory::{user, VirtAddr},
	syscall::current_proc,
};
use alloc::vec;

/// The size of a transfer chunk.
const CHUNK: usize = 0x10000;

pub fn write(fd: i32, buf: VirtAddr, count: usize) -> EResult<usize> {
	let proc = current_proc()?;
	let file = proc.fds.lock().get(fd)?;
	let mut kbuf = vec![0_u8; count.min(CHUNK)];
	let mut total = 0;
	while total < count {
		let len = kbuf.len().min(count - total);
		user::copy_from_user(&mut proc.mem_space().lock(), buf + total, &mut kbuf[..len])?;
		let n = file.write(&kbuf[..len])?;
		total += n;
		if n < len {
			break;
		}
	}
	Ok(total)
}
