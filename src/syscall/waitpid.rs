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

//! The `waitpid` system call waits for a child process to terminate and
//! reaps it.

use crate::{
	errno,
	errno::EResult,
	memory::{user, VirtAddr},
	syscall::current_proc,
};

pub fn waitpid(pid: i32, status_ptr: VirtAddr) -> EResult<usize> {
	// Only waiting for any child is supported
	if pid != -1 {
		return Err(errno!(ENOTSUP));
	}
	let proc = current_proc()?;
	let (child_pid, status) = proc.wait_child()?;
	if status_ptr.0 != 0 {
		user::copy_to_user(
			&mut proc.mem_space().lock(),
			status_ptr,
			&status.to_ne_bytes(),
		)?;
	}
	Ok(child_pid as usize)
}
