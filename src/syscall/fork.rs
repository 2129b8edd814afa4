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

//! The `fork` system call duplicates the calling process.
//!
//! The child resumes at the same point as the parent, observing a return
//! value of zero, and initially shares every memory frame with the parent
//! in copy-on-write.

use crate::{arch::x86::IntFrame, errno::EResult, syscall::current_proc};

pub fn fork(frame: &IntFrame) -> EResult<usize> {
	let proc = current_proc()?;
	let child = proc.fork()?;
	// The child returns zero from the call
	let mut child_frame = *frame;
	child_frame.eax = 0;
	child.attach_fork_thread(child_frame)?;
	Ok(child.pid as usize)
}
