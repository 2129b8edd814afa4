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

//! The `execve` system call replaces the calling process's image with a new
//! program.

use crate::{
	arch::x86::IntFrame,
	errno,
	errno::EResult,
	file::vfs,
	memory::{user, VirtAddr},
	process::exec,
	syscall::{current_proc, user_path},
};
use alloc::vec::Vec;

/// The maximum number of arguments or environment entries.
const ARG_MAX: usize = 256;

/// Reads a nul-terminated array of user string pointers.
fn copy_str_array(
	proc: &alloc::sync::Arc<crate::process::Process>,
	array: VirtAddr,
) -> EResult<Vec<Vec<u8>>> {
	let mut out = Vec::new();
	if array.0 == 0 {
		return Ok(out);
	}
	for i in 0..=ARG_MAX {
		if i == ARG_MAX {
			return Err(errno!(E2BIG));
		}
		let mut word = [0_u8; 4];
		user::copy_from_user(
			&mut proc.mem_space().lock(),
			array + i * word.len(),
			&mut word,
		)?;
		let ptr = u32::from_ne_bytes(word);
		if ptr == 0 {
			break;
		}
		let s = user::copy_cstr_from_user(
			&mut proc.mem_space().lock(),
			VirtAddr(ptr as usize),
			crate::limits::PATH_MAX,
		)?;
		out.push(s);
	}
	Ok(out)
}

pub fn execve(
	frame: &mut IntFrame,
	path: VirtAddr,
	argv: VirtAddr,
	envp: VirtAddr,
) -> EResult<usize> {
	let proc = current_proc()?;
	let path = user_path(&proc, path)?;
	let argv = copy_str_array(&proc, argv)?;
	let envp = copy_str_array(&proc, envp)?;
	let ap = *proc.creds.lock();
	let file = vfs::find_by_path(&path, &ap)?;
	let (entry, user_stack) = exec::exec(&proc, file, &argv, &envp, &ap)?;
	// Return into the new program
	frame.eip = entry.0 as u32;
	frame.esp = user_stack.0 as u32;
	Ok(0)
}
