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

//! The `mmap` system call reserves a region of the calling process's
//! address space.

use crate::{
	errno,
	errno::EResult,
	memory::{vas::Prot, VirtAddr},
	syscall::current_proc,
};

pub fn mmap(addr: VirtAddr, length: usize, prot: u8) -> EResult<usize> {
	if length == 0 {
		return Err(errno!(EINVAL));
	}
	// The protection bits share the area flags' shape
	let mut prot = Prot::from_bits(prot).ok_or_else(|| errno!(EINVAL))?;
	if prot.contains(Prot::KERNEL) {
		return Err(errno!(EPERM));
	}
	// Fresh anonymous memory must not leak previous content
	prot |= Prot::CLEAR_ON_FAULT;
	let proc = current_proc()?;
	let mapped = proc.mem_space().lock().map(addr, length, prot)?;
	Ok(mapped.0)
}
