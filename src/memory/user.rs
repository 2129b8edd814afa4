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

//! Userspace memory access.
//!
//! System calls receive raw user pointers; every access is validated
//! against the process's address space and performed through the kernel
//! window, faulting pages in on the way. A pointer landing outside of an
//! accessible area fails with `EACCES` instead of raising a fault in kernel
//! context.

use crate::{
	errno,
	errno::EResult,
	memory::{
		vas::Prot,
		vmem::FaultCode,
		VirtAddr, PAGE_SIZE,
	},
	process::mem_space::MemSpace,
};
use alloc::vec::Vec;
use core::ptr;

/// Checks that `[addr, addr + len)` lies inside user areas of `space`
/// carrying the `access` protection.
fn check_range(space: &MemSpace, addr: VirtAddr, len: usize, access: Prot) -> EResult<()> {
	let end = addr.0.checked_add(len).ok_or_else(|| errno!(EACCES))?;
	let mut cur = addr;
	while cur.0 < end {
		let vma = space.vas().find(cur).ok_or_else(|| errno!(EACCES))?;
		if !vma.is_allocated()
			|| vma.flags().contains(Prot::KERNEL)
			|| !vma.flags().contains(access)
		{
			return Err(errno!(EACCES));
		}
		cur = vma.end();
	}
	Ok(())
}

/// Returns a kernel-window pointer onto the user page containing `addr`,
/// faulting it in if missing.
fn window_at(space: &mut MemSpace, addr: VirtAddr, write: bool) -> EResult<*mut u8> {
	let phys = match space.translate(addr) {
		Some(phys) => phys,
		None => {
			let mut code = FaultCode::USER;
			if write {
				code |= FaultCode::WRITE;
			}
			if !space.fault(addr, code) {
				return Err(errno!(EACCES));
			}
			space.translate(addr).ok_or_else(|| errno!(EACCES))?
		}
	};
	let virt = phys.kernel_to_virtual().ok_or_else(|| errno!(EACCES))?;
	Ok(virt.as_ptr())
}

/// Copies `buf.len()` bytes from userspace at `src` into `buf`.
pub fn copy_from_user(space: &mut MemSpace, src: VirtAddr, buf: &mut [u8]) -> EResult<()> {
	check_range(space, src, buf.len(), Prot::READ)?;
	let mut copied = 0;
	while copied < buf.len() {
		let addr = src + copied;
		let page_off = addr.0 % PAGE_SIZE;
		let len = (buf.len() - copied).min(PAGE_SIZE - page_off);
		let ptr = window_at(space, addr, false)?;
		unsafe {
			ptr::copy_nonoverlapping(ptr, buf[copied..].as_mut_ptr(), len);
		}
		copied += len;
	}
	Ok(())
}

/// Copies `buf` into userspace at `dst`.
pub fn copy_to_user(space: &mut MemSpace, dst: VirtAddr, buf: &[u8]) -> EResult<()> {
	check_range(space, dst, buf.len(), Prot::WRITE)?;
	let mut copied = 0;
	while copied < buf.len() {
		let addr = dst + copied;
		let page_off = addr.0 % PAGE_SIZE;
		let len = (buf.len() - copied).min(PAGE_SIZE - page_off);
		let ptr = window_at(space, addr, true)?;
		unsafe {
			ptr::copy_nonoverlapping(buf[copied..].as_ptr(), ptr, len);
		}
		copied += len;
	}
	Ok(())
}

/// Copies a nul-terminated string from userspace at `src`, up to `max`
/// bytes, not including the terminator.
pub fn copy_cstr_from_user(space: &mut MemSpace, src: VirtAddr, max: usize) -> EResult<Vec<u8>> {
	let mut out = Vec::new();
	let mut addr = src;
	while out.len() < max {
		check_range(space, addr, 1, Prot::READ)?;
		let page_off = addr.0 % PAGE_SIZE;
		let len = PAGE_SIZE - page_off;
		let ptr = window_at(space, addr, false)?;
		for i in 0..len {
			if out.len() >= max {
				return Err(errno!(ENAMETOOLONG));
			}
			let byte = unsafe { ptr.add(i).read() };
			if byte == 0 {
				return Ok(out);
			}
			out.push(byte);
		}
		addr = addr + len;
	}
	Err(errno!(ENAMETOOLONG))
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::testing;

	fn space_with_buffer() -> (MemSpace, VirtAddr) {
		testing::init();
		let mut space = MemSpace::new().unwrap();
		let addr = space
			.map(
				VirtAddr(0),
				2 * PAGE_SIZE,
				Prot::READ | Prot::WRITE | Prot::CLEAR_ON_FAULT,
			)
			.unwrap();
		(space, addr)
	}

	#[test]
	fn user_copy_round_trip() {
		let (mut space, addr) = space_with_buffer();
		// Crossing the page boundary
		let dst = addr + PAGE_SIZE - 3;
		copy_to_user(&mut space, dst, b"boundary").unwrap();
		let mut buf = [0_u8; 8];
		copy_from_user(&mut space, dst, &mut buf).unwrap();
		assert_eq!(&buf, b"boundary");
	}

	#[test]
	fn user_copy_rejects_unmapped() {
		testing::init();
		let mut space = MemSpace::new().unwrap();
		let mut buf = [0_u8; 4];
		let Err(e) = copy_from_user(&mut space, VirtAddr(0x41000000), &mut buf) else {
			panic!("copy from a hole succeeded");
		};
		assert_eq!(e, errno!(EACCES));
	}

	#[test]
	fn user_copy_respects_protection() {
		testing::init();
		let mut space = MemSpace::new().unwrap();
		let addr = space.map(VirtAddr(0), PAGE_SIZE, Prot::READ).unwrap();
		let Err(e) = copy_to_user(&mut space, addr, b"x") else {
			panic!("wrote to a read-only area");
		};
		assert_eq!(e, errno!(EACCES));
	}

	#[test]
	fn user_cstr() {
		let (mut space, addr) = space_with_buffer();
		copy_to_user(&mut space, addr, b"/bin/sh\0junk").unwrap();
		let s = copy_cstr_from_user(&mut space, addr, 64).unwrap();
		assert_eq!(s, b"/bin/sh");
		// An unterminated string hits the length limit
		copy_to_user(&mut space, addr, &[b'a'; 32]).unwrap();
		let Err(e) = copy_cstr_from_user(&mut space, addr, 16) else {
			panic!("unterminated string accepted");
		};
		assert_eq!(e, errno!(ENAMETOOLONG));
	}
}
