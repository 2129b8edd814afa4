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

//! System call handling.
//!
//! The external trap stub pushes the caller's registers and calls
//! [`dispatch`] on the calling thread's kernel stack. The system call
//! number and arguments follow the i386 convention: number in `eax`,
//! arguments in `ebx`, `ecx`, `edx`, `esi`, `edi`. Errors return as the
//! negated error value.

mod close;
mod execve;
mod exit;
mod fork;
mod getpid;
mod lseek;
mod mmap;
mod munmap;
mod open;
mod read;
mod stat;
mod waitpid;
mod write;

use crate::{
	arch::x86::IntFrame,
	errno,
	errno::EResult,
	file::path::PathBuf,
	memory::{user, VirtAddr},
	process::{scheduler, Process},
};
use alloc::sync::Arc;

/// `exit` system call number.
pub const SYS_EXIT: u32 = 1;
/// `fork` system call number.
pub const SYS_FORK: u32 = 2;
/// `read` system call number.
pub const SYS_READ: u32 = 3;
/// `write` system call number.
pub const SYS_WRITE: u32 = 4;
/// `open` system call number.
pub const SYS_OPEN: u32 = 5;
/// `close` system call number.
pub const SYS_CLOSE: u32 = 6;
/// `waitpid` system call number.
pub const SYS_WAITPID: u32 = 7;
/// `execve` system call number.
pub const SYS_EXECVE: u32 = 11;
/// `lseek` system call number.
pub const SYS_LSEEK: u32 = 19;
/// `getpid` system call number.
pub const SYS_GETPID: u32 = 20;
/// `munmap` system call number.
pub const SYS_MUNMAP: u32 = 91;
/// `stat` system call number.
pub const SYS_STAT: u32 = 106;
/// `lstat` system call number.
pub const SYS_LSTAT: u32 = 107;
/// `mmap` system call number.
pub const SYS_MMAP: u32 = 192;

/// Returns the process of the calling thread.
fn current_proc() -> EResult<Arc<Process>> {
	scheduler::current_process().ok_or_else(|| errno!(EPERM))
}

/// Reads a path from userspace at `ptr` and resolves it against the
/// process's working directory when relative.
fn user_path(proc: &Arc<Process>, ptr: VirtAddr) -> EResult<PathBuf> {
	let bytes = user::copy_cstr_from_user(
		&mut proc.mem_space().lock(),
		ptr,
		crate::limits::PATH_MAX,
	)?;
	let path = PathBuf::from_bytes(&bytes)?;
	if path.is_absolute() {
		Ok(path)
	} else {
		Ok(proc.cwd.lock().join(&path))
	}
}

/// Dispatches the system call described by the trap frame and stores the
/// result in its `eax`.
pub fn dispatch(frame: &mut IntFrame) {
	let id = frame.eax;
	let (a, b, c) = (frame.ebx, frame.ecx, frame.edx);
	let result: EResult<usize> = match id {
		SYS_EXIT => exit::exit(a as i32),
		SYS_FORK => fork::fork(frame),
		SYS_READ => read::read(a as i32, VirtAddr(b as usize), c as usize),
		SYS_WRITE => write::write(a as i32, VirtAddr(b as usize), c as usize),
		SYS_OPEN => open::open(VirtAddr(a as usize), b as i32),
		SYS_CLOSE => close::close(a as i32),
		SYS_WAITPID => waitpid::waitpid(a as i32, VirtAddr(b as usize)),
		SYS_EXECVE => execve::execve(
			frame,
			VirtAddr(a as usize),
			VirtAddr(b as usize),
			VirtAddr(c as usize),
		),
		SYS_LSEEK => lseek::lseek(a as i32, b as i32 as i64, c as i32),
		SYS_GETPID => getpid::getpid(),
		SYS_MUNMAP => munmap::munmap(VirtAddr(a as usize), b as usize),
		SYS_STAT | SYS_LSTAT => stat::stat(VirtAddr(a as usize), VirtAddr(b as usize)),
		SYS_MMAP => mmap::mmap(VirtAddr(a as usize), b as usize, c as u8),
		_ => Err(errno!(ENOSYS)),
	};
	frame.eax = match result {
		Ok(val) => val as u32,
		Err(e) => e.to_syscall() as u32,
	};
}
