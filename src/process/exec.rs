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

//! Program execution.
//!
//! The program loader (ELF or otherwise) lives outside of the core and
//! registers an [`Executor`]. `execve` resolves the file through the VFS,
//! asks the executor to build a fresh address space holding the program
//! image, then swaps it into the process. The caller patches the trap frame
//! with the image's entry point, so the return to userspace lands in the
//! new program.

use crate::{
	errno,
	errno::EResult,
	file::{perm::AccessProfile, vfs::node::Vnode},
	memory::VirtAddr,
	process::{mem_space::MemSpace, Process},
	sync::OnceInit,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};

/// A program image built by an executor, ready to be entered.
pub struct ProgramImage {
	/// The address space holding the loaded program.
	pub mem_space: MemSpace,
	/// The program's entry point.
	pub entry: VirtAddr,
	/// The initial userspace stack pointer, with arguments and environment
	/// already in place.
	pub user_stack: VirtAddr,
}

/// A program loader.
pub trait Executor: Send + Sync {
	/// Builds a program image from the given file, arguments and
	/// environment.
	fn build_image(
		&self,
		file: &Arc<Vnode>,
		argv: &[Vec<u8>],
		envp: &[Vec<u8>],
	) -> EResult<ProgramImage>;
}

/// The registered program loader.
static EXECUTOR: OnceInit<Box<dyn Executor>> = OnceInit::new();

/// Registers the program loader. Must be called once at boot.
pub fn register_executor(executor: Box<dyn Executor>) {
	EXECUTOR.init(executor);
}

/// Replaces the image of `proc` with the program in `file`.
///
/// On success the old address space is gone and descriptors marked
/// close-on-exec are closed; the returned image carries the entry point and
/// stack pointer for the trap frame.
pub fn exec(
	proc: &Arc<Process>,
	file: Arc<Vnode>,
	argv: &[Vec<u8>],
	envp: &[Vec<u8>],
	ap: &AccessProfile,
) -> EResult<(VirtAddr, VirtAddr)> {
	if !ap.can_search(&file.stat.lock()) {
		// Execution requires the execute bit
		return Err(errno!(EACCES));
	}
	let executor = EXECUTOR.try_get().ok_or_else(|| errno!(ENOSYS))?;
	let image = executor.build_image(&file, argv, envp)?;
	// Point of no return: swap the address space. The new one must be
	// loaded before the old one is dropped, and the timer must not switch
	// threads in between
	{
		let _guard = crate::process::scheduler::PreemptGuard::new();
		let mut mem_space = proc.mem_space().lock();
		unsafe {
			image.mem_space.bind();
		}
		let old = core::mem::replace(&mut *mem_space, image.mem_space);
		drop(old);
	}
	proc.fds.lock().close_on_exec();
	if let Some(name) = argv.first() {
		proc.set_name(name);
	}
	Ok((image.entry, image.user_stack))
}
