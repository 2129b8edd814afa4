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

//! Physically-backed kernel windows.
//!
//! Device registers and DMA buffers need a virtual window onto a fixed
//! physical range, usually with a specific caching policy. Those windows are
//! carved out of the kernel's own allocation range, above the linear window.

use crate::{
	errno::EResult,
	memory,
	memory::{
		vas::{Prot, Vas},
		vmem,
		vmem::CachePolicy,
		PhysAddr, VirtAddr, PAGE_SIZE,
	},
	sync::{IntMutex, OnceInit},
};

/// The kernel's virtual allocation range.
static KERNEL_VAS: OnceInit<IntMutex<Vas>> = OnceInit::new();

/// Initializes the kernel's virtual allocation range.
pub fn init() {
	// Keep the last 4 MiB out, so the top of the address space stays
	// unmapped and wild kernel pointers fault
	let end = VirtAddr(usize::MAX - (4 << 20) + 1);
	KERNEL_VAS.init(IntMutex::new(Vas::new(memory::KERNEL_VAS_BEGIN, end)));
}

/// Maps the physical range `[phys, phys + size)` into the kernel's
/// allocation range with the given caching policy and returns the window's
/// address.
pub fn map(phys: PhysAddr, size: usize, policy: CachePolicy) -> EResult<VirtAddr> {
	let phys = phys.down_align_page();
	let size = memory::up_align(size.max(1), PAGE_SIZE);
	let pages = size / PAGE_SIZE;
	let virt = KERNEL_VAS
		.lock()
		.alloc_at(phys, size, Prot::READ | Prot::WRITE | Prot::KERNEL)?;
	let flags = vmem::Flags::WRITE | vmem::Flags::GLOBAL | policy.to_flags();
	let res = vmem::kernel().lock().map_range(virt, phys, pages, flags);
	if let Err(e) = res {
		let _ = KERNEL_VAS.lock().free(virt, size);
		return Err(e);
	}
	Ok(virt)
}

/// Unmaps a window returned by [`map`].
pub fn unmap(virt: VirtAddr, size: usize) -> EResult<()> {
	let virt = virt.down_align_page();
	let size = memory::up_align(size.max(1), PAGE_SIZE);
	{
		let mut kernel_vmem = vmem::kernel().lock();
		for i in 0..size / PAGE_SIZE {
			// The backing is not owned by the window: no reference to drop
			let _ = kernel_vmem.unmap(virt + i * PAGE_SIZE)?;
		}
	}
	KERNEL_VAS.lock().free(virt, size)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::{frame, testing};

	#[test]
	fn mmio_window_round_trip() {
		testing::init();
		// Use real frames as the "device" range so the window can be probed
		let phys = frame::alloc(2 * PAGE_SIZE).unwrap();
		let virt = map(phys, 2 * PAGE_SIZE, CachePolicy::Uncached).unwrap();
		assert!(virt >= memory::KERNEL_VAS_BEGIN);
		{
			let kernel_vmem = vmem::kernel().lock();
			assert_eq!(kernel_vmem.translate(virt), Some(phys));
			assert_eq!(
				kernel_vmem.translate(virt + PAGE_SIZE),
				Some(phys + PAGE_SIZE)
			);
			let flags = kernel_vmem.entry_flags(virt).unwrap();
			assert!(flags.contains(vmem::Flags::CACHE_DISABLE));
		}
		unmap(virt, 2 * PAGE_SIZE).unwrap();
		assert_eq!(vmem::kernel().lock().translate(virt), None);
		frame::free(phys, 2 * PAGE_SIZE);
	}

	#[test]
	fn mmio_write_combining_fallback() {
		// Without the platform feature, write-combining falls back to
		// write-through
		let flags = CachePolicy::WriteCombining.to_flags();
		assert!(flags.contains(vmem::Flags::WRITE_THROUGH) || flags.contains(vmem::Flags::PAT));
	}
}
