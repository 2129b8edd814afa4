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

//! Physical memory map information.
//!
//! This module digests the bootloader-provided memory map into the single
//! main block of allocatable physical memory, which the frame allocator then
//! manages. These data are collected once at boot and never change.

use crate::{
	memory,
	memory::{PhysAddr, PAGE_SIZE},
	multiboot,
	sync::OnceInit,
};

/// The maximum number of pre-reserved regions (bootloader modules).
pub const RESERVED_MAX: usize = 8;

/// Information on the system's physical memory.
#[derive(Debug, Default)]
pub struct MemoryInfo {
	/// The beginning of the main block of allocatable physical memory,
	/// page-aligned.
	pub phys_main_begin: PhysAddr,
	/// The size of the main block in pages.
	pub phys_main_pages: usize,

	/// The physical range covered by the kernel image, page-aligned.
	pub kernel_begin: PhysAddr,
	/// Exclusive end of the kernel image.
	pub kernel_end: PhysAddr,

	/// Pre-reserved ranges inside the main block (bootloader modules).
	reserved: [(PhysAddr, PhysAddr); RESERVED_MAX],
	/// The number of valid entries in `reserved`.
	reserved_len: usize,
}

impl MemoryInfo {
	/// Builds information for a bare range without reservations.
	#[cfg(test)]
	pub(crate) fn for_range(begin: PhysAddr, pages: usize) -> Self {
		Self {
			phys_main_begin: begin,
			phys_main_pages: pages,
			..Default::default()
		}
	}

	/// Returns the pre-reserved ranges inside the main block.
	pub fn reserved(&self) -> &[(PhysAddr, PhysAddr)] {
		&self.reserved[..self.reserved_len]
	}

	/// Tells whether the given frame belongs to the kernel image.
	pub fn is_kernel_frame(&self, frame: PhysAddr) -> bool {
		frame >= self.kernel_begin && frame < self.kernel_end
	}
}

/// The memory map information.
static MEM_INFO: OnceInit<MemoryInfo> = OnceInit::new();

/// Returns the memory map information.
pub fn get_info() -> &'static MemoryInfo {
	&MEM_INFO
}

/// Initializes the memory information with an already built structure.
#[cfg(test)]
pub(crate) fn init_with(info: MemoryInfo) {
	MEM_INFO.init(info);
}

/// Builds memory information from the boot information structure and the
/// kernel image's physical placement.
///
/// The main block is the largest usable region of the memory map, clamped to
/// what the kernel window can reach. Anything below the end of the kernel
/// image is kept out of the allocatable range.
pub fn init(boot_info: &multiboot::BootInfo, kernel_end: PhysAddr) {
	let mut info = MemoryInfo {
		kernel_begin: memory::KERNEL_PHYS_BEGIN.down_align_page(),
		kernel_end: PhysAddr(memory::up_align(kernel_end.0, PAGE_SIZE)),
		..Default::default()
	};
	// Find the largest usable region
	let mut best: Option<(u64, u64)> = None;
	for entry in boot_info.memory_map() {
		if !entry.is_usable() {
			continue;
		}
		let begin = entry.addr;
		let end = entry.addr + entry.len;
		if best.map(|(b, e)| e - b).unwrap_or(0) < end - begin {
			best = Some((begin, end));
		}
	}
	if let Some((begin, end)) = best {
		// Clamp to the kernel window and to 32-bit physical addresses
		let window_end = (memory::KERNEL_WINDOW_SIZE as u64).min(u32::MAX as u64 + 1);
		let begin = begin.max(info.kernel_end.0 as u64).min(window_end);
		let end = end.min(window_end);
		if begin < end {
			let begin = memory::up_align(begin as usize, PAGE_SIZE);
			let end = memory::down_align(end as usize, PAGE_SIZE);
			info.phys_main_begin = PhysAddr(begin);
			info.phys_main_pages = end.saturating_sub(begin) / PAGE_SIZE;
		}
	}
	// Record modules as pre-reserved ranges
	for module in boot_info.modules() {
		if info.reserved_len >= RESERVED_MAX {
			break;
		}
		let begin = module.start.down_align_page();
		let end = PhysAddr(memory::up_align(module.end.0, PAGE_SIZE));
		info.reserved[info.reserved_len] = (begin, end);
		info.reserved_len += 1;
	}
	MEM_INFO.init(info);
}

/// Logs the memory map.
pub fn print_entries(boot_info: &multiboot::BootInfo) {
	log::debug!("--- Memory mapping ---");
	for entry in boot_info.memory_map() {
		let begin = entry.addr;
		let end = begin + entry.len;
		log::debug!("- {begin:08x} {end:08x} {}", entry.type_string());
	}
}

/// A heap-backed stand-in for physical memory, used by the host test
/// harness.
///
/// "Physical" addresses are offsets into a leaked, page-aligned arena; the
/// kernel window conversions in [`crate::memory`] resolve into it. This
/// keeps the frame allocator, the paging controller and the page cache
/// operating on real, dereferenceable memory during tests.
#[cfg(test)]
pub mod test_arena {
	use crate::memory::{PhysAddr, VirtAddr, PAGE_SIZE};
	use core::alloc::Layout;
	use spin::Once;

	/// The size of the arena in pages.
	pub const ARENA_PAGES: usize = 8192;

	static ARENA_BASE: Once<usize> = Once::new();

	/// Returns the base address of the arena, allocating it on first use.
	pub fn base() -> usize {
		*ARENA_BASE.call_once(|| {
			let layout = Layout::from_size_align(ARENA_PAGES * PAGE_SIZE, PAGE_SIZE).unwrap();
			let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
			assert!(!ptr.is_null());
			ptr as usize
		})
	}

	/// Window conversion: arena offset to host address.
	pub fn to_virtual(phys: PhysAddr) -> Option<VirtAddr> {
		(phys.0 < ARENA_PAGES * PAGE_SIZE).then(|| VirtAddr(base() + phys.0))
	}

	/// Window conversion: host address to arena offset.
	pub fn to_physical(virt: VirtAddr) -> Option<PhysAddr> {
		virt.0
			.checked_sub(base())
			.filter(|off| *off < ARENA_PAGES * PAGE_SIZE)
			.map(PhysAddr)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn arena_round_trip() {
		let phys = PhysAddr(5 * PAGE_SIZE + 12);
		let virt = phys.kernel_to_virtual().unwrap();
		assert_eq!(virt.kernel_to_physical(), Some(phys));
		assert!(PhysAddr(test_arena::ARENA_PAGES * PAGE_SIZE)
			.kernel_to_virtual()
			.is_none());
	}
}
