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

//! Physical page frame allocation.
//!
//! The allocator owns every page of the main block of physical memory. Each
//! frame carries a reference count: a frame may be shared by several mappings
//! (copy-on-write) or held by the page cache, and is returned to the pool
//! only when the last reference is dropped.
//!
//! The metadata array is carved from the beginning of the main block itself
//! at initialization, so the allocator does not depend on any other
//! allocator.

use crate::{
	errno::{AllocError, AllocResult},
	memory,
	memory::{memmap, PhysAddr, PAGE_SIZE},
	sync::{IntMutex, OnceInit},
};
use core::{mem::size_of, ptr, slice};

bitflags::bitflags! {
	/// Frame state flags.
	#[derive(Clone, Copy, Debug, Eq, PartialEq)]
	pub struct FrameFlags: u8 {
		/// The frame is free for allocation.
		const AVAILABLE = 0b001;
		/// The frame is shared between address spaces pending duplication.
		const COPY_ON_WRITE = 0b010;
		/// The frame belongs to the page cache of a file or block device.
		const FILE_BACKED = 0b100;
	}
}

/// The size of one frame metadata record, exposed for sizing computations.
#[cfg(test)]
pub(crate) const RECORD_SIZE: usize = size_of::<Frame>();

/// Metadata of one physical page frame.
struct Frame {
	/// The number of references to the frame. Zero if and only if available.
	ref_count: u32,
	/// State flags.
	flags: FrameFlags,
}

/// Hook called when the last reference to a file-backed frame is dropped.
///
/// Returns `true` if the page cache took ownership of the frame.
pub type ReleaseHook = fn(PhysAddr) -> bool;

/// The physical page frame allocator.
pub struct FrameAllocator {
	/// The address of the first managed frame.
	begin: PhysAddr,
	/// One record per managed frame.
	frames: &'static mut [Frame],
	/// Index of the first available frame, kept as a search cursor.
	first_available: usize,
	/// The number of frames currently allocated.
	used: usize,
	/// The release hook for file-backed frames.
	release_hook: Option<ReleaseHook>,
}

impl FrameAllocator {
	/// Creates an allocator managing the main block described by `info`.
	///
	/// The frame metadata is placed at the beginning of the block; frames
	/// covered by a pre-reserved range are marked unavailable.
	///
	/// # Safety
	///
	/// The main block must be unused memory, reachable through the kernel
	/// window.
	pub unsafe fn new(info: &memmap::MemoryInfo) -> Self {
		let total_pages = info.phys_main_pages;
		let metadata_bytes = total_pages * size_of::<Frame>();
		let metadata_pages = memory::page_count(metadata_bytes);
		let managed = total_pages.saturating_sub(metadata_pages);
		let begin = info.phys_main_begin + metadata_pages * PAGE_SIZE;
		// Initialize the metadata array
		let metadata_virt = info
			.phys_main_begin
			.kernel_to_virtual()
			.expect("main memory block outside of the kernel window");
		let frames = unsafe {
			let ptr = metadata_virt.as_ptr::<Frame>();
			for i in 0..managed {
				ptr::write(
					ptr.add(i),
					Frame {
						ref_count: 0,
						flags: FrameFlags::AVAILABLE,
					},
				);
			}
			slice::from_raw_parts_mut(ptr, managed)
		};
		let mut allocator = Self {
			begin,
			frames,
			first_available: 0,
			used: 0,
			release_hook: None,
		};
		// Withdraw pre-reserved ranges (bootloader modules)
		for (res_begin, res_end) in info.reserved() {
			let first = res_begin.0.saturating_sub(begin.0) / PAGE_SIZE;
			let last = res_end.0.saturating_sub(begin.0).div_ceil(PAGE_SIZE);
			for i in first..last.min(allocator.frames.len()) {
				if allocator.frames[i].flags.contains(FrameFlags::AVAILABLE) {
					allocator.frames[i].flags.remove(FrameFlags::AVAILABLE);
					allocator.frames[i].ref_count = 1;
					allocator.used += 1;
				}
			}
		}
		allocator.first_available = allocator.find_available(0).unwrap_or(allocator.frames.len());
		allocator
	}

	/// Registers the release hook for file-backed frames.
	pub fn set_release_hook(&mut self, hook: ReleaseHook) {
		self.release_hook = Some(hook);
	}

	/// Returns the index of the frame at the given address, if managed.
	fn index_of(&self, frame: PhysAddr) -> Option<usize> {
		let off = frame.0.checked_sub(self.begin.0)?;
		let idx = off / PAGE_SIZE;
		(idx < self.frames.len()).then_some(idx)
	}

	/// Returns the address of the frame at index `idx`.
	fn addr_of(&self, idx: usize) -> PhysAddr {
		self.begin + idx * PAGE_SIZE
	}

	/// Returns the index of the first available frame at or after `from`.
	fn find_available(&self, from: usize) -> Option<usize> {
		(from..self.frames.len()).find(|i| self.frames[*i].flags.contains(FrameFlags::AVAILABLE))
	}

	/// Allocates a contiguous run of frames large enough to store `size`
	/// bytes and returns the address of the first.
	///
	/// Each allocated frame starts with a reference count of `1`.
	///
	/// The search is linear first-fit, starting at the first-available
	/// cursor.
	pub fn alloc(&mut self, size: usize) -> AllocResult<PhysAddr> {
		let pages = memory::page_count(size.max(1));
		let mut i = self.first_available;
		while let Some(start) = self.find_available(i) {
			// Measure the run of available frames from `start`
			let mut len = 1;
			while len < pages
				&& start + len < self.frames.len()
				&& self.frames[start + len].flags.contains(FrameFlags::AVAILABLE)
			{
				len += 1;
			}
			if len >= pages {
				for frame in &mut self.frames[start..start + pages] {
					frame.flags.remove(FrameFlags::AVAILABLE);
					frame.ref_count = 1;
				}
				self.used += pages;
				if start == self.first_available {
					self.first_available = self
						.find_available(start + pages)
						.unwrap_or(self.frames.len());
				}
				return Ok(self.addr_of(start));
			}
			i = start + len;
		}
		Err(AllocError)
	}

	/// Allocates a single zero-filled frame.
	pub fn alloc_zeroed(&mut self) -> AllocResult<PhysAddr> {
		let frame = self.alloc(PAGE_SIZE)?;
		unsafe {
			memory::zero_frame(frame);
		}
		Ok(frame)
	}

	/// Drops one reference on each frame of the run covering `size` bytes at
	/// `frame`; each is returned to the pool when its count reaches zero.
	pub fn free(&mut self, frame: PhysAddr, size: usize) {
		let pages = memory::page_count(size.max(1));
		for i in 0..pages {
			self.page_put(frame + i * PAGE_SIZE);
		}
	}

	/// Takes a new reference on the given frame.
	pub fn page_get(&mut self, frame: PhysAddr) {
		let Some(idx) = self.index_of(frame.down_align_page()) else {
			return;
		};
		let frame = &mut self.frames[idx];
		debug_assert!(!frame.flags.contains(FrameFlags::AVAILABLE));
		frame.ref_count += 1;
	}

	/// Drops a reference on the given frame, releasing it if this was the
	/// last one. A file-backed frame is handed to the owning cache instead
	/// of being freed.
	///
	/// Returns `true` if the frame was released.
	///
	/// Freeing a frame of the kernel image is refused.
	pub fn page_put(&mut self, frame: PhysAddr) -> bool {
		let frame = frame.down_align_page();
		if memmap::get_info().is_kernel_frame(frame) {
			log::error!("refusing to free a kernel image frame at {frame:?}");
			return false;
		}
		let Some(idx) = self.index_of(frame) else {
			return false;
		};
		let record = &mut self.frames[idx];
		if record.flags.contains(FrameFlags::AVAILABLE) || record.ref_count == 0 {
			log::error!("double free of frame at {frame:?}");
			return false;
		}
		record.ref_count -= 1;
		if record.ref_count > 0 {
			// The frame is no longer shared once a single reference remains
			if record.ref_count == 1 {
				record.flags.remove(FrameFlags::COPY_ON_WRITE);
			}
			return false;
		}
		if record.flags.contains(FrameFlags::FILE_BACKED) {
			if let Some(hook) = self.release_hook {
				// Keep a reference on behalf of the cache
				record.ref_count = 1;
				if hook(frame) {
					return false;
				}
				record.ref_count = 0;
			}
			record.flags.remove(FrameFlags::FILE_BACKED);
		}
		record.flags = FrameFlags::AVAILABLE;
		self.used -= 1;
		self.first_available = self.first_available.min(idx);
		true
	}

	/// Returns the number of references on the given frame.
	pub fn ref_count(&self, frame: PhysAddr) -> u32 {
		self.index_of(frame.down_align_page())
			.map(|idx| self.frames[idx].ref_count)
			.unwrap_or(0)
	}

	/// Tells whether the given frame is referenced more than once.
	pub fn is_shared(&self, frame: PhysAddr) -> bool {
		self.ref_count(frame) > 1
	}

	/// Adds the given flags on the frame's record.
	pub fn add_flags(&mut self, frame: PhysAddr, flags: FrameFlags) {
		if let Some(idx) = self.index_of(frame.down_align_page()) {
			self.frames[idx].flags.insert(flags & !FrameFlags::AVAILABLE);
		}
	}

	/// Returns the total and used number of frames.
	pub fn stats(&self) -> (usize, usize) {
		(self.frames.len(), self.used)
	}
}

/// The global frame allocator.
static FRAME_ALLOCATOR: OnceInit<IntMutex<FrameAllocator>> = OnceInit::new();

/// Initializes the global frame allocator from the memory map information.
///
/// # Safety
///
/// The main block described by the memory map must be unused.
pub unsafe fn init(info: &memmap::MemoryInfo) {
	let allocator = unsafe { FrameAllocator::new(info) };
	let (total, used) = allocator.stats();
	log::info!(
		"physical memory: {} KiB managed, {} KiB reserved",
		total * PAGE_SIZE / 1024,
		used * PAGE_SIZE / 1024
	);
	FRAME_ALLOCATOR.init(IntMutex::new(allocator));
}

/// Returns the global frame allocator.
pub fn allocator() -> &'static IntMutex<FrameAllocator> {
	&FRAME_ALLOCATOR
}

/// Allocates a contiguous run of frames storing `size` bytes.
pub fn alloc(size: usize) -> AllocResult<PhysAddr> {
	FRAME_ALLOCATOR.lock().alloc(size)
}

/// Allocates a single zero-filled frame.
pub fn alloc_zeroed() -> AllocResult<PhysAddr> {
	FRAME_ALLOCATOR.lock().alloc_zeroed()
}

/// Frees a run of frames covering `size` bytes.
pub fn free(frame: PhysAddr, size: usize) {
	FRAME_ALLOCATOR.lock().free(frame, size);
}

/// Takes a new reference on the given frame.
pub fn page_get(frame: PhysAddr) {
	FRAME_ALLOCATOR.lock().page_get(frame);
}

/// Drops a reference on the given frame.
pub fn page_put(frame: PhysAddr) -> bool {
	FRAME_ALLOCATOR.lock().page_put(frame)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::testing;

	#[test]
	fn frame_alloc_free() {
		testing::init();
		let mut alloc = testing::new_allocator(64);
		let (total, used0) = alloc.stats();
		assert_eq!(total, 64);
		let a = alloc.alloc(PAGE_SIZE).unwrap();
		let b = alloc.alloc(3 * PAGE_SIZE).unwrap();
		assert!(a.is_aligned_to(PAGE_SIZE));
		assert_eq!(alloc.stats().1, used0 + 4);
		assert_eq!(alloc.ref_count(a), 1);
		alloc.free(a, PAGE_SIZE);
		assert_eq!(alloc.ref_count(a), 0);
		alloc.free(b, 3 * PAGE_SIZE);
		assert_eq!(alloc.stats().1, used0);
	}

	#[test]
	fn frame_first_fit_reuses_lowest() {
		testing::init();
		let mut alloc = testing::new_allocator(32);
		let a = alloc.alloc(PAGE_SIZE).unwrap();
		let _b = alloc.alloc(PAGE_SIZE).unwrap();
		alloc.free(a, PAGE_SIZE);
		// The cursor is pulled back on free, so the hole is reused
		let c = alloc.alloc(PAGE_SIZE).unwrap();
		assert_eq!(c, a);
	}

	#[test]
	fn frame_contiguous_run() {
		testing::init();
		let mut alloc = testing::new_allocator(16);
		let a = alloc.alloc(PAGE_SIZE).unwrap();
		let b = alloc.alloc(PAGE_SIZE).unwrap();
		assert_eq!(b.0, a.0 + PAGE_SIZE);
		alloc.free(a, PAGE_SIZE);
		// A two-page run does not fit in the single-page hole
		let c = alloc.alloc(2 * PAGE_SIZE).unwrap();
		assert!(c.0 > a.0);
	}

	#[test]
	fn frame_refcount_sharing() {
		testing::init();
		let mut alloc = testing::new_allocator(8);
		let a = alloc.alloc(PAGE_SIZE).unwrap();
		alloc.page_get(a);
		assert!(alloc.is_shared(a));
		assert!(!alloc.page_put(a));
		assert!(!alloc.is_shared(a));
		assert!(alloc.page_put(a));
		assert_eq!(alloc.ref_count(a), 0);
	}

	#[test]
	fn frame_oom() {
		testing::init();
		let mut alloc = testing::new_allocator(4);
		assert!(alloc.alloc(5 * PAGE_SIZE).is_err());
		let _a = alloc.alloc(4 * PAGE_SIZE).unwrap();
		assert!(alloc.alloc(PAGE_SIZE).is_err());
	}
}
