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

//! Boot emulation for the host test harness.
//!
//! Tests share one global memory state, set up once: the memory map covers
//! the beginning of the test arena, the global frame allocator manages it
//! and the kernel-half page tables are built inside it. The remainder of the
//! arena is handed out to tests needing a private frame allocator.

use crate::{
	memory::{frame, memmap, vmem, PhysAddr, PAGE_SIZE},
	sync::Mutex,
};
use spin::Once;

/// The number of pages of the arena managed by the global frame allocator.
const GLOBAL_POOL_PAGES: usize = 4096;

static INIT: Once<()> = Once::new();

/// Initializes the global memory subsystems over the test arena. Idempotent.
pub fn init() {
	INIT.call_once(|| {
		memmap::test_arena::base();
		memmap::init_with(memmap::MemoryInfo::for_range(PhysAddr(0), GLOBAL_POOL_PAGES));
		unsafe {
			frame::init(memmap::get_info());
		}
		vmem::init().unwrap();
		vmem::init_kernel().unwrap();
		crate::memory::mmio::init();
	});
}

/// Cursor over the part of the arena reserved for private allocators.
static PRIVATE_POOL: Mutex<usize> = Mutex::new(GLOBAL_POOL_PAGES);

/// Returns a private frame allocator managing exactly `pages` frames,
/// backed by a fresh range of the arena.
pub fn new_allocator(pages: usize) -> frame::FrameAllocator {
	init();
	// Find the metadata size that fits the requested count
	let mut metadata_pages = 1;
	loop {
		let total = pages + metadata_pages;
		let needed = (total * frame::RECORD_SIZE).div_ceil(PAGE_SIZE);
		if needed <= metadata_pages {
			break;
		}
		metadata_pages = needed;
	}
	let total = pages + metadata_pages;
	let begin = {
		let mut cursor = PRIVATE_POOL.lock();
		let begin = *cursor;
		assert!(
			begin + total <= memmap::test_arena::ARENA_PAGES,
			"test arena exhausted"
		);
		*cursor += total;
		begin
	};
	let info = memmap::MemoryInfo::for_range(PhysAddr(begin * PAGE_SIZE), total);
	unsafe { frame::FrameAllocator::new(&info) }
}
