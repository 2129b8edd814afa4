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

//! The block device page cache.
//!
//! Device content is cached in page-sized entries, each covering
//! `PAGE_SIZE / block_size` contiguous blocks and keyed by the index of the
//! first. Writes only touch the cache and raise the entry's dirty flag; a
//! dedicated kernel thread periodically walks the global list of cached
//! pages and writes the dirty ones back.

use crate::{
	errno::EResult,
	memory::{
		frame,
		frame::FrameFlags,
		PhysAddr, PAGE_SIZE,
	},
	sync::Mutex,
	time,
};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::{
	slice,
	sync::atomic::{
		AtomicBool,
		Ordering::{Acquire, Release},
	},
};

use super::BlkDev;

/// The interval between two writeback cycles, in milliseconds.
pub const WRITEBACK_INTERVAL_MS: u64 = 1000;

/// One cached, page-sized run of device blocks.
pub struct CachedPage {
	/// The identifier of the owning device.
	dev_id: usize,
	/// The index of the first block covered.
	first_block: u64,
	/// The frame holding the data.
	frame: PhysAddr,
	/// Raised when the cache content is newer than the device's.
	dirty: AtomicBool,
}

impl CachedPage {
	/// Returns the buffer held by the entry.
	///
	/// # Safety
	///
	/// The caller must hold the owning cache's lock to avoid concurrent
	/// access to the buffer.
	#[allow(clippy::mut_from_ref)]
	unsafe fn buf(&self) -> &mut [u8] {
		let virt = self.frame.kernel_to_virtual().unwrap();
		unsafe { slice::from_raw_parts_mut(virt.as_ptr(), PAGE_SIZE) }
	}

	/// Tells whether the entry has pending writes.
	pub fn is_dirty(&self) -> bool {
		self.dirty.load(Acquire)
	}
}

impl Drop for CachedPage {
	fn drop(&mut self) {
		frame::free(self.frame, PAGE_SIZE);
	}
}

/// The global list of cached pages, walked by the writeback thread.
/// Entries keep the owning device alive so flushing needs no lookup.
static ALL_PAGES: Mutex<Vec<(Arc<CachedPage>, Arc<BlkDev>)>> = Mutex::new(Vec::new());

/// A device's page cache.
pub struct PageCache {
	/// Cached entries, keyed by first covered block.
	pages: Mutex<BTreeMap<u64, Arc<CachedPage>>>,
}

impl PageCache {
	/// Creates an empty cache.
	pub fn new() -> Self {
		Self {
			pages: Mutex::new(BTreeMap::new()),
		}
	}

	/// Returns the entry covering `block`, reading it from the device if
	/// not cached yet.
	pub fn get(&self, dev: &Arc<BlkDev>, block: u64) -> EResult<Arc<CachedPage>> {
		let blocks_per_page = (PAGE_SIZE / dev.block_size()) as u64;
		let first_block = block - block % blocks_per_page;
		let mut pages = self.pages.lock();
		if let Some(page) = pages.get(&first_block) {
			return Ok(page.clone());
		}
		// Cache miss: read the run of blocks into a fresh frame
		let phys = frame::alloc(PAGE_SIZE)?;
		frame::allocator().lock().add_flags(phys, FrameFlags::FILE_BACKED);
		let page = Arc::new(CachedPage {
			dev_id: dev.id,
			first_block,
			frame: phys,
			dirty: AtomicBool::new(false),
		});
		let res = unsafe { dev.ops().read_blocks(first_block, page.buf()) };
		if let Err(e) = res {
			return Err(e);
		}
		pages.insert(first_block, page.clone());
		ALL_PAGES.lock().push((page.clone(), dev.clone()));
		Ok(page)
	}

	/// Reads `buf.len()` bytes at byte offset `off` of the device, through
	/// the cache.
	pub fn read(&self, dev: &Arc<BlkDev>, off: u64, buf: &mut [u8]) -> EResult<()> {
		let bs = dev.block_size() as u64;
		let mut done = 0;
		while done < buf.len() {
			let cur = off + done as u64;
			let page = self.get(dev, cur / bs)?;
			let page_off = (cur % PAGE_SIZE as u64) as usize;
			let len = (buf.len() - done).min(PAGE_SIZE - page_off);
			let pages = self.pages.lock();
			buf[done..done + len]
				.copy_from_slice(unsafe { &page.buf()[page_off..page_off + len] });
			drop(pages);
			done += len;
		}
		Ok(())
	}

	/// Writes `buf` at byte offset `off` of the device, through the cache.
	/// Touched entries are marked dirty; the device is updated at the next
	/// writeback.
	pub fn write(&self, dev: &Arc<BlkDev>, off: u64, buf: &[u8]) -> EResult<()> {
		let bs = dev.block_size() as u64;
		let mut done = 0;
		while done < buf.len() {
			let cur = off + done as u64;
			let page = self.get(dev, cur / bs)?;
			let page_off = (cur % PAGE_SIZE as u64) as usize;
			let len = (buf.len() - done).min(PAGE_SIZE - page_off);
			let pages = self.pages.lock();
			unsafe {
				page.buf()[page_off..page_off + len].copy_from_slice(&buf[done..done + len]);
			}
			drop(pages);
			page.dirty.store(true, Release);
			done += len;
		}
		Ok(())
	}
}

impl Default for PageCache {
	fn default() -> Self {
		Self::new()
	}
}

/// Writes every dirty cached page back to its device.
///
/// An I/O error leaves the entry dirty, so the next cycle retries it.
pub fn sync_all() {
	let pages = ALL_PAGES.lock().clone();
	for (page, dev) in pages {
		if !page.is_dirty() {
			continue;
		}
		let _guard = dev.cache().pages.lock();
		let res = unsafe { dev.ops().write_blocks(page.first_block, page.buf()) };
		match res {
			Ok(()) => page.dirty.store(false, Release),
			Err(e) => {
				log::error!(
					"writeback failed on device {} block {}: {e}",
					page.dev_id,
					page.first_block
				);
			}
		}
	}
}

/// Release hook for file-backed frames: a frame belonging to a cached page
/// stays under the cache's ownership instead of returning to the pool.
fn release_hook(frame: PhysAddr) -> bool {
	ALL_PAGES
		.lock()
		.iter()
		.any(|(page, _)| page.frame == frame)
}

/// Initializes the cache layer: hooks file-backed frame release into the
/// frame allocator and spawns the writeback thread, which flushes dirty
/// pages every [`WRITEBACK_INTERVAL_MS`].
pub fn init() -> EResult<()> {
	frame::allocator().lock().set_release_hook(release_hook);
	let thread = crate::process::thread::Thread::new_kernel(alloc::boxed::Box::new(|| loop {
		time::sleep_for(WRITEBACK_INTERVAL_MS);
		sync_all();
	}))?;
	crate::process::scheduler::add_thread(thread);
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::{
		device::{self, ramdisk::RamDisk},
		memory::testing,
	};
	use alloc::format;
	use core::sync::atomic::{AtomicUsize, Ordering::Relaxed};

	fn new_disk(name: &str) -> Arc<BlkDev> {
		static COUNTER: AtomicUsize = AtomicUsize::new(0);
		let unique = COUNTER.fetch_add(1, Relaxed);
		device::register_blk(
			format!("{name}{unique}"),
			Arc::new(RamDisk::new(512, 64).unwrap()),
		)
		.unwrap()
	}

	#[test]
	fn cache_one_entry_per_run() {
		testing::init();
		let dev = new_disk("cachedisk");
		// Blocks 0 and 7 share a page (8 blocks of 512 per page); block 8
		// does not
		let a = dev.cache().get(&dev, 0).unwrap();
		let b = dev.cache().get(&dev, 7).unwrap();
		let c = dev.cache().get(&dev, 8).unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		assert!(!Arc::ptr_eq(&a, &c));
	}

	#[test]
	fn cache_writeback_cycle() {
		// The writeback scenario: a write is visible through the cache
		// immediately, reaches the device only after a flush cycle
		testing::init();
		let dev = new_disk("wbdisk");
		let payload = [0xab_u8; 512];
		dev.write(0, &payload).unwrap();
		// Visible through the cache
		let mut buf = [0_u8; 512];
		dev.read(0, &mut buf).unwrap();
		assert_eq!(buf, payload);
		// Not on the device yet
		let mut direct = [0_u8; 512];
		dev.ops().read_blocks(0, &mut direct).unwrap();
		assert_eq!(direct, [0; 512]);
		// After the flush, the device matches
		sync_all();
		dev.ops().read_blocks(0, &mut direct).unwrap();
		assert_eq!(direct, payload);
		// The entry is clean again
		let page = dev.cache().get(&dev, 0).unwrap();
		assert!(!page.is_dirty());
	}

	#[test]
	fn cache_read_populates_from_device() {
		testing::init();
		let dev = new_disk("readdisk");
		let payload = [0x11_u8; 1024];
		dev.ops().write_blocks(16, &payload).unwrap();
		let mut buf = [0_u8; 1024];
		dev.read(16 * 512, &mut buf).unwrap();
		assert_eq!(buf, payload);
	}

	#[test]
	fn cache_frames_are_file_backed() {
		testing::init();
		let dev = new_disk("fbdisk");
		let page = dev.cache().get(&dev, 0).unwrap();
		assert_eq!(frame::allocator().lock().ref_count(page.frame), 1);
	}
}
