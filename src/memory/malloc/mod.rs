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

//! The kernel heap.
//!
//! Small allocations are served from size-classed buckets (see
//! [`bucket`]); larger or over-aligned ones go straight to the frame
//! allocator through the kernel window. Either way the heap never touches
//! the virtual address space allocator, so data structures of the latter can
//! live on the heap without recursion.
//!
//! The heap keeps two separate bucket pools: one for kernel-internal data
//! and one for blocks that end up exposed to userspace.

pub mod bucket;

use crate::{
	errno::{AllocError, AllocResult},
	memory,
	memory::{frame, VirtAddr, PAGE_SIZE},
	sync::IntMutex,
};
use bucket::Bucket;
use core::ptr::{self, NonNull};

pub use bucket::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// The pool an allocation belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Pool {
	/// Kernel-internal data.
	Kernel = 0,
	/// Blocks that get exposed to userspace.
	User = 1,
}

/// The kernel heap state: one bucket list per size class and pool.
pub struct Heap {
	/// Heads of the bucket lists, indexed by pool then class.
	classes: [[*mut Bucket; bucket::CLASS_COUNT]; 2],
}

// The raw list pointers are only reached through the heap's lock
unsafe impl Send for Heap {}

impl Heap {
	/// Creates an empty heap.
	pub const fn new() -> Self {
		Self {
			classes: [[ptr::null_mut(); bucket::CLASS_COUNT]; 2],
		}
	}

	/// Allocates a block of at least `size` bytes from the given pool.
	pub fn alloc(&mut self, size: usize, pool: Pool) -> AllocResult<NonNull<u8>> {
		let class = bucket::size_class(size).ok_or(AllocError)?;
		let head = &mut self.classes[pool as usize][class];
		// Find a bucket with a free block
		let mut cur = *head;
		unsafe {
			while !cur.is_null() {
				if (*cur).has_free() {
					return (*cur).alloc_block();
				}
				cur = (*cur).next_ptr();
			}
		}
		// No free block in the pool: create a bucket
		let mut new_bucket = Bucket::create(class)?;
		unsafe {
			new_bucket.as_mut().link(head);
			new_bucket.as_mut().alloc_block()
		}
	}

	/// Frees a block previously returned by [`Heap::alloc`] on this heap.
	///
	/// A bucket whose last block is freed is released.
	///
	/// # Safety
	///
	/// The block must come from this heap, with the same `pool`.
	pub unsafe fn free(&mut self, ptr: NonNull<u8>, pool: Pool) {
		let mut bucket_ptr = unsafe { Bucket::from_block(ptr) };
		let bucket = unsafe { bucket_ptr.as_mut() };
		unsafe {
			bucket.free_block(ptr);
		}
		if bucket.is_empty() {
			let head = &mut self.classes[pool as usize][bucket.class()];
			bucket.unlink(head);
			unsafe {
				Bucket::destroy(bucket_ptr);
			}
		}
	}
}

impl Default for Heap {
	fn default() -> Self {
		Self::new()
	}
}

/// The global kernel heap.
static HEAP: IntMutex<Heap> = IntMutex::new(Heap::new());

/// Allocates `size` bytes from the given pool of the global heap.
///
/// The returned block is aligned on [`MIN_BLOCK_SIZE`] and **not**
/// initialized.
pub fn alloc(size: usize, pool: Pool) -> AllocResult<NonNull<u8>> {
	if size > MAX_BLOCK_SIZE {
		return alloc_large(size);
	}
	HEAP.lock().alloc(size, pool)
}

/// Frees a block returned by [`alloc`] with the same `size` and `pool`.
///
/// # Safety
///
/// The block must not be used afterwards.
pub unsafe fn free(ptr: NonNull<u8>, size: usize, pool: Pool) {
	if size > MAX_BLOCK_SIZE {
		unsafe {
			free_large(ptr, size);
		}
		return;
	}
	unsafe {
		HEAP.lock().free(ptr, pool);
	}
}

/// Serves a large allocation with whole frames through the kernel window.
fn alloc_large(size: usize) -> AllocResult<NonNull<u8>> {
	let phys = frame::alloc(size)?;
	let virt = phys.kernel_to_virtual().ok_or(AllocError)?;
	Ok(unsafe { NonNull::new_unchecked(virt.as_ptr()) })
}

/// Releases a large allocation.
unsafe fn free_large(ptr: NonNull<u8>, size: usize) {
	if let Some(phys) = VirtAddr(ptr.as_ptr() as usize).kernel_to_physical() {
		frame::free(phys, size);
	}
}

/// The heap as the global allocator for `alloc` collections.
pub struct KernelAllocator;

unsafe impl core::alloc::GlobalAlloc for KernelAllocator {
	unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
		let size = layout.size().max(1);
		let res = if layout.align() <= MIN_BLOCK_SIZE && size <= MAX_BLOCK_SIZE {
			alloc(size, Pool::Kernel)
		} else if layout.align() <= PAGE_SIZE {
			alloc_large(memory::up_align(size, PAGE_SIZE))
		} else {
			Err(AllocError)
		};
		res.map(NonNull::as_ptr).unwrap_or(ptr::null_mut())
	}

	unsafe fn dealloc(&self, ptr: *mut u8, layout: core::alloc::Layout) {
		let Some(ptr) = NonNull::new(ptr) else {
			return;
		};
		let size = layout.size().max(1);
		unsafe {
			if layout.align() <= MIN_BLOCK_SIZE && size <= MAX_BLOCK_SIZE {
				free(ptr, size, Pool::Kernel);
			} else {
				free_large(ptr, memory::up_align(size, PAGE_SIZE));
			}
		}
	}
}

/// On the kernel target, the bucket heap backs every `alloc` collection.
#[cfg(all(target_arch = "x86", not(test)))]
#[global_allocator]
static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::testing;

	#[test]
	fn heap_small_alloc() {
		testing::init();
		let mut heap = Heap::new();
		let a = heap.alloc(17, Pool::Kernel).unwrap();
		let b = heap.alloc(17, Pool::Kernel).unwrap();
		assert_ne!(a, b);
		// Same class blocks come from the same bucket page
		assert_eq!(
			a.as_ptr() as usize / PAGE_SIZE,
			b.as_ptr() as usize / PAGE_SIZE
		);
		unsafe {
			heap.free(a, Pool::Kernel);
			heap.free(b, Pool::Kernel);
		}
	}

	#[test]
	fn heap_pools_are_separate() {
		testing::init();
		let mut heap = Heap::new();
		let a = heap.alloc(64, Pool::Kernel).unwrap();
		let b = heap.alloc(64, Pool::User).unwrap();
		assert_ne!(
			a.as_ptr() as usize / PAGE_SIZE,
			b.as_ptr() as usize / PAGE_SIZE
		);
		unsafe {
			heap.free(a, Pool::Kernel);
			heap.free(b, Pool::User);
		}
	}

	#[test]
	fn heap_bucket_released_when_empty() {
		testing::init();
		let mut heap = Heap::new();
		let class = bucket::size_class(128).unwrap();
		let a = heap.alloc(128, Pool::Kernel).unwrap();
		assert!(!heap.classes[Pool::Kernel as usize][class].is_null());
		unsafe {
			heap.free(a, Pool::Kernel);
		}
		// The last block was freed: the bucket is unlinked and its frame
		// released
		assert!(heap.classes[Pool::Kernel as usize][class].is_null());
	}

	#[test]
	fn heap_large_alloc_uses_frames() {
		testing::init();
		let a = alloc_large(3 * PAGE_SIZE).unwrap();
		// The block is page-aligned and writable through the window
		assert_eq!(a.as_ptr() as usize % PAGE_SIZE, 0);
		unsafe {
			a.as_ptr().write_bytes(0xaa, 3 * PAGE_SIZE);
			free_large(a, 3 * PAGE_SIZE);
		}
	}
}
