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

//! Size-classed buckets.
//!
//! A bucket is one page holding a header followed by equal-size blocks
//! linked in a freelist. Block sizes are the powers of two from
//! [`MIN_BLOCK_SIZE`] to [`MAX_BLOCK_SIZE`]; a bucket is located from any of
//! its blocks by aligning the address down to the page boundary.
//!
//! Each free block carries a sentinel word, which catches double-frees.

use crate::{
	errno::{AllocError, AllocResult},
	memory,
	memory::{frame, PhysAddr, VirtAddr, PAGE_SIZE},
};
use core::ptr::{self, NonNull};

/// The smallest block size, which is also the guaranteed block alignment.
pub const MIN_BLOCK_SIZE: usize = 32;
/// The largest block size served by buckets. Larger allocations go straight
/// to the frame allocator.
pub const MAX_BLOCK_SIZE: usize = 2048;
/// The number of size classes.
pub const CLASS_COUNT: usize = (MAX_BLOCK_SIZE / MIN_BLOCK_SIZE).trailing_zeros() as usize + 1;

/// Value stored in free blocks to catch double-frees.
const FREE_SENTINEL: usize = 0x46524545;

/// Returns the size class index for an allocation of `size` bytes, if served
/// by buckets.
pub fn size_class(size: usize) -> Option<usize> {
	if size > MAX_BLOCK_SIZE {
		return None;
	}
	let size = size.max(MIN_BLOCK_SIZE).next_power_of_two();
	Some((size / MIN_BLOCK_SIZE).trailing_zeros() as usize)
}

/// Returns the block size of the given class.
pub fn class_size(class: usize) -> usize {
	MIN_BLOCK_SIZE << class
}

/// A free block, threaded through the bucket's freelist.
#[repr(C)]
struct FreeBlock {
	/// The next free block of the bucket.
	next: *mut FreeBlock,
	/// Must hold [`FREE_SENTINEL`] while the block is free.
	sentinel: usize,
}

/// Bucket header, at the beginning of the bucket's page.
#[repr(C)]
pub struct Bucket {
	/// The next bucket of the same class and pool.
	next: *mut Bucket,
	/// The previous bucket of the same class and pool.
	prev: *mut Bucket,
	/// The head of the freelist.
	free_list: *mut FreeBlock,
	/// The size class of the bucket.
	class: usize,
	/// The number of blocks currently allocated.
	used: usize,
}

/// The offset of the first block in a bucket.
const fn blocks_offset() -> usize {
	memory::up_align(core::mem::size_of::<Bucket>(), MIN_BLOCK_SIZE)
}

impl Bucket {
	/// Allocates a frame and formats it as a bucket of the given class, with
	/// every block free.
	pub fn create(class: usize) -> AllocResult<NonNull<Bucket>> {
		let frame = frame::alloc(PAGE_SIZE)?;
		let virt = frame.kernel_to_virtual().ok_or(AllocError)?;
		let bucket_ptr = virt.as_ptr::<Bucket>();
		let block_size = class_size(class);
		let capacity = (PAGE_SIZE - blocks_offset()) / block_size;
		debug_assert!(capacity > 0);
		unsafe {
			ptr::write(
				bucket_ptr,
				Bucket {
					next: ptr::null_mut(),
					prev: ptr::null_mut(),
					free_list: ptr::null_mut(),
					class,
					used: 0,
				},
			);
			// Thread every block through the freelist, last first so the
			// list ends up in address order
			for i in (0..capacity).rev() {
				let block = virt.as_ptr::<u8>().add(blocks_offset() + i * block_size);
				let block = block as *mut FreeBlock;
				(*block).next = (*bucket_ptr).free_list;
				(*block).sentinel = FREE_SENTINEL;
				(*bucket_ptr).free_list = block;
			}
		}
		Ok(unsafe { NonNull::new_unchecked(bucket_ptr) })
	}

	/// Returns the bucket containing the given block.
	///
	/// # Safety
	///
	/// The pointer must point inside a live bucket's block area.
	pub unsafe fn from_block(ptr: NonNull<u8>) -> NonNull<Bucket> {
		let page = memory::down_align(ptr.as_ptr() as usize, PAGE_SIZE);
		unsafe { NonNull::new_unchecked(page as *mut Bucket) }
	}

	/// Tells whether the bucket has a free block.
	pub fn has_free(&self) -> bool {
		!self.free_list.is_null()
	}

	/// Returns the next bucket of the class list.
	pub fn next_ptr(&self) -> *mut Bucket {
		self.next
	}

	/// Tells whether no block of the bucket is allocated.
	pub fn is_empty(&self) -> bool {
		self.used == 0
	}

	/// Returns the size class of the bucket.
	pub fn class(&self) -> usize {
		self.class
	}

	/// Pops a block off the freelist.
	pub fn alloc_block(&mut self) -> AllocResult<NonNull<u8>> {
		let block = NonNull::new(self.free_list).ok_or(AllocError)?;
		unsafe {
			self.free_list = block.as_ref().next;
			// The sentinel must not survive into live data
			(*block.as_ptr()).sentinel = 0;
		}
		self.used += 1;
		Ok(block.cast())
	}

	/// Returns a block to the freelist.
	///
	/// A block already carrying the free sentinel is rejected as a
	/// double-free.
	///
	/// # Safety
	///
	/// The block must have been returned by `alloc_block` on this bucket.
	pub unsafe fn free_block(&mut self, ptr: NonNull<u8>) {
		let block = ptr.cast::<FreeBlock>().as_ptr();
		unsafe {
			if (*block).sentinel == FREE_SENTINEL {
				log::error!("double free of heap block at {ptr:p}");
				return;
			}
			(*block).next = self.free_list;
			(*block).sentinel = FREE_SENTINEL;
		}
		self.free_list = block;
		self.used -= 1;
	}

	/// Unlinks the bucket from its class list. `head` is updated when the
	/// bucket is the head.
	pub fn unlink(&mut self, head: &mut *mut Bucket) {
		unsafe {
			if !self.prev.is_null() {
				(*self.prev).next = self.next;
			} else {
				*head = self.next;
			}
			if !self.next.is_null() {
				(*self.next).prev = self.prev;
			}
		}
		self.next = ptr::null_mut();
		self.prev = ptr::null_mut();
	}

	/// Links the bucket at the head of its class list.
	pub fn link(&mut self, head: &mut *mut Bucket) {
		self.next = *head;
		self.prev = ptr::null_mut();
		unsafe {
			if !(*head).is_null() {
				(**head).prev = self as *mut Bucket;
			}
		}
		*head = self as *mut Bucket;
	}

	/// Releases the bucket's frame. The bucket must be unlinked and empty.
	///
	/// # Safety
	///
	/// The bucket must not be accessed afterwards.
	pub unsafe fn destroy(bucket: NonNull<Bucket>) {
		debug_assert!(unsafe { bucket.as_ref() }.is_empty());
		let virt = VirtAddr(bucket.as_ptr() as usize);
		let phys = virt
			.kernel_to_physical()
			.unwrap_or(PhysAddr(0));
		frame::free(phys, PAGE_SIZE);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::testing;

	#[test]
	fn bucket_classes() {
		assert_eq!(size_class(1), Some(0));
		assert_eq!(size_class(32), Some(0));
		assert_eq!(size_class(33), Some(1));
		assert_eq!(size_class(2048), Some(CLASS_COUNT - 1));
		assert_eq!(size_class(2049), None);
		assert_eq!(class_size(0), 32);
		assert_eq!(class_size(CLASS_COUNT - 1), 2048);
	}

	#[test]
	fn bucket_alloc_free_cycle() {
		testing::init();
		let mut bucket_ptr = Bucket::create(1).unwrap();
		let bucket = unsafe { bucket_ptr.as_mut() };
		assert!(bucket.has_free());
		let a = bucket.alloc_block().unwrap();
		let b = bucket.alloc_block().unwrap();
		assert_ne!(a, b);
		// Blocks come out in address order and aligned to the class size
		assert!(a.as_ptr() < b.as_ptr());
		assert_eq!(a.as_ptr() as usize % MIN_BLOCK_SIZE, 0);
		assert_eq!(unsafe { Bucket::from_block(a) }, bucket_ptr);
		unsafe {
			bucket.free_block(a);
			bucket.free_block(b);
		}
		assert!(bucket.is_empty());
		unsafe {
			Bucket::destroy(bucket_ptr);
		}
	}

	#[test]
	fn bucket_exhaustion() {
		testing::init();
		let mut bucket_ptr = Bucket::create(CLASS_COUNT - 1).unwrap();
		let bucket = unsafe { bucket_ptr.as_mut() };
		let mut blocks = alloc::vec::Vec::new();
		while bucket.has_free() {
			blocks.push(bucket.alloc_block().unwrap());
		}
		assert!(bucket.alloc_block().is_err());
		for block in blocks {
			unsafe {
				bucket.free_block(block);
			}
		}
		assert!(bucket.is_empty());
		unsafe {
			Bucket::destroy(bucket_ptr);
		}
	}

	#[test]
	fn bucket_double_free_detected() {
		testing::init();
		let mut bucket_ptr = Bucket::create(0).unwrap();
		let bucket = unsafe { bucket_ptr.as_mut() };
		let a = bucket.alloc_block().unwrap();
		unsafe {
			bucket.free_block(a);
			let used_before = bucket.used;
			// The second free is refused and the counters stay consistent
			bucket.free_block(a);
			assert_eq!(bucket.used, used_before);
		}
		unsafe {
			Bucket::destroy(bucket_ptr);
		}
	}
}
