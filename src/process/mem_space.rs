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

//! Process address spaces.
//!
//! A memory space ties together a virtual memory context (the page tables)
//! and a virtual address space allocator (the areas). Regions are reserved
//! first and backed lazily: the first touch of a page takes a fault, which
//! allocates and maps a frame according to the enclosing area's backing.
//!
//! Duplication for `fork` shallow-copies the page tables with copy-on-write
//! semantics and deep-copies the area metadata.

use crate::{
	errno::{AllocResult, EResult},
	memory,
	memory::{
		frame,
		vas::{Prot, Vas},
		vmem,
		vmem::{FaultCode, FaultOutcome, VMem},
		PhysAddr, VirtAddr, PAGE_SIZE,
	},
};

/// Translates area protection flags into paging flags.
pub fn prot_to_flags(prot: Prot) -> vmem::Flags {
	let mut flags = vmem::Flags::empty();
	if prot.contains(Prot::WRITE) {
		flags |= vmem::Flags::WRITE;
	}
	if !prot.contains(Prot::KERNEL) {
		flags |= vmem::Flags::USER;
	}
	flags
}

/// A process's address space.
pub struct MemSpace {
	/// The virtual memory context.
	vmem: VMem,
	/// The address space allocator over the process's range.
	vas: Vas,
}

impl MemSpace {
	/// Creates a new, empty address space with the kernel half aliased.
	pub fn new() -> AllocResult<Self> {
		Ok(Self {
			vmem: VMem::new()?,
			vas: Vas::new(memory::ALLOC_BEGIN, memory::PROCESS_END),
		})
	}

	/// Returns the identity of the address space for the CPU (the root page
	/// table).
	pub fn root(&self) -> PhysAddr {
		self.vmem.root()
	}

	/// Returns the address space allocator.
	pub fn vas(&self) -> &Vas {
		&self.vas
	}

	/// Reserves a region of `size` bytes, lazily backed by anonymous
	/// memory. See [`Vas::alloc`] for the hint semantics.
	pub fn map(&mut self, hint: VirtAddr, size: usize, prot: Prot) -> EResult<VirtAddr> {
		let addr = self.vas.alloc(hint, size, prot)?;
		Ok(addr)
	}

	/// Reserves a region of `size` bytes windowing the fixed physical range
	/// at `phys` (DMA-style mapping).
	pub fn map_phys(&mut self, phys: PhysAddr, size: usize, prot: Prot) -> EResult<VirtAddr> {
		self.vas.alloc_at(phys, size, prot)
	}

	/// Releases the region `[addr, addr + length)`: every mapped page is
	/// unmapped and its frame reference dropped, then the areas are freed
	/// and merged.
	pub fn unmap(&mut self, addr: VirtAddr, length: usize) -> EResult<()> {
		let addr = addr.down_align_page();
		let length = memory::up_align(length, PAGE_SIZE);
		for i in 0..length / PAGE_SIZE {
			if let Some(phys) = self.vmem.unmap(addr + i * PAGE_SIZE)? {
				frame::page_put(phys);
			}
		}
		self.vas.free(addr, length)
	}

	/// Translates an address of the space to the physical address it is
	/// currently mapped to.
	pub fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
		self.vmem.translate(addr)
	}

	/// Handles a page fault at `addr` with error code `code`.
	///
	/// Returns `true` if the fault was resolved and the faulting instruction
	/// can be resumed.
	pub fn fault(&mut self, addr: VirtAddr, code: FaultCode) -> bool {
		let page = addr.down_align_page();
		let Some(vma) = self.vas.find(addr) else {
			return false;
		};
		if !vma.is_allocated() {
			return false;
		}
		let prot = vma.flags();
		let offset = (page.0 - vma.begin().0) / PAGE_SIZE;
		let backing_frame = vma.backing_frame(offset);
		// The area's protection decides whether the access is legal at all
		if code.contains(FaultCode::WRITE) && !prot.contains(Prot::WRITE) {
			return false;
		}
		if code.contains(FaultCode::USER) && prot.contains(Prot::KERNEL) {
			return false;
		}
		match vmem::classify_fault(&mut self.vmem, page, code) {
			FaultOutcome::Resolved => true,
			FaultOutcome::Fatal => false,
			FaultOutcome::Lazy => {
				let clear = prot.contains(Prot::CLEAR_ON_FAULT);
				let flags = prot_to_flags(prot);
				self.map_missing(page, backing_frame, clear, flags).is_ok()
			}
		}
	}

	/// Backs the missing page at `page` with a frame: the area's fixed
	/// backing frame if any, or a freshly allocated one.
	fn map_missing(
		&mut self,
		page: VirtAddr,
		backing_frame: Option<PhysAddr>,
		clear: bool,
		flags: vmem::Flags,
	) -> EResult<()> {
		let phys = match backing_frame {
			Some(phys) => {
				frame::page_get(phys);
				phys
			}
			None => {
				let phys = frame::alloc(PAGE_SIZE)?;
				if clear {
					unsafe {
						memory::zero_frame(phys);
					}
				}
				phys
			}
		};
		let res = self.vmem.map(page, phys, flags);
		if res.is_err() {
			frame::page_put(phys);
		}
		res
	}

	/// Duplicates the space for `fork`: the new space shares every frame
	/// copy-on-write and carries a copy of the area metadata.
	pub fn fork(&mut self) -> AllocResult<Self> {
		Ok(Self {
			vmem: self.vmem.try_clone()?,
			vas: self.vas.duplicate(),
		})
	}

	/// Releases every mapping and area of the space, keeping it usable.
	pub fn clear(&mut self) {
		self.vmem.release_user();
		self.vas.clear();
	}

	/// Loads the space onto the CPU.
	///
	/// # Safety
	///
	/// The space must remain alive while it is loaded.
	pub unsafe fn bind(&self) {
		unsafe {
			self.vmem.bind();
		}
	}

	/// Tells whether the space is the one currently loaded.
	pub fn is_bound(&self) -> bool {
		self.vmem.is_bound()
	}
}

impl Drop for MemSpace {
	fn drop(&mut self) {
		// Destroying the loaded space panics in `VMem`'s drop
		self.vmem.release_user();
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::testing;

	/// A user-mode write fault on a missing page.
	const WRITE_MISS: FaultCode = FaultCode::WRITE.union(FaultCode::USER);
	/// A user-mode write fault on a present page.
	const WRITE_PROT: FaultCode = FaultCode::PRESENT
		.union(FaultCode::WRITE)
		.union(FaultCode::USER);

	/// Returns a pointer through the kernel window onto `addr` of the space.
	fn window(space: &MemSpace, addr: VirtAddr) -> *mut usize {
		space
			.translate(addr)
			.unwrap()
			.kernel_to_virtual()
			.unwrap()
			.as_ptr()
	}

	#[test]
	fn mem_space_lazy_backing() {
		testing::init();
		let mut space = MemSpace::new().unwrap();
		let addr = space
			.map(VirtAddr(0), 2 * PAGE_SIZE, Prot::READ | Prot::WRITE | Prot::CLEAR_ON_FAULT)
			.unwrap();
		// Nothing is mapped until the first touch
		assert_eq!(space.translate(addr), None);
		assert!(space.fault(addr, WRITE_MISS));
		let phys = space.translate(addr).unwrap();
		// The frame is zero-filled
		unsafe {
			assert_eq!(window(&space, addr).read(), 0);
		}
		assert_eq!(frame::allocator().lock().ref_count(phys), 1);
		// The second page is still unbacked
		assert_eq!(space.translate(addr + PAGE_SIZE), None);
	}

	#[test]
	fn mem_space_fault_outside_areas_is_fatal() {
		testing::init();
		let mut space = MemSpace::new().unwrap();
		assert!(!space.fault(VirtAddr(0x50000000), WRITE_MISS));
		// Write fault on a read-only area is fatal too
		let addr = space.map(VirtAddr(0), PAGE_SIZE, Prot::READ).unwrap();
		assert!(!space.fault(addr, WRITE_MISS));
	}

	#[test]
	fn mem_space_vma_merge_scenario() {
		// Allocate a, b, c, d, e; write through e; free in the order
		// b, d, c, a, e; the space must end with a single free area and all
		// frames released
		testing::init();
		let mut space = MemSpace::new().unwrap();
		let a = space.map(VirtAddr(0), PAGE_SIZE, Prot::READ).unwrap();
		let b = space.map(VirtAddr(0), 2 * PAGE_SIZE, Prot::READ).unwrap();
		let c = space.map(VirtAddr(0), PAGE_SIZE, Prot::READ).unwrap();
		let d = space
			.map(VirtAddr(0xb0000000), PAGE_SIZE, Prot::READ)
			.unwrap();
		let e = space
			.map(
				VirtAddr(0xa0000000),
				5 * PAGE_SIZE,
				Prot::READ | Prot::WRITE | Prot::CLEAR_ON_FAULT,
			)
			.unwrap();
		assert_eq!(e, VirtAddr(0xa0000000));
		// Write each page's own address into it, then read back
		let mut frames = alloc::vec::Vec::new();
		for i in 0..5 {
			let addr = e + i * PAGE_SIZE;
			assert!(space.fault(addr, WRITE_MISS));
			frames.push(space.translate(addr).unwrap());
			unsafe {
				window(&space, addr).write(addr.0);
			}
		}
		for i in 0..5 {
			let addr = e + i * PAGE_SIZE;
			unsafe {
				assert_eq!(window(&space, addr).read(), addr.0);
			}
		}
		space.unmap(b, 2 * PAGE_SIZE).unwrap();
		space.unmap(d, PAGE_SIZE).unwrap();
		space.unmap(c, PAGE_SIZE).unwrap();
		space.unmap(a, PAGE_SIZE).unwrap();
		space.unmap(e, 5 * PAGE_SIZE).unwrap();
		// One free area covering the whole range
		assert_eq!(space.vas().iter().count(), 1);
		assert_eq!(space.vas().iter_allocated().count(), 0);
		// Every frame went back to the pool
		for phys in frames {
			assert_eq!(frame::allocator().lock().ref_count(phys), 0);
		}
	}

	#[test]
	fn mem_space_cow_fork() {
		// The fork scenario: the child shares the parent's page until it
		// writes, after which the frames differ and contents diverge
		testing::init();
		let mut parent = MemSpace::new().unwrap();
		let v = parent
			.map(VirtAddr(0), PAGE_SIZE, Prot::READ | Prot::WRITE | Prot::CLEAR_ON_FAULT)
			.unwrap();
		assert!(parent.fault(v, WRITE_MISS));
		unsafe {
			window(&parent, v).write(0x42);
		}
		let mut child = parent.fork().unwrap();
		// The child reads the parent's value through the shared frame
		assert_eq!(parent.translate(v), child.translate(v));
		unsafe {
			assert_eq!(window(&child, v).read(), 0x42);
		}
		// The child writes: the fault un-shares the page
		assert!(child.fault(v, WRITE_PROT));
		let parent_frame = parent.translate(v).unwrap();
		let child_frame = child.translate(v).unwrap();
		assert_ne!(parent_frame, child_frame);
		unsafe {
			window(&child, v).write(0x69);
			assert_eq!(window(&child, v).read(), 0x69);
		}
		// The parent keeps observing the original content
		unsafe {
			assert_eq!(window(&parent, v).read(), 0x42);
		}
		// The parent's next write un-shares its own side; it is the last
		// owner so the frame stays
		assert!(parent.fault(v, WRITE_PROT));
		assert_eq!(parent.translate(v), Some(parent_frame));
	}

	#[test]
	fn mem_space_clear_releases_frames() {
		testing::init();
		let mut space = MemSpace::new().unwrap();
		let addr = space
			.map(VirtAddr(0), 3 * PAGE_SIZE, Prot::READ | Prot::WRITE)
			.unwrap();
		let mut frames = alloc::vec::Vec::new();
		for i in 0..3 {
			assert!(space.fault(addr + i * PAGE_SIZE, WRITE_MISS));
			frames.push(space.translate(addr + i * PAGE_SIZE).unwrap());
		}
		space.clear();
		assert_eq!(space.translate(addr), None);
		assert_eq!(space.vas().iter_allocated().count(), 0);
		for phys in frames {
			assert_eq!(frame::allocator().lock().ref_count(phys), 0);
		}
		// The space stays usable
		let addr = space.map(VirtAddr(0), PAGE_SIZE, Prot::READ | Prot::WRITE).unwrap();
		assert!(space.fault(addr, WRITE_MISS));
	}

	#[test]
	fn mem_space_phys_window() {
		testing::init();
		let mut space = MemSpace::new().unwrap();
		let phys = frame::alloc(2 * PAGE_SIZE).unwrap();
		let addr = space
			.map_phys(phys, 2 * PAGE_SIZE, Prot::READ | Prot::WRITE)
			.unwrap();
		assert!(space.fault(addr + PAGE_SIZE, WRITE_MISS));
		assert_eq!(space.translate(addr + PAGE_SIZE), Some(phys + PAGE_SIZE));
		// The window took its own reference on the frame
		assert_eq!(
			frame::allocator().lock().ref_count(phys + PAGE_SIZE),
			2
		);
		space.unmap(addr, 2 * PAGE_SIZE).unwrap();
		assert_eq!(frame::allocator().lock().ref_count(phys + PAGE_SIZE), 1);
		frame::free(phys, 2 * PAGE_SIZE);
	}
}
