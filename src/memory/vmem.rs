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

//! Virtual memory contexts.
//!
//! A [`VMem`] is the handle on one address space's page tables. The kernel
//! half of every context aliases a single set of tables, built once at boot,
//! which linearly map physical memory (the kernel window).

use crate::{
	arch::x86::paging,
	errno,
	errno::{AllocResult, EResult},
	memory,
	memory::{frame, PhysAddr, VirtAddr, PAGE_SIZE},
	sync::OnceInit,
};

pub use crate::arch::x86::paging::{FaultCode, Flags};

/// The caching policy of a mapping.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CachePolicy {
	/// Writes are cached and flushed later.
	#[default]
	WriteBack,
	/// Writes go through the cache to memory immediately.
	WriteThrough,
	/// No caching at all.
	Uncached,
	/// Writes are combined before being committed. Falls back to
	/// write-through when the platform lacks the feature.
	WriteCombining,
}

impl CachePolicy {
	/// Returns the paging flags selecting the policy.
	pub fn to_flags(self) -> Flags {
		match self {
			Self::WriteBack => Flags::empty(),
			Self::WriteThrough => Flags::WRITE_THROUGH,
			Self::Uncached => Flags::CACHE_DISABLE,
			Self::WriteCombining => {
				if has_write_combining() {
					Flags::PAT
				} else {
					Flags::WRITE_THROUGH
				}
			}
		}
	}
}

/// Tells whether the platform supports write-combining through the PAT.
fn has_write_combining() -> bool {
	#[cfg(all(target_arch = "x86", not(test)))]
	unsafe {
		let edx: u32;
		core::arch::asm!(
			"push ebx",
			"mov eax, 1",
			"cpuid",
			"pop ebx",
			out("eax") _,
			out("ecx") _,
			out("edx") edx,
		);
		edx & (1 << 16) != 0
	}
	#[cfg(not(all(target_arch = "x86", not(test))))]
	false
}

/// The kernel-half page tables, shared by every context.
static KERNEL_TABLES: OnceInit<[PhysAddr; paging::ENTRIES_PER_TABLE - paging::USER_DIR_ENTRIES]> =
	OnceInit::new();

/// Initializes the kernel-half page tables, which linearly map physical
/// memory into the kernel window.
///
/// Must be called once, after the frame allocator is initialized.
pub fn init() -> AllocResult<()> {
	const KERNEL_ENTRIES: usize = paging::ENTRIES_PER_TABLE - paging::USER_DIR_ENTRIES;
	let mut tables = [PhysAddr(0); KERNEL_ENTRIES];
	for (i, table_frame) in tables.iter_mut().enumerate() {
		let table = paging::alloc_table()?;
		let entries = unsafe { paging::table_mut(table) };
		// Fill the linear mapping for the 4 MiB block this table covers. The
		// tables above the window are left empty for the kernel's own
		// allocation range
		let block_base = i * paging::ENTRIES_PER_TABLE * PAGE_SIZE;
		if block_base < memory::KERNEL_WINDOW_SIZE {
			for (j, entry) in entries.iter_mut().enumerate() {
				let phys = PhysAddr(block_base + j * PAGE_SIZE);
				*entry = paging::to_entry(phys, Flags::PRESENT | Flags::WRITE | Flags::GLOBAL);
			}
		}
		*table_frame = table;
	}
	KERNEL_TABLES.init(tables);
	Ok(())
}

/// The kernel's own virtual memory context, built at boot. Mapping into its
/// kernel half is visible in every address space, since kernel tables are
/// shared.
static KERNEL_VMEM: OnceInit<crate::sync::IntMutex<VMem>> = OnceInit::new();

/// Initializes the kernel's virtual memory context.
pub fn init_kernel() -> AllocResult<()> {
	KERNEL_VMEM.init(crate::sync::IntMutex::new(VMem::new()?));
	Ok(())
}

/// Returns the kernel's virtual memory context.
pub fn kernel() -> &'static crate::sync::IntMutex<VMem> {
	&KERNEL_VMEM
}

/// A virtual memory context.
///
/// Dropping a context frees its tables. Dropping the currently loaded
/// context is an integrity violation and panics.
#[derive(Debug)]
pub struct VMem {
	/// The physical address of the page directory.
	dir: PhysAddr,
}

impl VMem {
	/// Creates a new context with the kernel half aliased and the user half
	/// empty.
	pub fn new() -> AllocResult<Self> {
		let dir_frame = paging::alloc_table()?;
		let dir = unsafe { paging::table_mut(dir_frame) };
		let kernel_tables = &*KERNEL_TABLES;
		for (i, table) in kernel_tables.iter().enumerate() {
			dir[paging::USER_DIR_ENTRIES + i] =
				paging::to_entry(*table, Flags::PRESENT | Flags::WRITE | Flags::GLOBAL);
		}
		Ok(Self {
			dir: dir_frame,
		})
	}

	/// Returns the physical address of the page directory, which is the
	/// identity of the address space for the CPU.
	pub fn root(&self) -> PhysAddr {
		self.dir
	}

	/// Returns a mutable reference to the page directory.
	fn dir_mut(&mut self) -> &mut paging::Table {
		unsafe { paging::table_mut(self.dir) }
	}

	/// Returns an immutable reference to the page directory.
	fn dir(&self) -> &paging::Table {
		unsafe { paging::table_mut(self.dir) }
	}

	/// Maps one page at the virtual address `virt` to the frame at `phys`.
	///
	/// An unaligned address or an already mapped page is refused with
	/// `EINVAL`/`EEXIST`.
	pub fn map(&mut self, virt: VirtAddr, phys: PhysAddr, flags: Flags) -> EResult<()> {
		if !virt.is_aligned_to(PAGE_SIZE) || !phys.is_aligned_to(PAGE_SIZE) {
			return Err(errno!(EINVAL));
		}
		paging::map_page(self.dir_mut(), virt, phys, flags)?;
		self.invalidate_page(virt);
		Ok(())
	}

	/// Maps `pages` consecutive pages starting at `virt` to the consecutive
	/// frames starting at `phys`.
	///
	/// On failure, the pages mapped by the call so far are rolled back.
	pub fn map_range(
		&mut self,
		virt: VirtAddr,
		phys: PhysAddr,
		pages: usize,
		flags: Flags,
	) -> EResult<()> {
		for i in 0..pages {
			let res = self.map(virt + i * PAGE_SIZE, phys + i * PAGE_SIZE, flags);
			if let Err(e) = res {
				for j in 0..i {
					let _ = self.unmap(virt + j * PAGE_SIZE);
				}
				return Err(e);
			}
		}
		Ok(())
	}

	/// Unmaps the page at `virt` and returns the frame it was mapped to, or
	/// `None` if no page was mapped there.
	pub fn unmap(&mut self, virt: VirtAddr) -> EResult<Option<PhysAddr>> {
		let virt = virt.down_align_page();
		let phys = paging::unmap_page(self.dir_mut(), virt)?;
		self.invalidate_page(virt);
		Ok(phys)
	}

	/// Translates the virtual address `virt` into the physical address it is
	/// mapped to, page offset included.
	pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
		paging::translate(self.dir(), virt)
	}

	/// Returns the paging flags of the entry mapping `virt`, if present.
	pub fn entry_flags(&self, virt: VirtAddr) -> Option<Flags> {
		paging::entry_flags_at(self.dir(), virt)
	}

	/// Clones the context for address space duplication.
	///
	/// Userspace entries are shallow-copied: both contexts end up sharing
	/// every frame read-only, tagged copy-on-write (see
	/// [`paging::clone_dir`]). Kernel entries are aliased.
	pub fn try_clone(&mut self) -> AllocResult<Self> {
		let dir = paging::clone_dir(self.dir_mut())?;
		// The source lost write access on its pages
		self.flush();
		Ok(Self {
			dir,
		})
	}

	/// Resolves a write fault at `virt` by duplicating the copy-on-write
	/// state on its path.
	///
	/// Returns `EPERM` when the fault targets a genuinely read-only page.
	pub fn resolve_cow(&mut self, virt: VirtAddr) -> EResult<()> {
		paging::resolve_cow(self.dir_mut(), virt)?;
		self.invalidate_page(virt);
		Ok(())
	}

	/// Releases every userspace mapping, dropping one reference per mapped
	/// frame. The context remains usable.
	pub fn release_user(&mut self) {
		paging::release_user(self.dir_mut());
		self.flush();
	}

	/// Loads the context onto the CPU.
	///
	/// # Safety
	///
	/// The context must map the kernel image and the current stack.
	pub unsafe fn bind(&self) {
		if !self.is_bound() {
			unsafe {
				paging::load_dir(self.dir);
			}
		}
	}

	/// Tells whether the context is the one currently loaded.
	pub fn is_bound(&self) -> bool {
		paging::current_dir() == self.dir
	}

	/// Invalidates the TLB entry of the page at `virt`, if the context is
	/// loaded.
	pub fn invalidate_page(&self, virt: VirtAddr) {
		if self.is_bound() {
			paging::invlpg(virt);
		}
	}

	/// Flushes the TLB, if the context is loaded.
	pub fn flush(&self) {
		if self.is_bound() {
			paging::flush_tlb();
		}
	}
}

impl Drop for VMem {
	fn drop(&mut self) {
		if self.is_bound() {
			panic!("dropping a virtual memory context while it is loaded");
		}
		// Drop the references held on user page tables. Frames mapped under
		// them must have been released beforehand
		let dir = self.dir_mut();
		for di in 0..paging::USER_DIR_ENTRIES {
			let entry = dir[di];
			if paging::entry_flags(entry).contains(Flags::PRESENT) {
				frame::page_put(paging::entry_addr(entry));
			}
		}
		frame::free(self.dir, PAGE_SIZE);
	}
}

/// Outcome of the page fault state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
	/// The fault was resolved; the faulting instruction can be resumed.
	Resolved,
	/// The fault must be handled by the address space's lazy-backing path.
	Lazy,
	/// The access is a genuine violation.
	Fatal,
}

/// Classifies a page fault from its error code, resolving copy-on-write
/// faults on the spot.
///
/// This is the state machine of the fault path: a non-present fault is
/// delegated to the address space (lazy backing), a write fault on a present
/// page goes through copy-on-write resolution, anything else is fatal.
pub fn classify_fault(vmem: &mut VMem, virt: VirtAddr, code: FaultCode) -> FaultOutcome {
	if !code.contains(FaultCode::PRESENT) {
		return FaultOutcome::Lazy;
	}
	if code.contains(FaultCode::WRITE) {
		match vmem.resolve_cow(virt.down_align_page()) {
			Ok(()) => FaultOutcome::Resolved,
			Err(_) => FaultOutcome::Fatal,
		}
	} else {
		FaultOutcome::Fatal
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::testing;

	/// Returns a pointer into the kernel window for the given frame.
	fn window<T>(phys: PhysAddr) -> *mut T {
		phys.kernel_to_virtual().unwrap().as_ptr()
	}

	#[test]
	fn vmem_map_translate_unmap() {
		testing::init();
		let mut vmem = VMem::new().unwrap();
		let frame = frame::alloc(PAGE_SIZE).unwrap();
		let virt = VirtAddr(0x40000000);
		vmem.map(virt, frame, Flags::WRITE | Flags::USER).unwrap();
		assert_eq!(vmem.translate(virt), Some(frame));
		assert_eq!(vmem.translate(virt + 42), Some(frame + 42));
		assert_eq!(vmem.translate(virt + PAGE_SIZE), None);
		// Double mapping is refused
		assert_eq!(
			vmem.map(virt, frame, Flags::WRITE | Flags::USER),
			Err(errno!(EEXIST))
		);
		// Unaligned mapping is refused
		assert_eq!(
			vmem.map(VirtAddr(0x40001234), frame, Flags::WRITE),
			Err(errno!(EINVAL))
		);
		let unmapped = vmem.unmap(virt).unwrap();
		assert_eq!(unmapped, Some(frame));
		assert_eq!(vmem.translate(virt), None);
		assert_eq!(vmem.unmap(virt).unwrap(), None);
		frame::free(frame, PAGE_SIZE);
	}

	#[test]
	fn vmem_map_range() {
		testing::init();
		let mut vmem = VMem::new().unwrap();
		let frames = frame::alloc(4 * PAGE_SIZE).unwrap();
		let virt = VirtAddr(0x50000000);
		vmem.map_range(virt, frames, 4, Flags::WRITE).unwrap();
		for i in 0..4 {
			assert_eq!(
				vmem.translate(virt + i * PAGE_SIZE),
				Some(frames + i * PAGE_SIZE)
			);
		}
		for i in 0..4 {
			let phys = vmem.unmap(virt + i * PAGE_SIZE).unwrap().unwrap();
			frame::free(phys, PAGE_SIZE);
		}
	}

	#[test]
	fn vmem_kernel_window_mapped() {
		testing::init();
		let vmem = VMem::new().unwrap();
		// The linear mapping resolves kernelspace addresses to their offset
		let virt = memory::KERNEL_BEGIN + 5 * PAGE_SIZE + 3;
		assert_eq!(vmem.translate(virt), Some(PhysAddr(5 * PAGE_SIZE + 3)));
	}

	#[test]
	fn vmem_clone_shares_frames() {
		testing::init();
		let mut parent = VMem::new().unwrap();
		let frame_addr = frame::alloc(PAGE_SIZE).unwrap();
		let virt = VirtAddr(0x60000000);
		parent
			.map(virt, frame_addr, Flags::WRITE | Flags::USER)
			.unwrap();
		unsafe {
			window::<u8>(frame_addr).write(0x42);
		}
		let mut child = parent.try_clone().unwrap();
		// Both spaces translate to the same frame
		assert_eq!(parent.translate(virt), child.translate(virt));
		assert_eq!(frame::allocator().lock().ref_count(frame_addr), 2);
		// Both sides lost write access
		assert!(!parent.entry_flags(virt).unwrap().contains(Flags::WRITE));
		assert!(parent
			.entry_flags(virt)
			.unwrap()
			.contains(Flags::COPY_ON_WRITE));
		child.release_user();
		assert_eq!(frame::allocator().lock().ref_count(frame_addr), 1);
		parent.release_user();
		assert_eq!(frame::allocator().lock().ref_count(frame_addr), 0);
	}

	#[test]
	fn vmem_copy_on_write_unshares() {
		testing::init();
		let mut parent = VMem::new().unwrap();
		let frame_addr = frame::alloc(PAGE_SIZE).unwrap();
		let virt = VirtAddr(0x70000000);
		parent
			.map(virt, frame_addr, Flags::WRITE | Flags::USER)
			.unwrap();
		unsafe {
			window::<u8>(frame_addr).write(0x42);
		}
		let mut child = parent.try_clone().unwrap();
		// The child takes a write fault
		child.resolve_cow(virt).unwrap();
		let parent_frame = parent.translate(virt).unwrap();
		let child_frame = child.translate(virt).unwrap();
		assert_ne!(parent_frame, child_frame);
		// The child's copy carries the original content, then diverges
		unsafe {
			assert_eq!(window::<u8>(child_frame).read(), 0x42);
			window::<u8>(child_frame).write(0x69);
			assert_eq!(window::<u8>(parent_frame).read(), 0x42);
		}
		// The parent in turn resolves its own fault; it is the last owner so
		// no copy happens
		parent.resolve_cow(virt).unwrap();
		assert_eq!(parent.translate(virt), Some(frame_addr));
		assert!(parent.entry_flags(virt).unwrap().contains(Flags::WRITE));
		child.release_user();
		parent.release_user();
	}

	#[test]
	fn vmem_cow_write_to_readonly_is_perm() {
		testing::init();
		let mut vmem = VMem::new().unwrap();
		let frame_addr = frame::alloc(PAGE_SIZE).unwrap();
		let virt = VirtAddr(0x7f000000);
		vmem.map(virt, frame_addr, Flags::USER).unwrap();
		assert_eq!(vmem.resolve_cow(virt), Err(errno!(EPERM)));
		assert_eq!(
			classify_fault(
				&mut vmem,
				virt,
				FaultCode::PRESENT | FaultCode::WRITE | FaultCode::USER
			),
			FaultOutcome::Fatal
		);
		vmem.release_user();
	}

	#[test]
	fn fault_state_machine() {
		testing::init();
		let mut vmem = VMem::new().unwrap();
		// Non-present faults are delegated to lazy backing
		assert_eq!(
			classify_fault(&mut vmem, VirtAddr(0x40000000), FaultCode::USER),
			FaultOutcome::Lazy
		);
		// Read access on a present page faulting is fatal
		assert_eq!(
			classify_fault(
				&mut vmem,
				VirtAddr(0x40000000),
				FaultCode::PRESENT | FaultCode::USER
			),
			FaultOutcome::Fatal
		);
	}
}
