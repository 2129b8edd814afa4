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

//! x86 two-level paging structures.
//!
//! Each address space is a page directory of 1024 entries, each pointing to a
//! page table of 1024 entries, each mapping a 4 KiB page. An entry holds the
//! physical address of its target together with flags in the low 12 bits,
//! which works because targets are page-aligned.
//!
//! Tables are reached through the kernel window, so they can be manipulated
//! without being the currently loaded address space.
//!
//! The copy-on-write state is kept in an ignored entry bit: on address space
//! duplication, writable entries lose their write bit and gain the
//! copy-on-write bit, at both the page and the page table level. The write
//! fault path then un-shares the minimum amount of memory.

use crate::{
	errno,
	errno::{AllocResult, EResult},
	memory,
	memory::{frame, PhysAddr, VirtAddr, PAGE_SIZE},
};
use core::ptr;

/// The number of entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;
/// The number of page directory entries covering userspace.
///
/// The remaining entries cover kernelspace and are shared by all address
/// spaces.
pub const USER_DIR_ENTRIES: usize = memory::PROCESS_END.0 / (ENTRIES_PER_TABLE * PAGE_SIZE);

/// A page directory or page table.
pub type Table = [u32; ENTRIES_PER_TABLE];

/// Mask of the flag bits in an entry.
const FLAGS_MASK: u32 = 0xfff;
/// Mask of the address bits in an entry.
const ADDR_MASK: u32 = !FLAGS_MASK;

bitflags::bitflags! {
	/// Paging entry flags.
	#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
	pub struct Flags: u32 {
		/// The entry is present.
		const PRESENT = 1 << 0;
		/// The page can be written.
		const WRITE = 1 << 1;
		/// The page can be accessed from userspace.
		const USER = 1 << 2;
		/// Write-through caching.
		const WRITE_THROUGH = 1 << 3;
		/// Caching disabled.
		const CACHE_DISABLE = 1 << 4;
		/// The page has been accessed (set by the CPU).
		const ACCESSED = 1 << 5;
		/// The page has been written (set by the CPU).
		const DIRTY = 1 << 6;
		/// Page attribute table bit, selecting write-combining when the PAT
		/// is programmed.
		const PAT = 1 << 7;
		/// The TLB entry survives an address space switch.
		const GLOBAL = 1 << 8;
		/// The target is pending duplication on write (ignored by the CPU).
		const COPY_ON_WRITE = 1 << 9;
	}
}

bitflags::bitflags! {
	/// Page fault error code bits.
	#[derive(Clone, Copy, Debug, Eq, PartialEq)]
	pub struct FaultCode: u32 {
		/// The fault was caused by a present entry.
		const PRESENT = 1 << 0;
		/// The fault was caused by a write access.
		const WRITE = 1 << 1;
		/// The fault happened in user mode.
		const USER = 1 << 2;
		/// A reserved bit was set in an entry.
		const RESERVED = 1 << 3;
		/// The fault was caused by an instruction fetch.
		const INSTRUCTION = 1 << 4;
	}
}

/// Builds an entry from a target address and flags.
#[inline]
pub fn to_entry(addr: PhysAddr, flags: Flags) -> u32 {
	debug_assert!(addr.is_aligned_to(PAGE_SIZE));
	addr.0 as u32 | (flags.bits() & FLAGS_MASK)
}

/// Returns the target address of an entry.
#[inline]
pub fn entry_addr(entry: u32) -> PhysAddr {
	PhysAddr((entry & ADDR_MASK) as usize)
}

/// Returns the flags of an entry.
#[inline]
pub fn entry_flags(entry: u32) -> Flags {
	Flags::from_bits_truncate(entry & FLAGS_MASK)
}

/// Returns the page directory index for the given virtual address.
#[inline]
pub fn dir_index(addr: VirtAddr) -> usize {
	(addr.0 >> 22) & 0x3ff
}

/// Returns the page table index for the given virtual address.
#[inline]
pub fn table_index(addr: VirtAddr) -> usize {
	(addr.0 >> 12) & 0x3ff
}

/// Allocates a zero-filled frame to hold a table.
pub fn alloc_table() -> AllocResult<PhysAddr> {
	frame::alloc_zeroed()
}

/// Returns a mutable reference to the table at the given physical address.
///
/// # Safety
///
/// The address must point to a valid table and the caller must have exclusive
/// access to it.
pub unsafe fn table_mut<'a>(addr: PhysAddr) -> &'a mut Table {
	let virt = addr
		.kernel_to_virtual()
		.expect("page table outside of the kernel window");
	unsafe { &mut *virt.as_ptr::<Table>() }
}

/// Copies the content of the page at `src` into the page at `dst`.
///
/// # Safety
///
/// Both frames must be valid and inside the kernel window.
unsafe fn copy_page(src: PhysAddr, dst: PhysAddr) {
	let src = src.kernel_to_virtual().unwrap().as_ptr::<u8>();
	let dst = dst.kernel_to_virtual().unwrap().as_ptr::<u8>();
	unsafe {
		ptr::copy_nonoverlapping(src, dst, PAGE_SIZE);
	}
}

/// If the page table at directory index `di` is copy-on-write, un-shares it:
/// a shared table is duplicated and the directory entry is swapped for the
/// private copy; a table with a single owner only gets its write access
/// restored.
///
/// Does nothing if the entry is absent or not copy-on-write.
pub fn break_table_cow(dir: &mut Table, di: usize) -> AllocResult<()> {
	let entry = dir[di];
	let flags = entry_flags(entry);
	if !flags.contains(Flags::PRESENT) || !flags.contains(Flags::COPY_ON_WRITE) {
		return Ok(());
	}
	let table_frame = entry_addr(entry);
	let new_flags = (flags | Flags::WRITE) - Flags::COPY_ON_WRITE;
	let shared = frame::allocator().lock().is_shared(table_frame);
	if shared {
		let new_frame = alloc_table()?;
		unsafe {
			copy_page(table_frame, new_frame);
		}
		frame::page_put(table_frame);
		dir[di] = to_entry(new_frame, new_flags);
	} else {
		dir[di] = to_entry(table_frame, new_flags);
	}
	Ok(())
}

/// Maps the page at `virt` to the frame at `phys` in the given directory.
///
/// A page table is allocated if needed. Mapping over an already present page
/// is refused.
pub fn map_page(dir: &mut Table, virt: VirtAddr, phys: PhysAddr, flags: Flags) -> EResult<()> {
	let di = dir_index(virt);
	// Mapping a new page into a shared table must not alter the sibling space
	break_table_cow(dir, di)?;
	let dir_entry = dir[di];
	let table_frame = if entry_flags(dir_entry).contains(Flags::PRESENT) {
		entry_addr(dir_entry)
	} else {
		let table_frame = alloc_table()?;
		// Protection is enforced at the page level
		let table_flags = Flags::PRESENT | Flags::WRITE | Flags::USER;
		dir[di] = to_entry(table_frame, table_flags);
		table_frame
	};
	let table = unsafe { table_mut(table_frame) };
	let ti = table_index(virt);
	if entry_flags(table[ti]).contains(Flags::PRESENT) {
		return Err(errno!(EEXIST));
	}
	table[ti] = to_entry(phys, (flags & !Flags::COPY_ON_WRITE) | Flags::PRESENT);
	Ok(())
}

/// Unmaps the page at `virt`, returning the frame it was mapped to, or `None`
/// if the page was not present.
///
/// If the containing page table is copy-on-write, it is un-shared first. An
/// emptied page table is released.
pub fn unmap_page(dir: &mut Table, virt: VirtAddr) -> AllocResult<Option<PhysAddr>> {
	let di = dir_index(virt);
	let dir_entry = dir[di];
	if !entry_flags(dir_entry).contains(Flags::PRESENT) {
		return Ok(None);
	}
	break_table_cow(dir, di)?;
	let table_frame = entry_addr(dir[di]);
	let table = unsafe { table_mut(table_frame) };
	let ti = table_index(virt);
	if !entry_flags(table[ti]).contains(Flags::PRESENT) {
		return Ok(None);
	}
	let phys = entry_addr(table[ti]);
	table[ti] = 0;
	// Release the table when it no longer holds any mapping
	let empty = table.iter().all(|e| !entry_flags(*e).contains(Flags::PRESENT));
	if empty && di < USER_DIR_ENTRIES {
		dir[di] = 0;
		frame::page_put(table_frame);
	}
	Ok(Some(phys))
}

/// Resolves the deepest entry mapping `virt`, if any.
fn resolve(dir: &Table, virt: VirtAddr) -> Option<u32> {
	let dir_entry = dir[dir_index(virt)];
	if !entry_flags(dir_entry).contains(Flags::PRESENT) {
		return None;
	}
	let table = unsafe { table_mut(entry_addr(dir_entry)) };
	let entry = table[table_index(virt)];
	entry_flags(entry).contains(Flags::PRESENT).then_some(entry)
}

/// Translates the virtual address `virt` to the physical address it is
/// mapped to, keeping the page offset.
pub fn translate(dir: &Table, virt: VirtAddr) -> Option<PhysAddr> {
	let entry = resolve(dir, virt)?;
	Some(entry_addr(entry) + (virt.0 & (PAGE_SIZE - 1)))
}

/// Returns the flags of the entry mapping `virt`, if present.
pub fn entry_flags_at(dir: &Table, virt: VirtAddr) -> Option<Flags> {
	resolve(dir, virt).map(entry_flags)
}

/// Shallow-copies every userspace entry of `src` into a fresh directory and
/// returns it.
///
/// Every writable page and page table becomes read-only and copy-on-write in
/// **both** directories, and the frames' reference counts are incremented
/// accordingly. Kernel entries are aliased.
pub fn clone_dir(src: &mut Table) -> AllocResult<PhysAddr> {
	let dst_frame = alloc_table()?;
	let dst = unsafe { table_mut(dst_frame) };
	for di in 0..ENTRIES_PER_TABLE {
		let entry = src[di];
		let flags = entry_flags(entry);
		if !flags.contains(Flags::PRESENT) {
			continue;
		}
		if di >= USER_DIR_ENTRIES {
			// Kernel half: alias
			dst[di] = entry;
			continue;
		}
		let table_frame = entry_addr(entry);
		// The table is now referenced by both directories
		frame::page_get(table_frame);
		{
			let mut allocator = frame::allocator().lock();
			allocator.add_flags(table_frame, frame::FrameFlags::COPY_ON_WRITE);
		}
		// Tag every mapped page. The table is shared, so this write-protects
		// the source as well
		let table = unsafe { table_mut(table_frame) };
		for pte in table.iter_mut() {
			let pte_flags = entry_flags(*pte);
			if !pte_flags.contains(Flags::PRESENT) {
				continue;
			}
			let page_frame = entry_addr(*pte);
			let mut allocator = frame::allocator().lock();
			allocator.page_get(page_frame);
			if pte_flags.contains(Flags::WRITE) {
				allocator.add_flags(page_frame, frame::FrameFlags::COPY_ON_WRITE);
				*pte = to_entry(
					page_frame,
					(pte_flags | Flags::COPY_ON_WRITE) - Flags::WRITE,
				);
			}
		}
		// Write-protect the table at the directory level on both sides
		let cow_flags = if flags.contains(Flags::WRITE) {
			(flags | Flags::COPY_ON_WRITE) - Flags::WRITE
		} else {
			flags
		};
		let cow_entry = to_entry(table_frame, cow_flags);
		src[di] = cow_entry;
		dst[di] = cow_entry;
	}
	Ok(dst_frame)
}

/// Resolves a write fault at `virt` by un-sharing the copy-on-write state on
/// its path: first the page table, then the page itself.
///
/// Returns `EPERM` if the target page is genuinely read-only.
pub fn resolve_cow(dir: &mut Table, virt: VirtAddr) -> EResult<()> {
	let di = dir_index(virt);
	if !entry_flags(dir[di]).contains(Flags::PRESENT) {
		return Err(errno!(EPERM));
	}
	break_table_cow(dir, di)?;
	let table = unsafe { table_mut(entry_addr(dir[di])) };
	let ti = table_index(virt);
	let pte_flags = entry_flags(table[ti]);
	if !pte_flags.contains(Flags::PRESENT) {
		return Err(errno!(EPERM));
	}
	if !pte_flags.contains(Flags::COPY_ON_WRITE) {
		// Either already resolved by an earlier fault, or a true permission
		// violation
		return if pte_flags.contains(Flags::WRITE) {
			Ok(())
		} else {
			Err(errno!(EPERM))
		};
	}
	let old_frame = entry_addr(table[ti]);
	let new_flags = (pte_flags | Flags::WRITE) - Flags::COPY_ON_WRITE;
	let shared = frame::allocator().lock().is_shared(old_frame);
	if shared {
		let new_frame = frame::alloc(PAGE_SIZE)?;
		unsafe {
			copy_page(old_frame, new_frame);
		}
		frame::page_put(old_frame);
		table[ti] = to_entry(new_frame, new_flags);
	} else {
		table[ti] = to_entry(old_frame, new_flags);
	}
	Ok(())
}

/// Releases every userspace mapping of the directory: a reference is dropped
/// on each mapped frame and on each page table.
///
/// Shared tables are left untouched apart from the dropped reference, since
/// sibling address spaces may still use them.
pub fn release_user(dir: &mut Table) {
	for di in 0..USER_DIR_ENTRIES {
		let entry = dir[di];
		if !entry_flags(entry).contains(Flags::PRESENT) {
			continue;
		}
		let table_frame = entry_addr(entry);
		let table = unsafe { table_mut(table_frame) };
		for pte in table.iter() {
			if entry_flags(*pte).contains(Flags::PRESENT) {
				frame::page_put(entry_addr(*pte));
			}
		}
		frame::page_put(table_frame);
		dir[di] = 0;
	}
}

/// Invalidates the TLB entry for the page at `virt`.
#[inline]
pub fn invlpg(virt: VirtAddr) {
	#[cfg(all(target_arch = "x86", not(test)))]
	unsafe {
		core::arch::asm!("invlpg [{}]", in(reg) virt.0);
	}
	#[cfg(not(all(target_arch = "x86", not(test))))]
	let _ = virt;
}

/// Flushes the whole TLB, except global entries.
#[inline]
pub fn flush_tlb() {
	#[cfg(all(target_arch = "x86", not(test)))]
	unsafe {
		core::arch::asm!(
			"mov {tmp}, cr3",
			"mov cr3, {tmp}",
			tmp = out(reg) _,
		);
	}
}

/// Loads the directory at the given physical address into `cr3`, enabling
/// paging if not already enabled.
///
/// # Safety
///
/// The directory must map the kernel's code, data and stack at their current
/// virtual addresses.
pub unsafe fn load_dir(dir: PhysAddr) {
	#[cfg(all(target_arch = "x86", not(test)))]
	unsafe {
		core::arch::asm!(
			"mov cr3, {dir}",
			"mov {tmp}, cr0",
			"or {tmp}, 0x80010000",
			"mov cr0, {tmp}",
			dir = in(reg) dir.0,
			tmp = out(reg) _,
		);
	}
	#[cfg(not(all(target_arch = "x86", not(test))))]
	BOUND_DIR.store(dir.0, core::sync::atomic::Ordering::Relaxed);
}

/// Emulated `cr3` for non-kernel builds.
#[cfg(not(all(target_arch = "x86", not(test))))]
static BOUND_DIR: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

/// Returns the physical address of the currently loaded directory.
pub fn current_dir() -> PhysAddr {
	#[cfg(all(target_arch = "x86", not(test)))]
	unsafe {
		let dir: u32;
		core::arch::asm!("mov {}, cr3", out(reg) dir);
		PhysAddr(dir as usize)
	}
	#[cfg(not(all(target_arch = "x86", not(test))))]
	PhysAddr(BOUND_DIR.load(core::sync::atomic::Ordering::Relaxed))
}
