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

//! Kernel panic.
//!
//! A panic is reserved for integrity violations: page table corruption,
//! double free of a kernel image frame, or an unresolvable fault in
//! kernelspace. The handler prints the message, the saved registers if any,
//! and walks the frame pointer chain, then halts.

use crate::arch::x86;
use crate::println;

/// The maximum depth of the stack walk.
const MAX_FRAMES: usize = 16;

/// Prints the call stack by walking the frame pointer chain starting at
/// `ebp`.
pub fn print_callstack(mut ebp: usize) {
	println!("--- Callstack ---");
	for i in 0..MAX_FRAMES {
		if ebp == 0 || ebp % core::mem::size_of::<usize>() != 0 {
			break;
		}
		// A frame holds the previous ebp, then the return address
		let (prev_ebp, ret) = unsafe {
			let ptr = ebp as *const usize;
			(ptr.read(), ptr.add(1).read())
		};
		if ret == 0 {
			break;
		}
		println!("  #{i} {ret:#010x}");
		if prev_ebp <= ebp {
			break;
		}
		ebp = prev_ebp;
	}
}

/// Prints a trap frame.
pub fn print_regs(frame: &x86::IntFrame) {
	println!(
		"eax: {:#010x} ebx: {:#010x} ecx: {:#010x} edx: {:#010x}",
		frame.eax, frame.ebx, frame.ecx, frame.edx
	);
	println!(
		"esi: {:#010x} edi: {:#010x} ebp: {:#010x} esp: {:#010x}",
		frame.esi, frame.edi, frame.ebp, frame.esp
	);
	println!(
		"eip: {:#010x} eflags: {:#010x} cs: {:#06x} ss: {:#06x}",
		frame.eip, frame.eflags, frame.cs, frame.ss
	);
}

/// Called on Rust panic: prints the diagnostic and halts the system.
#[cfg(all(target_arch = "x86", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
	x86::cli();
	println!("--- KERNEL PANIC ---");
	println!("{info}");
	print_callstack(x86::read_frame_pointer());
	x86::halt();
}
