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

//! The Opal kernel core: physical and virtual memory management, a
//! round-robin thread scheduler and a virtual filesystem with a block
//! device page cache.
//!
//! The crate is a library so that the external integration glue (boot
//! trampoline, GDT/IDT setup, interrupt stubs, drivers and program loaders)
//! can link against it. The entry point after early boot is
//! [`kernel_main`]; the stubs feed interrupts into [`event::trigger`],
//! system calls into [`syscall_entry`] and page faults into
//! [`page_fault_entry`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod device;
pub mod errno;
pub mod event;
pub mod file;
pub mod limits;
pub mod logger;
pub mod memory;
pub mod multiboot;
pub mod panic;
pub mod print;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod time;

use arch::x86::IntFrame;
use memory::vmem::FaultCode;
use memory::VirtAddr;

/// The current kernel version.
pub const KERNEL_VERSION: &str = "0.1.0";

/// The entry of the system call trap stub.
///
/// The result of the call is stored into the frame's `eax`.
pub fn syscall_entry(frame: &mut IntFrame) {
	syscall::dispatch(frame);
}

/// The entry of the page fault stub.
///
/// The fault is first submitted to the current address space (lazy backing
/// and copy-on-write). An unresolvable fault from user mode kills the
/// faulting thread; from kernel mode, it is an integrity violation.
pub fn page_fault_entry(code: u32, frame: &IntFrame) {
	let addr = VirtAddr(arch::x86::read_fault_address());
	let code = FaultCode::from_bits_truncate(code);
	if process::page_fault_handler(addr, code) {
		return;
	}
	if code.contains(FaultCode::USER) {
		log::error!(
			"segmentation fault at {addr:?} (eip: {:#010x}), killing thread",
			frame.eip
		);
		if let Some(proc) = process::scheduler::current_process() {
			proc.exit(139);
		}
		if let Some(thread) = process::scheduler::current_thread() {
			process::scheduler::thread_kill(&thread);
		}
	}
	panic::print_regs(frame);
	panic!("unresolved page fault in kernelspace at {addr:?}");
}

/// Timer tick hook, kept alive for the kernel's lifetime.
#[cfg(all(target_arch = "x86", not(test)))]
static TICK_HOOK: sync::OnceInit<event::CallbackHook> = sync::OnceInit::new();

/// The kernel's entry point, reached from the external boot trampoline
/// with the Multiboot 2 magic and boot information pointer.
#[cfg(all(target_arch = "x86", not(test)))]
#[no_mangle]
pub extern "C" fn kernel_main(magic: u32, boot_info: *const core::ffi::c_void) -> ! {
	if magic != multiboot::BOOTLOADER_MAGIC {
		arch::x86::halt();
	}
	let boot_info = unsafe { multiboot::read(boot_info) };
	logger::init(boot_info.quiet);
	log::info!("booting Opal kernel version {KERNEL_VERSION}");
	// Memory management, bottom up
	memory::memmap::init(&boot_info, kernel_image_end());
	memory::memmap::print_entries(&boot_info);
	unsafe {
		memory::frame::init(memory::memmap::get_info());
	}
	memory::vmem::init().unwrap_or_else(|_| panic!("not enough memory for the kernel tables"));
	memory::vmem::init_kernel()
		.unwrap_or_else(|_| panic!("not enough memory for the kernel context"));
	memory::mmio::init();
	unsafe {
		memory::vmem::kernel().lock().bind();
	}
	// Scheduling
	process::scheduler::init().unwrap_or_else(|_| panic!("cannot create the boot thread"));
	let hook = event::register_callback(event::TIMER_VECTOR, |_, _| time::tick())
		.expect("cannot register the timer callback");
	TICK_HOOK.init(hook);
	// Files and devices
	file::fs::register_defaults();
	device::cache::init().expect("cannot start the writeback thread");
	file::vfs::mount_root("tmpfs", None).expect("cannot mount the root filesystem");
	// Hand over to the init process; this flow becomes the idle thread
	process::init_kernel_process(alloc::boxed::Box::new(init_task))
		.expect("cannot create the init process");
	loop {
		process::scheduler::schedule();
		arch::x86::idle();
	}
}

/// The first task of the init process: bring up userspace.
#[cfg(all(target_arch = "x86", not(test)))]
fn init_task() {
	log::info!("init process started");
	// The program loader registers itself from the integration glue; until
	// an initramfs and a loader are present, there is nothing to execute
}

/// Returns the physical address of the end of the kernel image, from the
/// linker-provided symbol.
#[cfg(all(target_arch = "x86", not(test)))]
fn kernel_image_end() -> memory::PhysAddr {
	extern "C" {
		/// The linker script places this symbol at the end of the image.
		static kernel_end: core::ffi::c_void;
	}
	let virt = unsafe { core::ptr::addr_of!(kernel_end) as usize };
	memory::PhysAddr(virt - memory::KERNEL_BEGIN.0)
}
