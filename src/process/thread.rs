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

//! Kernel threads of execution.
//!
//! A thread owns its saved context and kernel stack; its process owns it,
//! and the scheduler or a wait queue references it through an intrusive
//! link, so moving a thread between queues never allocates.

use crate::{
	errno::{AllocError, AllocResult},
	process::{pid, pid::Pid, scheduler::switch::Context, Process},
	sync::IntMutex,
};
use alloc::{
	alloc::{alloc as heap_alloc, dealloc as heap_dealloc},
	boxed::Box,
	sync::{Arc, Weak},
};
use core::{alloc::Layout, cell::UnsafeCell, fmt, mem::size_of, ptr::NonNull};
use intrusive_collections::{intrusive_adapter, LinkedListLink};

/// A thread identifier. The initial thread of a process has its process's
/// identifier.
pub type Tid = Pid;

/// The size of a thread's kernel stack in bytes.
pub const KERNEL_STACK_SIZE: usize = 16384;

/// The state of a thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
	/// The thread is running or eligible to run.
	Running,
	/// The thread is blocked on a wait queue or a deadline.
	Waiting,
	/// The thread terminated and waits to be reaped.
	Zombie,
	/// The thread was killed; its resources are reclaimed at the next
	/// scheduler pass.
	Killed,
}

impl State {
	/// Returns the character associated with the state.
	pub fn as_char(self) -> char {
		match self {
			Self::Running => 'R',
			Self::Waiting => 'W',
			Self::Zombie => 'Z',
			Self::Killed => 'K',
		}
	}
}

/// A kernel stack, page-backed through the heap.
struct KernelStack(NonNull<u8>);

impl KernelStack {
	const LAYOUT: Layout = match Layout::from_size_align(KERNEL_STACK_SIZE, 16) {
		Ok(layout) => layout,
		Err(_) => unreachable!(),
	};

	fn new() -> AllocResult<Self> {
		NonNull::new(unsafe { heap_alloc(Self::LAYOUT) })
			.map(Self)
			.ok_or(AllocError)
	}

	/// Returns the top of the stack, where execution starts.
	fn top(&self) -> usize {
		self.0.as_ptr() as usize + KERNEL_STACK_SIZE
	}
}

impl Drop for KernelStack {
	fn drop(&mut self) {
		unsafe {
			heap_dealloc(self.0.as_ptr(), Self::LAYOUT);
		}
	}
}

/// Entry function run by a fresh kernel thread, reached through the first
/// context switch onto the thread's stack. The word above the return slot
/// holds the closure.
extern "C" fn kthread_entry(closure: *mut u8) -> ! {
	{
		let closure = unsafe { Box::from_raw(closure as *mut Box<dyn FnOnce() + Send>) };
		crate::arch::x86::sti();
		closure();
	}
	crate::process::scheduler::exit_current()
}

/// A thread of execution.
pub struct Thread {
	/// The thread's identifier.
	pub tid: Tid,
	/// Tells whether the thread releases its identifier when dropped.
	own_tid: bool,
	/// Tells whether the thread runs in kernelspace only.
	pub kernel: bool,
	/// The process owning the thread.
	pub process: Weak<Process>,

	/// The thread's state.
	state: IntMutex<State>,
	/// The saved context, touched only by the context switch path with
	/// preemption disabled.
	context: UnsafeCell<Context>,
	/// The kernel stack. The boot thread keeps running on the boot stack
	/// and has none.
	kernel_stack: Option<KernelStack>,

	/// The wakeup deadline, in ticks, while sleeping.
	pub(crate) wake_deadline: IntMutex<Option<u64>>,

	/// Link for the runqueue.
	pub(crate) sched_link: LinkedListLink,
	/// Link for a wait queue. A thread is on at most one wait queue.
	pub(crate) wait_link: LinkedListLink,
}

// The thread's shared state is protected by its own lock, and the context is
// only reached by the scheduler on a single CPU with preemption disabled
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

intrusive_adapter!(pub SchedAdapter = Arc<Thread>: Thread { sched_link: LinkedListLink });
intrusive_adapter!(pub WaitAdapter = Arc<Thread>: Thread { wait_link: LinkedListLink });

impl Thread {
	/// Creates the thread record for an execution flow that already exists
	/// (the boot flow), running on the boot stack.
	pub fn new_boot() -> AllocResult<Arc<Self>> {
		let tid = pid::alloc().map_err(|_| AllocError)?;
		Ok(Arc::new(Self {
			tid,
			own_tid: true,
			kernel: true,
			process: Weak::new(),
			state: IntMutex::new(State::Running),
			context: UnsafeCell::new(Context::default()),
			kernel_stack: None,
			wake_deadline: IntMutex::new(None),
			sched_link: LinkedListLink::new(),
			wait_link: LinkedListLink::new(),
		}))
	}

	/// Creates a kernel thread with the given identifier, running `f` on a
	/// fresh stack.
	///
	/// `own_tid` tells whether the thread releases the identifier when it
	/// dies; the initial thread of a process shares its process's
	/// identifier, which the process keeps until it is reaped.
	pub fn new_kernel_with_tid(
		tid: Tid,
		own_tid: bool,
		process: Weak<Process>,
		f: Box<dyn FnOnce() + Send>,
	) -> AllocResult<Arc<Self>> {
		let stack = KernelStack::new()?;
		// The closure travels to `kthread_entry` as a raw double box
		let closure = Box::into_raw(Box::new(f));
		let context = unsafe { Context::prepare(stack.top(), kthread_entry, closure as usize) };
		Ok(Arc::new(Self {
			tid,
			own_tid,
			kernel: true,
			process,
			state: IntMutex::new(State::Running),
			context: UnsafeCell::new(context),
			kernel_stack: Some(stack),
			wake_deadline: IntMutex::new(None),
			sched_link: LinkedListLink::new(),
			wait_link: LinkedListLink::new(),
		}))
	}

	/// Creates a kernel thread running `f`, with a fresh identifier.
	pub fn new_kernel(f: Box<dyn FnOnce() + Send>) -> AllocResult<Arc<Self>> {
		let tid = pid::alloc().map_err(|_| AllocError)?;
		Self::new_kernel_with_tid(tid, true, Weak::new(), f)
	}

	/// Creates a thread resuming userspace execution at the given trap
	/// frame, as after `fork`.
	pub fn new_user(
		tid: Tid,
		own_tid: bool,
		process: Weak<Process>,
		frame: crate::arch::x86::IntFrame,
	) -> AllocResult<Arc<Self>> {
		let stack = KernelStack::new()?;
		let context = unsafe { Context::prepare_user(stack.top(), frame) };
		Ok(Arc::new(Self {
			tid,
			own_tid,
			kernel: false,
			process,
			state: IntMutex::new(State::Running),
			context: UnsafeCell::new(context),
			kernel_stack: Some(stack),
			wake_deadline: IntMutex::new(None),
			sched_link: LinkedListLink::new(),
			wait_link: LinkedListLink::new(),
		}))
	}

	/// Returns the thread's state.
	pub fn state(&self) -> State {
		*self.state.lock()
	}

	/// Sets the thread's state.
	///
	/// State transitions are owned by the scheduler; see the functions of
	/// [`crate::process::scheduler`].
	pub(crate) fn set_state(&self, state: State) {
		*self.state.lock() = state;
	}

	/// Returns a raw pointer to the saved context, for the context switch.
	pub(crate) fn context_ptr(&self) -> *mut Context {
		self.context.get()
	}
}

impl Drop for Thread {
	fn drop(&mut self) {
		if self.own_tid {
			pid::free(self.tid);
		}
	}
}

impl fmt::Debug for Thread {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Thread")
			.field("tid", &self.tid)
			.field("kernel", &self.kernel)
			.field("state", &self.state())
			.finish()
	}
}

/// Asserts the closure pointer fits one stack word.
const _: () = assert!(size_of::<*mut u8>() <= size_of::<usize>());

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn thread_states() {
		let t = Thread::new_boot().unwrap();
		assert_eq!(t.state(), State::Running);
		t.set_state(State::Waiting);
		assert_eq!(t.state(), State::Waiting);
		assert_eq!(State::Zombie.as_char(), 'Z');
	}

	#[test]
	fn thread_tids_unique() {
		let a = Thread::new_boot().unwrap();
		let b = Thread::new_kernel(Box::new(|| {})).unwrap();
		assert_ne!(a.tid, b.tid);
	}
}
