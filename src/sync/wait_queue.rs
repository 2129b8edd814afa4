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

//! Queues of threads waiting on a resource.
//!
//! A thread is on at most one wait queue, and is in the waiting state while
//! queued. Wakeups are FIFO. The state transition happens under the queue's
//! interrupt-masking lock, which closes the race between a sleeper going
//! down and its wakeup coming in from an interrupt handler.

use crate::{
	errno,
	errno::EResult,
	process::{
		scheduler,
		thread::{WaitAdapter, State, Thread},
	},
	sync::IntMutex,
	time,
};
use alloc::sync::Arc;
use core::fmt;
use intrusive_collections::LinkedList;

/// A queue of threads waiting on a resource.
pub struct WaitQueue {
	/// The queued threads, in arrival order.
	queue: IntMutex<LinkedList<WaitAdapter>>,
}

impl WaitQueue {
	/// Creates a new empty queue.
	pub fn new() -> Self {
		Self {
			queue: IntMutex::new(LinkedList::new(WaitAdapter::new())),
		}
	}

	/// Parks the given thread on the queue, turning it to the waiting
	/// state.
	///
	/// The queue lock is held across the state transition, so a concurrent
	/// wakeup cannot slip between the two.
	pub fn park(&self, thread: &Arc<Thread>, deadline: Option<u64>) {
		let mut queue = self.queue.lock();
		{
			let mut sched = scheduler::get().lock();
			match deadline {
				Some(deadline) => sched.block_until(thread, deadline),
				None => sched.block(thread),
			}
		}
		queue.push_back(thread.clone());
	}

	/// Withdraws the given thread from the queue, if queued here.
	///
	/// Returns `true` if the thread was still on the queue.
	pub fn remove(&self, thread: &Arc<Thread>) -> bool {
		let mut queue = self.queue.lock();
		if !thread.wait_link.is_linked() {
			return false;
		}
		let mut cursor = queue.front_mut();
		while let Some(t) = cursor.get() {
			if core::ptr::eq(t, Arc::as_ptr(thread)) {
				cursor.remove();
				return true;
			}
			cursor.move_next();
		}
		false
	}

	/// Makes the current thread wait on the queue until woken up.
	pub fn wait(&self) -> EResult<()> {
		let thread = scheduler::current_thread().ok_or_else(|| errno!(EPERM))?;
		self.park(&thread, None);
		scheduler::schedule();
		// Make sure the thread is dequeued, whatever woke it
		self.remove(&thread);
		Ok(())
	}

	/// Makes the current thread wait on the queue, giving up when the tick
	/// counter reaches `deadline`.
	///
	/// On timeout the thread is removed from the queue and `EBUSY` is
	/// returned.
	pub fn wait_until(&self, deadline: u64) -> EResult<()> {
		let thread = scheduler::current_thread().ok_or_else(|| errno!(EPERM))?;
		self.park(&thread, Some(deadline));
		scheduler::schedule();
		// If the thread is still queued, the timer woke it: this is a
		// timeout. A wakeup through `wake_next` dequeues first
		let timed_out = self.remove(&thread);
		if timed_out && time::ticks() >= deadline {
			return Err(errno!(EBUSY));
		}
		Ok(())
	}

	/// Makes the current thread wait until `cond` returns `Some`.
	///
	/// The condition is evaluated under the queue's lock, so a wakeup
	/// cannot be lost between the check and the sleep.
	pub fn wait_while<T, F: FnMut() -> Option<T>>(&self, mut cond: F) -> EResult<T> {
		let thread = scheduler::current_thread().ok_or_else(|| errno!(EPERM))?;
		loop {
			{
				let mut queue = self.queue.lock();
				if let Some(val) = cond() {
					return Ok(val);
				}
				scheduler::get().lock().block(&thread);
				queue.push_back(thread.clone());
			}
			scheduler::schedule();
			self.remove(&thread);
		}
	}

	/// Wakes the next thread in queue, if any. Wake order is arrival
	/// order.
	///
	/// Threads already woken by their deadline, or killed while queued, are
	/// discarded without consuming the wakeup.
	pub fn wake_next(&self) {
		loop {
			let Some(thread) = self.queue.lock().pop_front() else {
				break;
			};
			if thread.state() == State::Waiting {
				scheduler::get().lock().unblock(&thread);
				break;
			}
		}
	}

	/// Wakes every thread in queue.
	pub fn wake_all(&self) {
		loop {
			let thread = self.queue.lock().pop_front();
			match thread {
				Some(thread) => scheduler::get().lock().unblock(&thread),
				None => break,
			}
		}
	}

	/// Tells whether no thread is waiting on the queue.
	pub fn is_empty(&self) -> bool {
		self.queue.lock().is_empty()
	}
}

impl Default for WaitQueue {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for WaitQueue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("WaitQueue")
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::process::testing as process_testing;
	use alloc::{boxed::Box, vec::Vec};

	fn kthread() -> Arc<Thread> {
		Thread::new_kernel(Box::new(|| {})).unwrap()
	}

	#[test]
	fn wait_queue_fifo_wakeup() {
		process_testing::init();
		let queue = WaitQueue::new();
		let threads: Vec<_> = (0..3).map(|_| kthread()).collect();
		for t in &threads {
			queue.park(t, None);
			assert_eq!(t.state(), State::Waiting);
		}
		assert!(!queue.is_empty());
		// Threads wake in the order they were parked
		for t in &threads {
			queue.wake_next();
			assert_eq!(t.state(), State::Running);
		}
		assert!(queue.is_empty());
	}

	#[test]
	fn wait_queue_remove() {
		process_testing::init();
		let queue = WaitQueue::new();
		let a = kthread();
		let b = kthread();
		queue.park(&a, None);
		queue.park(&b, None);
		assert!(queue.remove(&a));
		assert!(!queue.remove(&a));
		// Only b is left
		queue.wake_next();
		assert_eq!(b.state(), State::Running);
		assert!(queue.is_empty());
		assert_eq!(a.state(), State::Waiting);
	}

	#[test]
	fn wait_queue_wake_all() {
		process_testing::init();
		let queue = WaitQueue::new();
		let threads: Vec<_> = (0..4).map(|_| kthread()).collect();
		for t in &threads {
			queue.park(t, None);
		}
		queue.wake_all();
		assert!(queue.is_empty());
		for t in &threads {
			assert_eq!(t.state(), State::Running);
		}
	}

	#[test]
	fn wait_queue_deadline_parking() {
		process_testing::init();
		let queue = WaitQueue::new();
		let a = kthread();
		queue.park(&a, Some(u64::MAX));
		assert_eq!(a.state(), State::Waiting);
		assert!(a.wake_deadline.lock().is_some());
		// A direct wakeup cancels the deadline
		queue.wake_next();
		assert_eq!(a.state(), State::Running);
		assert!(a.wake_deadline.lock().is_none());
	}
}
