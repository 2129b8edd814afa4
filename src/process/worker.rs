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

//! One-shot worker threads.
//!
//! A worker wraps a function to be run once in a kernel thread, a done flag
//! and a wait queue for callers wanting the result. Interrupt handlers use
//! the non-blocking [`Worker::is_running`] to decide whether to hand work
//! off or drop it.

use crate::{
	errno,
	errno::EResult,
	process::{scheduler, thread::Thread},
	sync::WaitQueue,
};
use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::{
	AtomicBool,
	Ordering::{Acquire, Release},
};

/// A one-shot worker.
pub struct Worker {
	/// Tells whether the worker was started.
	started: AtomicBool,
	/// Tells whether the worker's function has returned.
	done: AtomicBool,
	/// Threads waiting for completion.
	queue: WaitQueue,
}

impl Worker {
	/// Creates a worker, not yet started.
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			started: AtomicBool::new(false),
			done: AtomicBool::new(false),
			queue: WaitQueue::new(),
		})
	}

	/// Spawns a kernel thread running `f`. When `f` returns, the done flag
	/// is raised and every waiter is woken.
	///
	/// A worker runs at most once; a second start is refused.
	pub fn start<F: FnOnce() + Send + 'static>(self: &Arc<Self>, f: F) -> EResult<()> {
		if self.started.swap(true, Acquire) {
			return Err(errno!(EBUSY));
		}
		let worker = self.clone();
		let thread = Thread::new_kernel(Box::new(move || {
			f();
			worker.done.store(true, Release);
			worker.queue.wake_all();
		}))?;
		scheduler::add_thread(thread);
		Ok(())
	}

	/// Tells whether the worker was started and has not completed yet.
	///
	/// Never blocks; safe to call from an interrupt handler.
	pub fn is_running(&self) -> bool {
		self.started.load(Acquire) && !self.done.load(Acquire)
	}

	/// Tells whether the worker's function has returned.
	pub fn is_done(&self) -> bool {
		self.done.load(Acquire)
	}

	/// Blocks the calling thread until the worker completes. Returns
	/// immediately if it already has.
	pub fn wait(&self) -> EResult<()> {
		self.queue.wait_while(|| self.done.load(Acquire).then_some(()))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::process::testing as process_testing;

	#[test]
	fn worker_lifecycle_flags() {
		process_testing::init();
		let worker = Worker::new();
		assert!(!worker.is_running());
		assert!(!worker.is_done());
		worker.start(|| {}).unwrap();
		// The thread has not run yet on this harness, so the worker counts
		// as running
		assert!(worker.is_running());
		// A second start is refused
		assert_eq!(worker.start(|| {}), Err(errno!(EBUSY)));
	}

	#[test]
	fn worker_completion_wakes_waiters() {
		process_testing::init();
		let worker = Worker::new();
		// Emulate the epilogue of the worker thread
		worker.started.store(true, Release);
		worker.done.store(true, Release);
		worker.queue.wake_all();
		assert!(!worker.is_running());
		assert!(worker.is_done());
		// Waiting on a finished worker returns without blocking
		worker.wait().unwrap();
	}
}
