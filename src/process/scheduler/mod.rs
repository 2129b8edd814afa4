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

//! The thread scheduler.
//!
//! Scheduling is round-robin over a single FIFO runqueue. The timer tick
//! wakes sleeping threads whose deadline has passed, then preempts the
//! current thread once its timeslice expires. Between ticks, scheduling is
//! cooperative: threads yield when blocking.
//!
//! The current thread is **not** on the runqueue; it is pushed back when it
//! gets preempted while still runnable.

pub mod switch;

use crate::{
	errno::AllocResult,
	process::{
		thread::{SchedAdapter, State, Thread, Tid},
		Process,
	},
	sync::{IntMutex, OnceInit},
	time,
};
use alloc::{
	collections::BTreeMap,
	sync::Arc,
};
use core::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use intrusive_collections::LinkedList;

/// The duration of a timeslice in ticks (2 ms at the nominal tick rate).
pub const TIMESLICE_TICKS: u64 = 2;

/// The scheduler's state.
pub struct Scheduler {
	/// Runnable threads, in FIFO order. The current thread is not on it.
	runqueue: LinkedList<SchedAdapter>,
	/// The thread currently executing.
	current: Option<Arc<Thread>>,
	/// The thread to run when nothing is runnable (the boot flow).
	idle: Option<Arc<Thread>>,
	/// The tick at which the current thread gets preempted.
	preempt_deadline: u64,
	/// Sleeping threads, keyed by wakeup deadline then identifier, so
	/// wakeups are processed in deadline order.
	sleepers: BTreeMap<(u64, Tid), Arc<Thread>>,
}

impl Scheduler {
	/// Creates an empty scheduler.
	pub fn new() -> Self {
		Self {
			runqueue: LinkedList::new(SchedAdapter::new()),
			current: None,
			idle: None,
			preempt_deadline: 0,
			sleepers: BTreeMap::new(),
		}
	}

	/// Returns the current thread.
	pub fn current(&self) -> Option<Arc<Thread>> {
		self.current.clone()
	}

	/// Installs the thread representing the boot flow as both current and
	/// idle thread.
	pub fn set_boot_thread(&mut self, thread: Arc<Thread>) {
		self.idle = Some(thread.clone());
		self.current = Some(thread);
	}

	/// Appends a runnable thread at the back of the runqueue.
	pub fn enqueue(&mut self, thread: Arc<Thread>) {
		debug_assert_eq!(thread.state(), State::Running);
		debug_assert!(!thread.sched_link.is_linked());
		self.runqueue.push_back(thread);
	}

	/// Removes the given thread from the runqueue, if queued.
	pub fn remove(&mut self, thread: &Arc<Thread>) {
		if !thread.sched_link.is_linked() {
			return;
		}
		let mut cursor = self.runqueue.front_mut();
		while let Some(t) = cursor.get() {
			if core::ptr::eq(t, Arc::as_ptr(thread)) {
				cursor.remove();
				return;
			}
			cursor.move_next();
		}
	}

	/// Pops the next runnable thread off the runqueue, discarding dead
	/// threads on the way (their resources get dropped here, at a safe
	/// point).
	fn pop_runnable(&mut self) -> Option<Arc<Thread>> {
		while let Some(thread) = self.runqueue.pop_front() {
			match thread.state() {
				State::Running => return Some(thread),
				// Reclaimed by dropping the reference
				State::Zombie | State::Killed => continue,
				State::Waiting => continue,
			}
		}
		None
	}

	/// Elects the next thread to run and swaps it with the current one.
	///
	/// Returns the pair `(previous, next)` when a switch must happen, or
	/// `None` to resume the current thread. A previous thread that is still
	/// runnable goes to the back of the runqueue.
	pub fn rotate(&mut self, now: u64) -> Option<(Arc<Thread>, Arc<Thread>)> {
		let curr_dead = self
			.current
			.as_ref()
			.map(|c| !matches!(c.state(), State::Running))
			.unwrap_or(true);
		let next = match self.pop_runnable() {
			Some(next) => next,
			// Nothing else runnable: resume the current thread, or fall
			// back to the idle thread
			None if !curr_dead => return None,
			None => self.idle.clone()?,
		};
		self.preempt_deadline = now + TIMESLICE_TICKS;
		let prev = match self.current.replace(next.clone()) {
			Some(prev) => prev,
			None => return None,
		};
		if Arc::ptr_eq(&prev, &next) {
			return None;
		}
		if prev.state() == State::Running && !Arc::ptr_eq(&prev, self.idle.as_ref()?) {
			self.enqueue(prev.clone());
		}
		Some((prev, next))
	}

	/// Turns the given thread to the waiting state, withdrawing it from
	/// scheduling. The caller is responsible for parking it on a queue or a
	/// deadline.
	pub fn block(&mut self, thread: &Arc<Thread>) {
		thread.set_state(State::Waiting);
		self.remove(thread);
	}

	/// Turns a waiting thread back to the running state and appends it to
	/// the runqueue. Does nothing if the thread is not waiting.
	pub fn unblock(&mut self, thread: &Arc<Thread>) {
		if thread.state() != State::Waiting {
			return;
		}
		// A sleep deadline no longer applies
		if let Some(deadline) = thread.wake_deadline.lock().take() {
			self.sleepers.remove(&(deadline, thread.tid));
		}
		thread.set_state(State::Running);
		if !thread.sched_link.is_linked() {
			self.enqueue(thread.clone());
		}
	}

	/// Blocks the given thread until `unblock` or until the tick counter
	/// reaches `deadline`, whichever comes first.
	pub fn block_until(&mut self, thread: &Arc<Thread>, deadline: u64) {
		self.block(thread);
		*thread.wake_deadline.lock() = Some(deadline);
		self.sleepers.insert((deadline, thread.tid), thread.clone());
	}

	/// Unblocks every sleeper whose deadline has been reached, in deadline
	/// order.
	pub fn wake_sleepers_before(&mut self, now: u64) {
		while let Some(entry) = self.sleepers.first_entry() {
			let (deadline, _) = *entry.key();
			if deadline > now {
				break;
			}
			let thread = entry.remove();
			thread.wake_deadline.lock().take();
			thread.set_state(State::Running);
			if !thread.sched_link.is_linked() {
				self.enqueue(thread.clone());
			}
		}
	}

	/// Advances the scheduler's clock: wakes due sleepers and tells whether
	/// the current thread's timeslice has expired.
	pub fn on_tick(&mut self, now: u64) -> bool {
		self.wake_sleepers_before(now);
		now >= self.preempt_deadline
	}

	/// Returns the number of runnable threads on the runqueue.
	pub fn runnable_count(&self) -> usize {
		self.runqueue.iter().count()
	}
}

impl Default for Scheduler {
	fn default() -> Self {
		Self::new()
	}
}

/// The global scheduler.
static SCHEDULER: OnceInit<IntMutex<Scheduler>> = OnceInit::new();

/// Nesting count of preemption-disabled sections.
static PREEMPT_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Raised by the tick path when the current timeslice has expired; drained
/// at the interrupt epilogue.
static NEED_RESCHED: core::sync::atomic::AtomicBool =
	core::sync::atomic::AtomicBool::new(false);

/// Initializes the global scheduler, turning the boot flow into the idle
/// thread.
pub fn init() -> AllocResult<()> {
	let mut sched = Scheduler::new();
	sched.set_boot_thread(Thread::new_boot()?);
	SCHEDULER.init(IntMutex::new(sched));
	Ok(())
}

/// Returns the global scheduler.
pub fn get() -> &'static IntMutex<Scheduler> {
	&SCHEDULER
}

/// Returns the global scheduler, or `None` before initialization.
pub fn try_get() -> Option<&'static IntMutex<Scheduler>> {
	SCHEDULER.try_get()
}

/// Returns the currently running thread.
pub fn current_thread() -> Option<Arc<Thread>> {
	SCHEDULER.try_get()?.lock().current()
}

/// Returns the process of the currently running thread.
pub fn current_process() -> Option<Arc<Process>> {
	current_thread()?.process.upgrade()
}

/// Makes the given thread eligible to run.
pub fn add_thread(thread: Arc<Thread>) {
	SCHEDULER.lock().enqueue(thread);
}

/// A scope during which the timer must not preempt the current thread.
///
/// The previous interrupt state is restored when the scope ends, whatever
/// the exit path.
pub struct PreemptGuard {
	int_state: bool,
}

impl PreemptGuard {
	/// Enters a preemption-disabled scope.
	pub fn new() -> Self {
		let int_state = crate::arch::x86::is_interrupt_enabled();
		preempt_disable();
		crate::arch::x86::cli();
		Self {
			int_state,
		}
	}
}

impl Default for PreemptGuard {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for PreemptGuard {
	fn drop(&mut self) {
		preempt_enable();
		crate::arch::x86::set_interrupt_flag(self.int_state);
	}
}

/// Disables timer preemption. Calls nest.
pub fn preempt_disable() {
	PREEMPT_COUNT.fetch_add(1, Relaxed);
}

/// Re-enables timer preemption once every disable has been matched.
pub fn preempt_enable() {
	let prev = PREEMPT_COUNT.fetch_sub(1, Relaxed);
	debug_assert!(prev > 0);
}

/// Tells whether timer preemption is currently allowed.
pub fn preempt_allowed() -> bool {
	PREEMPT_COUNT.load(Relaxed) == 0
}

/// Elects the next thread and switches to it.
///
/// When no other thread is runnable, the function returns without
/// switching.
pub fn schedule() {
	let int_state = crate::arch::x86::is_interrupt_enabled();
	crate::arch::x86::cli();
	let pair = {
		let mut sched = SCHEDULER.lock();
		sched.rotate(time::ticks())
	};
	if let Some((prev, next)) = pair {
		// Load the next thread's address space
		if let Some(proc) = next.process.upgrade() {
			unsafe {
				proc.mem_space().lock().bind();
			}
		}
		unsafe {
			// Interrupts stay disabled across the switch; the next thread
			// restores its own interrupt state
			switch::switch(prev.context_ptr(), next.context_ptr());
		}
	}
	crate::arch::x86::set_interrupt_flag(int_state);
}

/// Forces a yield of the current thread.
pub fn yield_now() {
	schedule();
}

/// Blocks the current thread and yields. The caller must have parked the
/// thread on a wait queue beforehand.
pub fn block_current() {
	if let Some(thread) = current_thread() {
		SCHEDULER.lock().block(&thread);
	}
	schedule();
}

/// Blocks the current thread until the tick counter reaches `deadline`.
pub fn sleep_until(deadline: u64) {
	if let Some(thread) = current_thread() {
		SCHEDULER.lock().block_until(&thread, deadline);
	}
	schedule();
}

/// Kills the given thread.
///
/// Killing the current thread tears it down and yields, never returning to
/// the caller in that case. For another thread, reclamation is deferred to
/// the next scheduler pass.
pub fn thread_kill(thread: &Arc<Thread>) {
	let is_current = current_thread()
		.map(|c| Arc::ptr_eq(&c, thread))
		.unwrap_or(false);
	{
		let mut sched = SCHEDULER.lock();
		if let Some(deadline) = thread.wake_deadline.lock().take() {
			sched.sleepers.remove(&(deadline, thread.tid));
		}
		thread.set_state(State::Killed);
		if !is_current {
			sched.remove(thread);
		}
	}
	if is_current {
		loop {
			schedule();
		}
	}
}

/// Terminates the current thread after its entry function returned.
pub fn exit_current() -> ! {
	let thread = current_thread().expect("thread exit outside of the scheduler");
	thread.set_state(State::Zombie);
	loop {
		schedule();
	}
}

/// The timer tick entry: wakes due sleepers and flags a reschedule when
/// the current thread's timeslice has expired.
///
/// The switch itself is deferred to [`preempt_point`]: the tick runs
/// inside the interrupt dispatch, which must not switch away while
/// holding the callback table.
pub fn tick_handler(now: u64) {
	let Some(sched) = SCHEDULER.try_get() else {
		return;
	};
	let expired = sched.lock().on_tick(now);
	if expired {
		NEED_RESCHED.store(true, Relaxed);
	}
}

/// Preemption point, called by the external interrupt stubs after the
/// dispatch returns: switches threads if the tick asked for it and
/// preemption is allowed.
pub fn preempt_point() {
	if NEED_RESCHED.swap(false, Relaxed) {
		if preempt_allowed() {
			schedule();
		} else {
			// Keep the request for the next point
			NEED_RESCHED.store(true, Relaxed);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use alloc::{boxed::Box, vec::Vec};

	fn kthread() -> Arc<Thread> {
		Thread::new_kernel(Box::new(|| {})).unwrap()
	}

	#[test]
	fn scheduler_round_robin_rotation() {
		let mut sched = Scheduler::new();
		let boot = Thread::new_boot().unwrap();
		sched.set_boot_thread(boot.clone());
		let threads: Vec<_> = (0..3).map(|_| kthread()).collect();
		for t in &threads {
			sched.enqueue(t.clone());
		}
		// Over N * rounds rotations, each thread is elected the same number
		// of times, in FIFO order
		let mut elected = Vec::new();
		for now in 0..9 {
			let (_, next) = sched.rotate(now).unwrap();
			elected.push(next.tid);
		}
		for round in 0..3 {
			for (i, t) in threads.iter().enumerate() {
				assert_eq!(elected[round * 3 + i], t.tid);
			}
		}
	}

	#[test]
	fn scheduler_idle_when_empty() {
		let mut sched = Scheduler::new();
		let boot = Thread::new_boot().unwrap();
		sched.set_boot_thread(boot.clone());
		// Nothing runnable: resume current
		assert!(sched.rotate(0).is_none());
		// Current blocked and nothing runnable: fall back to idle
		sched.block(&boot);
		assert!(sched.rotate(0).is_none());
		assert!(Arc::ptr_eq(&sched.current().unwrap(), &boot));
	}

	#[test]
	fn scheduler_block_unblock() {
		let mut sched = Scheduler::new();
		sched.set_boot_thread(Thread::new_boot().unwrap());
		let a = kthread();
		let b = kthread();
		sched.enqueue(a.clone());
		sched.enqueue(b.clone());
		sched.block(&a);
		assert_eq!(a.state(), State::Waiting);
		assert_eq!(sched.runnable_count(), 1);
		// Only b is electable
		let (_, next) = sched.rotate(0).unwrap();
		assert!(Arc::ptr_eq(&next, &b));
		// Unblocking puts a at the back of the queue
		sched.unblock(&a);
		assert_eq!(a.state(), State::Running);
		assert_eq!(sched.runnable_count(), 2);
	}

	#[test]
	fn scheduler_sleepers_wake_in_deadline_order() {
		let mut sched = Scheduler::new();
		sched.set_boot_thread(Thread::new_boot().unwrap());
		let (a, b, c) = (kthread(), kthread(), kthread());
		sched.block_until(&a, 30);
		sched.block_until(&b, 10);
		sched.block_until(&c, 20);
		assert!(!sched.on_tick(5));
		assert_eq!(sched.runnable_count(), 0);
		// Deadline 10 and 20 pass: b then c wake, in that order
		sched.on_tick(25);
		assert_eq!(sched.runnable_count(), 2);
		assert_eq!(a.state(), State::Waiting);
		let (_, first) = sched.rotate(25).unwrap();
		assert!(Arc::ptr_eq(&first, &b));
		let (_, second) = sched.rotate(25).unwrap();
		assert!(Arc::ptr_eq(&second, &c));
		// A sleeper never wakes before its deadline
		sched.on_tick(29);
		assert_eq!(a.state(), State::Waiting);
		sched.on_tick(30);
		assert_eq!(a.state(), State::Running);
	}

	#[test]
	fn scheduler_unblock_cancels_sleep() {
		let mut sched = Scheduler::new();
		sched.set_boot_thread(Thread::new_boot().unwrap());
		let a = kthread();
		sched.block_until(&a, 50);
		sched.unblock(&a);
		assert_eq!(a.state(), State::Running);
		assert!(a.wake_deadline.lock().is_none());
		// The stale deadline does not wake anything
		let before = sched.runnable_count();
		sched.wake_sleepers_before(100);
		assert_eq!(sched.runnable_count(), before);
	}

	#[test]
	fn scheduler_timeslice_expiry() {
		let mut sched = Scheduler::new();
		sched.set_boot_thread(Thread::new_boot().unwrap());
		let a = kthread();
		sched.enqueue(a.clone());
		let (_, _) = sched.rotate(0).unwrap();
		// The timeslice is 2 ticks
		assert!(!sched.on_tick(1));
		assert!(sched.on_tick(2));
	}

	#[test]
	fn scheduler_dead_threads_reclaimed() {
		let mut sched = Scheduler::new();
		sched.set_boot_thread(Thread::new_boot().unwrap());
		let a = kthread();
		sched.enqueue(a.clone());
		a.set_state(State::Killed);
		// The dead thread is skipped and dropped at election time
		assert_eq!(Arc::strong_count(&a), 2);
		assert!(sched.rotate(0).is_none());
		assert_eq!(Arc::strong_count(&a), 1);
	}

	#[test]
	fn preempt_guard_nests() {
		assert!(preempt_allowed());
		{
			let _g1 = PreemptGuard::new();
			let _g2 = PreemptGuard::new();
			assert!(!preempt_allowed());
		}
		assert!(preempt_allowed());
	}
}
