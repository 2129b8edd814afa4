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

//! Timekeeping.
//!
//! The external timer driver is programmed to fire at [`TICK_FREQ_HZ`] and
//! its interrupt stub calls [`tick`]. The tick counter is the kernel's
//! monotonic clock; the scheduler derives preemption and wakeup deadlines
//! from it, through its own entry point, so another deadline source can be
//! substituted without touching timekeeping.

use crate::process::scheduler;
use core::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// The nominal tick rate, one tick per millisecond.
pub const TICK_FREQ_HZ: u64 = 1000;

/// Ticks elapsed since boot.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Returns the number of ticks elapsed since boot.
pub fn ticks() -> u64 {
	TICKS.load(Relaxed)
}

/// Returns the uptime in milliseconds.
pub fn uptime_ms() -> u64 {
	ticks() * 1000 / TICK_FREQ_HZ
}

/// Advances the clock by one tick and drives the scheduler.
///
/// Called from the timer interrupt stub; never blocks.
pub fn tick() {
	let now = TICKS.fetch_add(1, Relaxed) + 1;
	scheduler::tick_handler(now);
}

/// Puts the current thread to sleep for at least `ms` milliseconds.
///
/// The thread resumes once the clock has reached the deadline, never
/// before.
pub fn sleep_for(ms: u64) {
	let deadline = ticks() + ms * TICK_FREQ_HZ / 1000;
	scheduler::sleep_until(deadline);
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::process::{testing as process_testing, thread::State};

	#[test]
	fn ticks_monotonic() {
		process_testing::init();
		let before = ticks();
		tick();
		assert!(ticks() > before);
	}

	#[test]
	fn sleep_wakeup_not_before_deadline() {
		// The sleep scenario, driven tick by tick: the sleeper stays
		// waiting until the deadline is reached, then resumes
		process_testing::init();
		let mut sched = scheduler::Scheduler::new();
		sched.set_boot_thread(crate::process::thread::Thread::new_boot().unwrap());
		let t = crate::process::thread::Thread::new_kernel(alloc::boxed::Box::new(|| {})).unwrap();
		let t0 = 1000;
		let deadline = t0 + 1000;
		sched.block_until(&t, deadline);
		for now in (t0..deadline).step_by(100) {
			sched.on_tick(now);
			assert_eq!(t.state(), State::Waiting, "woke up early at tick {now}");
		}
		sched.on_tick(deadline);
		assert_eq!(t.state(), State::Running);
	}
}
