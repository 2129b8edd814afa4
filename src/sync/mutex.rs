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

//! Mutual exclusion primitives.
//!
//! One particularity with kernel development is that multi-threading is not
//! the only source of concurrency: an interruption may fire at any moment. A
//! structure shared with an interrupt handler must be locked with
//! [`IntMutex`], which masks maskable interrupts for the time the lock is
//! held and restores the previous interrupt state on unlock. Failing to do
//! so, the handler could spin forever on a lock the interrupted code holds.

use crate::arch::x86;
use core::{
	fmt,
	mem::ManuallyDrop,
	ops::{Deref, DerefMut},
};

/// Mutual exclusion for a value.
///
/// `INT` tells whether interrupts are left enabled while the lock is held.
pub struct Mutex<T: ?Sized, const INT: bool = true> {
	inner: spin::Mutex<T>,
}

/// A [`Mutex`] which masks interrupts while locked.
pub type IntMutex<T> = Mutex<T, false>;

impl<T, const INT: bool> Mutex<T, INT> {
	/// Creates a new mutex wrapping the given value.
	pub const fn new(val: T) -> Self {
		Self {
			inner: spin::Mutex::new(val),
		}
	}

	/// Consumes the mutex and returns the wrapped value.
	pub fn into_inner(self) -> T {
		self.inner.into_inner()
	}
}

impl<T: ?Sized, const INT: bool> Mutex<T, INT> {
	/// Locks the mutex, spinning until it is available.
	pub fn lock(&self) -> MutexGuard<'_, T, INT> {
		let int_state = x86::is_interrupt_enabled();
		if !INT {
			x86::cli();
		}
		MutexGuard {
			guard: ManuallyDrop::new(self.inner.lock()),
			int_state,
		}
	}

	/// Returns a mutable reference to the wrapped value.
	///
	/// Since this borrows the mutex mutably, no locking is required.
	pub fn get_mut(&mut self) -> &mut T {
		self.inner.get_mut()
	}
}

impl<T: Default, const INT: bool> Default for Mutex<T, INT> {
	fn default() -> Self {
		Self::new(T::default())
	}
}

impl<T: ?Sized + fmt::Debug, const INT: bool> fmt::Debug for Mutex<T, INT> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.inner.try_lock() {
			Some(guard) => f.debug_tuple("Mutex").field(&&*guard).finish(),
			None => f.write_str("Mutex(<locked>)"),
		}
	}
}

/// Unlocks the associated [`Mutex`] when dropped.
pub struct MutexGuard<'m, T: ?Sized, const INT: bool> {
	guard: ManuallyDrop<spin::MutexGuard<'m, T>>,
	/// The interrupt state before locking. Relevant only if `INT == false`.
	int_state: bool,
}

impl<T: ?Sized, const INT: bool> Deref for MutexGuard<'_, T, INT> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		&self.guard
	}
}

impl<T: ?Sized, const INT: bool> DerefMut for MutexGuard<'_, T, INT> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self.guard
	}
}

impl<T: ?Sized + fmt::Debug, const INT: bool> fmt::Debug for MutexGuard<'_, T, INT> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self.deref(), f)
	}
}

impl<T: ?Sized, const INT: bool> Drop for MutexGuard<'_, T, INT> {
	fn drop(&mut self) {
		// The spinlock must be released before interrupts are enabled again, so that an
		// interrupt handler cannot spin on a lock held by the code it interrupted
		unsafe {
			ManuallyDrop::drop(&mut self.guard);
		}
		if !INT {
			x86::set_interrupt_flag(self.int_state);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn mutex_lock_unlock() {
		let m: Mutex<i32> = Mutex::new(41);
		{
			let mut guard = m.lock();
			*guard += 1;
		}
		assert_eq!(*m.lock(), 42);
	}

	#[test]
	fn int_mutex_restores_interrupt_state() {
		use crate::arch::x86;
		x86::sti();
		let m: IntMutex<()> = IntMutex::new(());
		{
			let _guard = m.lock();
			assert!(!x86::is_interrupt_enabled());
		}
		assert!(x86::is_interrupt_enabled());
		x86::cli();
	}
}
