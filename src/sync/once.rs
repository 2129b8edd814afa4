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

//! Once-initialized objects.

use core::ops::Deref;
use spin::Once;

/// An object that is initialized once at boot, then accessed read-only.
///
/// Accessing the value before initialization is an integrity violation and
/// panics.
pub struct OnceInit<T>(Once<T>);

impl<T> OnceInit<T> {
	/// Creates a new instance waiting to be initialized.
	pub const fn new() -> Self {
		Self(Once::new())
	}

	/// Initializes with the given value.
	///
	/// If already initialized, the new value is dropped and the previous one
	/// is kept.
	pub fn init(&self, val: T) -> &T {
		self.0.call_once(|| val)
	}

	/// Tells whether the value has been initialized.
	pub fn is_init(&self) -> bool {
		self.0.is_completed()
	}

	/// Returns the value if initialized.
	pub fn try_get(&self) -> Option<&T> {
		self.0.get()
	}
}

impl<T> Deref for OnceInit<T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		match self.0.get() {
			Some(val) => val,
			None => panic!("accessed an object before its initialization"),
		}
	}
}

impl<T> Default for OnceInit<T> {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn once_init() {
		let cell: OnceInit<i32> = OnceInit::new();
		assert!(!cell.is_init());
		cell.init(7);
		assert!(cell.is_init());
		assert_eq!(*cell, 7);
		// A second initialization keeps the first value
		cell.init(8);
		assert_eq!(*cell, 7);
	}
}
