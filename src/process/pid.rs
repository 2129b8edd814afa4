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

//! Process and thread identifiers.
//!
//! Processes and threads draw from the same identifier space, so the initial
//! thread of a process can have a thread identifier equal to the process's
//! identifier. Used identifiers are tracked in a bitmap.

use crate::{errno, errno::EResult, sync::Mutex};
use alloc::vec::Vec;

/// A process identifier.
pub type Pid = u16;

/// The identifier of the init process.
pub const INIT_PID: Pid = 1;
/// The highest possible identifier.
const MAX_PID: usize = 32768;

/// A bitmap-backed identifier allocator.
pub struct IdAllocator {
	/// The bitmap, one bit per identifier, growing on demand.
	bitmap: Vec<u64>,
	/// Index of the first word that may hold a free bit.
	cursor: usize,
}

impl IdAllocator {
	/// Creates an empty allocator.
	pub const fn new() -> Self {
		Self {
			bitmap: Vec::new(),
			cursor: 0,
		}
	}

	/// Allocates the lowest free identifier at or above `1`.
	pub fn alloc(&mut self) -> EResult<Pid> {
		// Identifier 0 is reserved
		if self.bitmap.is_empty() {
			self.bitmap.push(1);
		}
		let start = self.cursor.min(self.bitmap.len() - 1);
		for i in start..MAX_PID / 64 {
			if i >= self.bitmap.len() {
				self.bitmap.push(0);
			}
			let word = self.bitmap[i];
			if word != u64::MAX {
				let bit = word.trailing_ones() as usize;
				self.bitmap[i] |= 1 << bit;
				self.cursor = i;
				return Ok((i * 64 + bit) as Pid);
			}
		}
		Err(errno!(ENOMEM))
	}

	/// Releases the given identifier. Releasing a free identifier does
	/// nothing.
	pub fn free(&mut self, id: Pid) {
		let (word, bit) = (id as usize / 64, id as usize % 64);
		if let Some(w) = self.bitmap.get_mut(word) {
			*w &= !(1 << bit);
			self.cursor = self.cursor.min(word);
		}
	}

	/// Marks the given identifier as used, for fixed reservations.
	pub fn set_used(&mut self, id: Pid) {
		let (word, bit) = (id as usize / 64, id as usize % 64);
		while self.bitmap.len() <= word {
			self.bitmap.push(0);
		}
		// Keep identifier 0 reserved
		if self.bitmap[0] & 1 == 0 {
			self.bitmap[0] |= 1;
		}
		self.bitmap[word] |= 1 << bit;
	}
}

impl Default for IdAllocator {
	fn default() -> Self {
		Self::new()
	}
}

/// The global identifier allocator.
static ID_ALLOCATOR: Mutex<IdAllocator> = Mutex::new(IdAllocator::new());

/// Allocates a fresh identifier.
pub fn alloc() -> EResult<Pid> {
	ID_ALLOCATOR.lock().alloc()
}

/// Releases an identifier.
pub fn free(id: Pid) {
	ID_ALLOCATOR.lock().free(id);
}

/// Reserves a fixed identifier, for the init process.
pub fn reserve(id: Pid) {
	ID_ALLOCATOR.lock().set_used(id);
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn id_alloc_sequence() {
		let mut ids = IdAllocator::new();
		assert_eq!(ids.alloc().unwrap(), 1);
		assert_eq!(ids.alloc().unwrap(), 2);
		assert_eq!(ids.alloc().unwrap(), 3);
		ids.free(2);
		// The lowest free identifier is reused
		assert_eq!(ids.alloc().unwrap(), 2);
		assert_eq!(ids.alloc().unwrap(), 4);
	}

	#[test]
	fn id_zero_reserved() {
		let mut ids = IdAllocator::new();
		assert_ne!(ids.alloc().unwrap(), 0);
		ids.free(0);
		assert_ne!(ids.alloc().unwrap(), 0);
	}

	#[test]
	fn id_set_used() {
		let mut ids = IdAllocator::new();
		ids.set_used(1);
		assert_eq!(ids.alloc().unwrap(), 2);
	}
}
