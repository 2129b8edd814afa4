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

//! Interrupt event dispatch.
//!
//! The interrupt descriptor table and its stubs live outside of the core;
//! the contract is that each stub acknowledges its controller, calls
//! [`trigger`] with the vector and the error code, then calls
//! [`crate::process::scheduler::preempt_point`] before returning. The core
//! (and drivers) register callbacks per vector through
//! [`register_callback`].
//!
//! Callbacks run with interrupts disabled, holding the callback table, and
//! must neither block nor switch threads.

use crate::{
	errno,
	errno::EResult,
	sync::IntMutex,
};
use alloc::{boxed::Box, vec::Vec};

/// The number of handled interrupt vectors.
pub const VECTORS: usize = 64;

/// The interrupt vector of the timer.
pub const TIMER_VECTOR: u32 = 32;
/// The interrupt vector of page faults.
pub const PAGE_FAULT_VECTOR: u32 = 14;

/// A callback, taking the vector and the error code.
pub type Callback = Box<dyn FnMut(u32, u32) + Send>;

/// A registered callback with its identifier.
struct Entry {
	id: usize,
	callback: Callback,
}

/// The callbacks, per vector.
static CALLBACKS: IntMutex<[Vec<Entry>; VECTORS]> =
	IntMutex::new([const { Vec::new() }; VECTORS]);

/// The next callback identifier.
static NEXT_ID: IntMutex<usize> = IntMutex::new(0);

/// A handle on a registered callback, unregistering it when dropped.
#[must_use]
pub struct CallbackHook {
	vector: u32,
	id: usize,
}

impl Drop for CallbackHook {
	fn drop(&mut self) {
		let mut callbacks = CALLBACKS.lock();
		let entries = &mut callbacks[self.vector as usize];
		entries.retain(|e| e.id != self.id);
	}
}

/// Registers a callback for the given interrupt vector, returning a hook
/// that keeps the registration alive.
pub fn register_callback<F: FnMut(u32, u32) + Send + 'static>(
	vector: u32,
	callback: F,
) -> EResult<CallbackHook> {
	if vector as usize >= VECTORS {
		return Err(errno!(EINVAL));
	}
	let id = {
		let mut next = NEXT_ID.lock();
		*next += 1;
		*next
	};
	CALLBACKS.lock()[vector as usize].push(Entry {
		id,
		callback: Box::new(callback),
	});
	Ok(CallbackHook {
		vector,
		id,
	})
}

/// Dispatches an interrupt to the callbacks registered on its vector.
///
/// Called by the external interrupt stubs with interrupts disabled.
pub fn trigger(vector: u32, code: u32) {
	if vector as usize >= VECTORS {
		return;
	}
	let mut callbacks = CALLBACKS.lock();
	for entry in callbacks[vector as usize].iter_mut() {
		(entry.callback)(vector, code);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use alloc::sync::Arc;
	use core::sync::atomic::{AtomicU32, Ordering::Relaxed};

	#[test]
	fn event_dispatch_and_unregister() {
		let count = Arc::new(AtomicU32::new(0));
		let c = count.clone();
		let hook = register_callback(40, move |_, code| {
			c.fetch_add(code, Relaxed);
		})
		.unwrap();
		trigger(40, 2);
		trigger(40, 3);
		// Other vectors do not run the callback
		trigger(41, 100);
		assert_eq!(count.load(Relaxed), 5);
		drop(hook);
		trigger(40, 7);
		assert_eq!(count.load(Relaxed), 5);
	}

	#[test]
	fn event_invalid_vector() {
		assert!(register_callback(10_000, |_, _| {}).is_err());
	}
}
