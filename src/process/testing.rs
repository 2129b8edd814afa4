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

//! Boot emulation of the process layer for the host test harness.

use crate::process::scheduler;
use alloc::boxed::Box;
use spin::Once;

static INIT: Once<()> = Once::new();

/// Initializes the global scheduler and the init process over the test
/// arena. Idempotent.
pub fn init() {
	INIT.call_once(|| {
		crate::memory::testing::init();
		scheduler::init().unwrap();
		super::init_kernel_process(Box::new(|| {})).unwrap();
	});
}
