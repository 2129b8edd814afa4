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

//! Raw printing to the kernel console.
//!
//! Regular code uses the `log` macros; these are for the panic path, which
//! must reach the console with as little machinery as possible.

/// Prints the given formatted string on the kernel console, bypassing log
/// levels.
#[macro_export]
macro_rules! print {
	($($arg:tt)*) => {{
		use core::fmt::Write;
		let _ = write!($crate::logger::get().lock(), $($arg)*);
	}};
}

/// Same as [`print!`], with a trailing newline.
#[macro_export]
macro_rules! println {
	() => ($crate::print!("\n"));
	($($arg:tt)*) => {{
		use core::fmt::Write;
		let _ = writeln!($crate::logger::get().lock(), $($arg)*);
	}};
}
