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

//! Kernel error values.
//!
//! Every fallible operation in the kernel returns the same enumerated error
//! type, so that errors can cross subsystem boundaries (and the syscall
//! boundary, negated) without translation.

use core::fmt;

/// An error value, in the POSIX style.
///
/// The inner value is always one of the constants defined in this module.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Errno(i32);

/// Result type used by most fallible kernel functions.
pub type EResult<T> = Result<T, Errno>;

/// Error returned when the system runs out of physical memory.
///
/// Kept distinct from [`Errno`] so allocation paths cannot accidentally
/// surface any other error; it converts into `ENOMEM` at the boundary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AllocError;

/// Result type for allocation functions.
pub type AllocResult<T> = Result<T, AllocError>;

impl From<AllocError> for Errno {
	fn from(_: AllocError) -> Self {
		Errno(ENOMEM)
	}
}

macro_rules! define_errnos {
	($($(#[$doc:meta])* $name:ident = $val:literal,)*) => {
		$($(#[$doc])* pub const $name: i32 = $val;)*

		impl Errno {
			/// Returns the name of the error, for logging purposes.
			pub fn name(&self) -> &'static str {
				match self.0 {
					$($val => stringify!($name),)*
					_ => "unknown",
				}
			}
		}
	};
}

define_errnos! {
	/// Argument list too long.
	E2BIG = 1,
	/// Permission denied.
	EACCES = 2,
	/// Device or resource busy.
	EBUSY = 3,
	/// Destination address required.
	EDESTADDRREQ = 4,
	/// File exists.
	EEXIST = 5,
	/// Invalid argument.
	EINVAL = 6,
	/// Is a directory.
	EISDIR = 7,
	/// Message too large.
	EMSGSIZE = 8,
	/// Filename too long.
	ENAMETOOLONG = 9,
	/// No such device.
	ENODEV = 10,
	/// No such file or directory.
	ENOENT = 11,
	/// Not enough space.
	ENOMEM = 12,
	/// Functionality not implemented.
	ENOSYS = 13,
	/// The socket is not connected.
	ENOTCONN = 14,
	/// Not a directory.
	ENOTDIR = 15,
	/// Not a socket.
	ENOTSOCK = 16,
	/// Operation not supported.
	ENOTSUP = 17,
	/// Operation not permitted.
	EPERM = 18,
}

impl Errno {
	/// Creates an error from a raw value.
	pub const fn new(val: i32) -> Self {
		Self(val)
	}

	/// Returns the raw value, as stored.
	pub const fn as_int(&self) -> i32 {
		self.0
	}

	/// Returns the value to be returned to userspace for the error.
	pub const fn to_syscall(&self) -> isize {
		-(self.0 as isize)
	}
}

impl fmt::Display for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} (errno {})", self.name(), self.0)
	}
}

impl fmt::Debug for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

/// Builds an [`Errno`] from one of the constants of the [`errno`](crate::errno) module.
#[macro_export]
macro_rules! errno {
	($name:ident) => {
		$crate::errno::Errno::new($crate::errno::$name)
	};
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn errno_syscall_convention() {
		assert_eq!(errno!(ENOENT).to_syscall(), -(ENOENT as isize));
		assert!(errno!(EINVAL).to_syscall() < 0);
	}

	#[test]
	fn errno_from_alloc_error() {
		let e: Errno = AllocError.into();
		assert_eq!(e, errno!(ENOMEM));
		assert_eq!(e.name(), "ENOMEM");
	}
}
