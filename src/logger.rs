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

//! Kernel logging.
//!
//! Messages go through the `log` crate's macros. The logger keeps every
//! message in a ring buffer, so logs are retained even when the console is
//! silent, and forwards them to the console sink registered by the external
//! UART/TTY driver.

use crate::sync::IntMutex;
use core::fmt::{self, Write};

/// The size of the kernel logs ring buffer in bytes.
const LOGS_SIZE: usize = 1 << 16;

/// A console sink, registered by the external console driver.
pub type Sink = fn(&[u8]);

/// The kernel's logger.
pub struct Logger {
	/// Tells whether messages are forwarded to the console sink.
	silent: bool,
	/// The console sink, if registered.
	sink: Option<Sink>,

	/// The ring buffer retaining the logs.
	buff: [u8; LOGS_SIZE],
	/// The buffer's writing head.
	write_head: usize,
	/// The number of valid bytes in the buffer.
	len: usize,
}

impl Logger {
	/// Creates a new instance.
	pub const fn new() -> Self {
		Self {
			silent: false,
			sink: None,
			buff: [0; LOGS_SIZE],
			write_head: 0,
			len: 0,
		}
	}

	/// Appends bytes to the ring buffer, overwriting the oldest content
	/// when full.
	fn push(&mut self, bytes: &[u8]) {
		for b in bytes {
			self.buff[self.write_head] = *b;
			self.write_head = (self.write_head + 1) % LOGS_SIZE;
		}
		self.len = (self.len + bytes.len()).min(LOGS_SIZE);
	}

	/// Returns the number of bytes retained in the ring.
	pub fn size(&self) -> usize {
		self.len
	}
}

impl Default for Logger {
	fn default() -> Self {
		Self::new()
	}
}

impl Write for Logger {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		self.push(s.as_bytes());
		if !self.silent {
			if let Some(sink) = self.sink {
				sink(s.as_bytes());
			}
		}
		Ok(())
	}
}

/// The kernel's logger instance.
static LOGGER: IntMutex<Logger> = IntMutex::new(Logger::new());

/// Returns the logger.
pub fn get() -> &'static IntMutex<Logger> {
	&LOGGER
}

/// Registers the console sink.
pub fn set_sink(sink: Sink) {
	LOGGER.lock().sink = Some(sink);
}

/// The `log` crate facade over the kernel's logger.
struct LogFacade;

impl log::Log for LogFacade {
	fn enabled(&self, _metadata: &log::Metadata) -> bool {
		true
	}

	fn log(&self, record: &log::Record) {
		let mut logger = LOGGER.lock();
		let _ = writeln!(logger, "[{:5}] {}", record.level(), record.args());
	}

	fn flush(&self) {}
}

static FACADE: LogFacade = LogFacade;

/// Initializes logging. `silent` keeps messages off the console; they are
/// retained in memory either way.
pub fn init(silent: bool) {
	LOGGER.lock().silent = silent;
	let _ = log::set_logger(&FACADE);
	log::set_max_level(log::LevelFilter::Debug);
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn logger_retains_messages() {
		let mut logger = Logger::new();
		logger.write_str("hello kernel\n").unwrap();
		assert_eq!(logger.size(), 13);
	}

	#[test]
	fn logger_ring_wraps() {
		let mut logger = Logger::new();
		for _ in 0..LOGS_SIZE {
			logger.write_str("0123456789abcdef").unwrap();
		}
		// The ring retains at most its capacity
		assert_eq!(logger.size(), LOGS_SIZE);
	}
}
