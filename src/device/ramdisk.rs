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

//! RAM-backed block device.

use super::BlockDeviceOps;
use crate::{errno, errno::EResult, sync::Mutex};
use alloc::{vec, vec::Vec};

/// A block device storing its content in memory.
pub struct RamDisk {
	/// The size of a block in bytes.
	block_size: usize,
	/// The disk's content.
	data: Mutex<Vec<u8>>,
}

impl RamDisk {
	/// Creates a zero-filled RAM disk of `blocks` blocks of `block_size`
	/// bytes.
	pub fn new(block_size: usize, blocks: u64) -> EResult<Self> {
		if !block_size.is_power_of_two() {
			return Err(errno!(EINVAL));
		}
		Ok(Self {
			block_size,
			data: Mutex::new(vec![0; block_size * blocks as usize]),
		})
	}

	/// Returns the byte range covered by a block run, checking bounds.
	fn range(&self, first: u64, len: usize) -> EResult<(usize, usize)> {
		if !len.is_multiple_of(self.block_size) {
			return Err(errno!(EINVAL));
		}
		let start = first as usize * self.block_size;
		let end = start.checked_add(len).ok_or_else(|| errno!(EINVAL))?;
		if end > self.data.lock().len() {
			return Err(errno!(EINVAL));
		}
		Ok((start, end))
	}
}

impl BlockDeviceOps for RamDisk {
	fn block_size(&self) -> usize {
		self.block_size
	}

	fn blocks_count(&self) -> u64 {
		(self.data.lock().len() / self.block_size) as u64
	}

	fn read_blocks(&self, first: u64, buf: &mut [u8]) -> EResult<()> {
		let (start, end) = self.range(first, buf.len())?;
		buf.copy_from_slice(&self.data.lock()[start..end]);
		Ok(())
	}

	fn write_blocks(&self, first: u64, buf: &[u8]) -> EResult<()> {
		let (start, end) = self.range(first, buf.len())?;
		self.data.lock()[start..end].copy_from_slice(buf);
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn ramdisk_read_write() {
		let disk = RamDisk::new(512, 8).unwrap();
		let pattern = [0x5a_u8; 1024];
		disk.write_blocks(2, &pattern).unwrap();
		let mut buf = [0_u8; 512];
		disk.read_blocks(3, &mut buf).unwrap();
		assert_eq!(buf, [0x5a; 512]);
		disk.read_blocks(4, &mut buf).unwrap();
		assert_eq!(buf, [0; 512]);
	}

	#[test]
	fn ramdisk_bounds() {
		let disk = RamDisk::new(512, 4);
		let disk = disk.unwrap();
		let mut buf = [0_u8; 512];
		assert!(disk.read_blocks(4, &mut buf).is_err());
		// Partial-block transfers are refused
		assert!(disk.read_blocks(0, &mut buf[..100]).is_err());
	}
}
