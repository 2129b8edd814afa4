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

//! Block devices.
//!
//! Concrete disk drivers live outside of the core; they register their
//! device here with an operations table. I/O on a registered device goes
//! through the page cache (see [`cache`]).

pub mod cache;
pub mod ramdisk;

use crate::{
	errno,
	errno::EResult,
	memory::PAGE_SIZE,
	sync::Mutex,
};
use alloc::{string::String, sync::Arc, vec::Vec};
use cache::PageCache;

/// Operations of a block device driver.
pub trait BlockDeviceOps: Send + Sync {
	/// The size of a block in bytes. Must be a power of two dividing the
	/// page size.
	fn block_size(&self) -> usize;

	/// The number of blocks on the device.
	fn blocks_count(&self) -> u64;

	/// Reads the blocks `[first, first + buf.len() / block_size)` into
	/// `buf`, whose length must be a multiple of the block size.
	fn read_blocks(&self, first: u64, buf: &mut [u8]) -> EResult<()>;

	/// Writes `buf` to the blocks starting at `first`.
	fn write_blocks(&self, first: u64, buf: &[u8]) -> EResult<()>;
}

/// A registered block device.
pub struct BlkDev {
	/// The device's identifier, unique among registered devices.
	pub id: usize,
	/// The device's name.
	pub name: String,
	/// The driver's operations.
	ops: Arc<dyn BlockDeviceOps>,
	/// The device's page cache.
	cache: PageCache,
}

impl BlkDev {
	/// Returns the driver's operations table.
	pub fn ops(&self) -> &Arc<dyn BlockDeviceOps> {
		&self.ops
	}

	/// Returns the device's page cache.
	pub fn cache(&self) -> &PageCache {
		&self.cache
	}

	/// Returns the size of a block in bytes.
	pub fn block_size(&self) -> usize {
		self.ops.block_size()
	}

	/// Reads `buf.len()` bytes at byte offset `off`, through the cache.
	pub fn read(self: &Arc<Self>, off: u64, buf: &mut [u8]) -> EResult<()> {
		self.cache.read(self, off, buf)
	}

	/// Writes `buf` at byte offset `off`, through the cache. The data
	/// reaches the device at the next writeback.
	pub fn write(self: &Arc<Self>, off: u64, buf: &[u8]) -> EResult<()> {
		self.cache.write(self, off, buf)
	}
}

/// The registered block devices.
static DEVICES: Mutex<Vec<Arc<BlkDev>>> = Mutex::new(Vec::new());

/// Registers a block device and returns its handle.
///
/// The driver's block size must be a power of two dividing the page size.
pub fn register_blk(name: String, ops: Arc<dyn BlockDeviceOps>) -> EResult<Arc<BlkDev>> {
	let bs = ops.block_size();
	if !bs.is_power_of_two() || !PAGE_SIZE.is_multiple_of(bs) {
		return Err(errno!(EINVAL));
	}
	let mut devices = DEVICES.lock();
	let dev = Arc::new(BlkDev {
		id: devices.len(),
		name,
		ops,
		cache: PageCache::new(),
	});
	devices.push(dev.clone());
	Ok(dev)
}

/// Returns the block device with the given name.
pub fn get_blk(name: &str) -> EResult<Arc<BlkDev>> {
	DEVICES
		.lock()
		.iter()
		.find(|dev| dev.name == name)
		.cloned()
		.ok_or_else(|| errno!(ENODEV))
}

#[cfg(test)]
mod test {
	use super::*;
	use ramdisk::RamDisk;

	#[test]
	fn device_registry() {
		crate::memory::testing::init();
		let dev =
			register_blk("testdisk0".into(), Arc::new(RamDisk::new(512, 64).unwrap())).unwrap();
		assert_eq!(dev.block_size(), 512);
		let found = get_blk("testdisk0").unwrap();
		assert!(Arc::ptr_eq(&dev, &found));
		let Err(e) = get_blk("nosuchdisk") else {
			panic!("missing device resolved");
		};
		assert_eq!(e, errno!(ENODEV));
	}

	#[test]
	fn device_block_size_validation() {
		struct BadOps;
		impl BlockDeviceOps for BadOps {
			fn block_size(&self) -> usize {
				3000
			}
			fn blocks_count(&self) -> u64 {
				1
			}
			fn read_blocks(&self, _: u64, _: &mut [u8]) -> EResult<()> {
				Ok(())
			}
			fn write_blocks(&self, _: u64, _: &[u8]) -> EResult<()> {
				Ok(())
			}
		}
		let Err(e) = register_blk("bad".into(), Arc::new(BadOps)) else {
			panic!("invalid block size accepted");
		};
		assert_eq!(e, errno!(EINVAL));
	}
}
