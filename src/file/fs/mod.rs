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

//! Filesystems.
//!
//! A filesystem driver registers a [`FilesystemType`] under a short name;
//! mount requests resolve the name through the registry and ask the type to
//! instantiate itself against a block device.

pub mod tmp;

use crate::{
	device::BlkDev,
	errno,
	errno::EResult,
	file::vfs::node::Vnode,
	sync::Mutex,
};
use alloc::{sync::Arc, vec::Vec};

/// An instance of a mounted filesystem.
pub trait Filesystem: Send + Sync {
	/// Returns the name of the filesystem's type.
	fn name(&self) -> &'static str;

	/// Returns the root node of the filesystem.
	fn root(&self) -> EResult<Arc<Vnode>>;

	/// Tells whether the filesystem is read-only.
	fn is_readonly(&self) -> bool {
		false
	}

	/// Flushes pending changes to the underlying device.
	fn sync(&self) -> EResult<()> {
		Ok(())
	}
}

/// A filesystem type, able to instantiate filesystems from a device.
pub trait FilesystemType: Send + Sync {
	/// Returns the short name the type registers under.
	fn name(&self) -> &'static str;

	/// Instantiates a filesystem against the given device, if any.
	fn load(&self, dev: Option<Arc<BlkDev>>) -> EResult<Arc<dyn Filesystem>>;
}

/// The filesystem type registry.
static TYPES: Mutex<Vec<Arc<dyn FilesystemType>>> = Mutex::new(Vec::new());

/// Registers a filesystem type. Type names are unique; a second
/// registration under the same name is ignored.
pub fn register<T: FilesystemType + 'static>(fs_type: T) {
	let mut types = TYPES.lock();
	if types.iter().any(|t| t.name() == fs_type.name()) {
		return;
	}
	types.push(Arc::new(fs_type));
}

/// Returns the filesystem type registered under `name`.
pub fn get_type(name: &str) -> EResult<Arc<dyn FilesystemType>> {
	TYPES
		.lock()
		.iter()
		.find(|t| t.name() == name)
		.cloned()
		.ok_or_else(|| errno!(ENODEV))
}

/// Registers the filesystem types implemented inside the kernel itself.
pub fn register_defaults() {
	register(tmp::TmpFsType);
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn fs_registry() {
		register_defaults();
		let fs_type = get_type("tmpfs").unwrap();
		assert_eq!(fs_type.name(), "tmpfs");
		assert!(get_type("no-such-fs").is_err());
	}
}
