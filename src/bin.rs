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

//! This module exists only to export the kernel, compiled as a library, as
//! an executable. The entry point is provided by the external boot
//! trampoline, which then calls into the library.

#![cfg_attr(target_arch = "x86", no_std, no_main)]

extern crate kernel;

// On other targets, the wrapper is inert; it only exists so the crate
// builds everywhere
#[cfg(not(target_arch = "x86"))]
fn main() {}
