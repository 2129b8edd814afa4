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

//! POSIX-style limits of the system.

/// Maximum number of file descriptors a process can have open at once.
pub const OPEN_MAX: usize = 64;
/// Maximum length of a filename, not including the nul byte.
pub const NAME_MAX: usize = 255;
/// Maximum length of a path, including the nul byte.
pub const PATH_MAX: usize = 4096;
/// Maximum length of a process name, including the nul byte.
pub const PROC_NAME_MAX: usize = 32;
/// Maximum number of symbolic links in a path resolution.
pub const SYMLOOP_MAX: usize = 8;
