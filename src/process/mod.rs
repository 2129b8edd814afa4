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

//! Processes.
//!
//! A process owns an address space, a table of open files, credentials and
//! one or more threads. Processes form a tree rooted at the init process:
//! a terminated process turns into a zombie holding its exit status until
//! its parent reaps it, and orphans are re-parented onto init.

pub mod exec;
pub mod mem_space;
pub mod pid;
pub mod scheduler;
#[cfg(test)]
pub mod testing;
pub mod thread;
pub mod worker;

use crate::{
	errno,
	errno::EResult,
	file::{fd::FdTable, path::PathBuf, perm::AccessProfile},
	limits::PROC_NAME_MAX,
	memory::{vmem::FaultCode, VirtAddr},
	sync::{IntMutex, Mutex, OnceInit, WaitQueue},
};
use alloc::{
	boxed::Box,
	collections::BTreeMap,
	sync::{Arc, Weak},
	vec::Vec,
};
use mem_space::MemSpace;
use pid::{Pid, INIT_PID};
use thread::{State, Thread};

/// A process.
pub struct Process {
	/// The process's identifier.
	pub pid: Pid,
	/// The process's name, nul-padded.
	name: Mutex<[u8; PROC_NAME_MAX]>,

	/// The process's address space.
	mem_space: Arc<IntMutex<MemSpace>>,
	/// The process's threads. The first is the initial thread, whose
	/// identifier equals the process's.
	threads: Mutex<Vec<Arc<Thread>>>,

	/// The process's open files.
	pub fds: Mutex<FdTable>,
	/// The process's credentials.
	pub creds: Mutex<AccessProfile>,
	/// The current working directory.
	pub cwd: Mutex<PathBuf>,

	/// The exit status. `Some` turns the process into a zombie.
	exit_status: IntMutex<Option<i32>>,
	/// The parent process.
	parent: Mutex<Weak<Process>>,
	/// The children processes.
	children: Mutex<Vec<Arc<Process>>>,
	/// Queue on which the parent waits for a child to exit.
	child_exit_queue: WaitQueue,
}

/// Every live process, keyed by identifier.
static PROCESSES: Mutex<BTreeMap<Pid, Arc<Process>>> = Mutex::new(BTreeMap::new());

/// The init process.
static INIT_PROCESS: OnceInit<Arc<Process>> = OnceInit::new();

impl Process {
	/// Allocates a process record.
	fn new(pid: Pid, name: &[u8], parent: Weak<Process>) -> EResult<Arc<Self>> {
		let proc = Arc::new(Self {
			pid,
			name: Mutex::new(Self::pack_name(name)),
			mem_space: Arc::new(IntMutex::new(MemSpace::new()?)),
			threads: Mutex::new(Vec::new()),
			fds: Mutex::new(FdTable::new()),
			creds: Mutex::new(AccessProfile::KERNEL),
			cwd: Mutex::new(PathBuf::root()),
			exit_status: IntMutex::new(None),
			parent: Mutex::new(parent),
			children: Mutex::new(Vec::new()),
			child_exit_queue: WaitQueue::new(),
		});
		PROCESSES.lock().insert(pid, proc.clone());
		Ok(proc)
	}

	/// Packs a name into its fixed-size storage, truncating if needed.
	fn pack_name(name: &[u8]) -> [u8; PROC_NAME_MAX] {
		let mut packed = [0; PROC_NAME_MAX];
		let len = name.len().min(PROC_NAME_MAX - 1);
		packed[..len].copy_from_slice(&name[..len]);
		packed
	}

	/// Returns the process with the given identifier.
	pub fn get_by_pid(pid: Pid) -> Option<Arc<Self>> {
		PROCESSES.lock().get(&pid).cloned()
	}

	/// Returns the init process.
	pub fn init() -> &'static Arc<Self> {
		&*INIT_PROCESS
	}

	/// Returns the process's name.
	pub fn name(&self) -> [u8; PROC_NAME_MAX] {
		*self.name.lock()
	}

	/// Sets the process's name.
	pub fn set_name(&self, name: &[u8]) {
		*self.name.lock() = Self::pack_name(name);
	}

	/// Returns the process's address space.
	pub fn mem_space(&self) -> &Arc<IntMutex<MemSpace>> {
		&self.mem_space
	}

	/// Returns the process's parent, if still alive.
	pub fn parent(&self) -> Option<Arc<Self>> {
		self.parent.lock().upgrade()
	}

	/// Tells whether the process terminated and waits to be reaped.
	pub fn is_zombie(&self) -> bool {
		self.exit_status.lock().is_some()
	}

	/// Returns the exit status, if the process terminated.
	pub fn exit_status(&self) -> Option<i32> {
		*self.exit_status.lock()
	}

	/// Returns the number of live threads.
	pub fn thread_count(&self) -> usize {
		self.threads
			.lock()
			.iter()
			.filter(|t| !matches!(t.state(), State::Zombie | State::Killed))
			.count()
	}

	/// Spawns a kernel-mode thread belonging to the process.
	///
	/// The first spawned thread is the initial thread and shares the
	/// process's identifier.
	pub fn spawn_kernel_thread(
		self: &Arc<Self>,
		f: Box<dyn FnOnce() + Send>,
	) -> EResult<Arc<Thread>> {
		let mut threads = self.threads.lock();
		let thread = if threads.is_empty() {
			Thread::new_kernel_with_tid(self.pid, false, Arc::downgrade(self), f)?
		} else {
			Thread::new_kernel_with_tid(pid::alloc()?, true, Arc::downgrade(self), f)?
		};
		threads.push(thread.clone());
		if let Some(sched) = scheduler::try_get() {
			sched.lock().enqueue(thread.clone());
		}
		Ok(thread)
	}

	/// Duplicates the process for `fork`: the child gets a copy-on-write
	/// duplicate of the address space, shares the open file descriptions
	/// and copies credentials and working directory.
	///
	/// The child has no thread yet; the caller attaches the initial thread
	/// resuming at the duplicated context.
	pub fn fork(self: &Arc<Self>) -> EResult<Arc<Self>> {
		let pid = pid::alloc()?;
		let child = Arc::new(Self {
			pid,
			name: Mutex::new(*self.name.lock()),
			mem_space: Arc::new(IntMutex::new(self.mem_space.lock().fork()?)),
			threads: Mutex::new(Vec::new()),
			fds: Mutex::new(self.fds.lock().duplicate()),
			creds: Mutex::new(*self.creds.lock()),
			cwd: Mutex::new(self.cwd.lock().clone()),
			exit_status: IntMutex::new(None),
			parent: Mutex::new(Arc::downgrade(self)),
			children: Mutex::new(Vec::new()),
			child_exit_queue: WaitQueue::new(),
		});
		self.children.lock().push(child.clone());
		PROCESSES.lock().insert(pid, child.clone());
		Ok(child)
	}

	/// Attaches the initial thread of a forked child, resuming userspace at
	/// the given trap frame.
	pub fn attach_fork_thread(
		self: &Arc<Self>,
		frame: crate::arch::x86::IntFrame,
	) -> EResult<Arc<Thread>> {
		let mut threads = self.threads.lock();
		if !threads.is_empty() {
			return Err(errno!(EBUSY));
		}
		let thread = Thread::new_user(self.pid, false, Arc::downgrade(self), frame)?;
		threads.push(thread.clone());
		if let Some(sched) = scheduler::try_get() {
			sched.lock().enqueue(thread.clone());
		}
		Ok(thread)
	}

	/// Turns the process into a zombie: records the exit status, releases
	/// the address space and open files, kills every thread, hands children
	/// over to init and wakes the waiting parent.
	pub(crate) fn mark_exited(self: &Arc<Self>, status: i32) {
		{
			let mut exit_status = self.exit_status.lock();
			if exit_status.is_some() {
				return;
			}
			*exit_status = Some(status);
		}
		// Kill the threads; the current one, if any, is handled by `exit`
		let threads = core::mem::take(&mut *self.threads.lock());
		let current = scheduler::current_thread();
		for t in &threads {
			let is_current = current
				.as_ref()
				.map(|c| Arc::ptr_eq(c, t))
				.unwrap_or(false);
			if !is_current {
				scheduler::thread_kill(t);
			}
		}
		// Release the resources the zombie does not need anymore
		self.mem_space.lock().clear();
		*self.fds.lock() = FdTable::new();
		// Orphans are re-parented onto init
		let children = core::mem::take(&mut *self.children.lock());
		if let Some(init) = INIT_PROCESS.try_get() {
			if !Arc::ptr_eq(init, self) {
				for child in children {
					*child.parent.lock() = Arc::downgrade(init);
					init.children.lock().push(child);
				}
			}
		}
		// Wake the parent
		if let Some(parent) = self.parent() {
			parent.child_exit_queue.wake_all();
		}
	}

	/// Terminates the process with the given status. Never returns when
	/// called from one of the process's threads.
	pub fn exit(self: &Arc<Self>, status: i32) -> ! {
		self.mark_exited(status);
		let current = scheduler::current_thread().expect("process exit with no current thread");
		scheduler::thread_kill(&current);
		unreachable!();
	}

	/// Reaps one zombie child, if any, removing it from the process tree.
	pub fn try_reap(self: &Arc<Self>) -> Option<(Pid, i32)> {
		let mut children = self.children.lock();
		let i = children.iter().position(|c| c.is_zombie())?;
		let child = children.remove(i);
		PROCESSES.lock().remove(&child.pid);
		let status = child.exit_status().unwrap_or(0);
		Some((child.pid, status))
	}

	/// Waits for a child to terminate and reaps it, returning its
	/// identifier and exit status.
	pub fn wait_child(self: &Arc<Self>) -> EResult<(Pid, i32)> {
		loop {
			if let Some(reaped) = self.try_reap() {
				return Ok(reaped);
			}
			if self.children.lock().is_empty() {
				return Err(errno!(ENOENT));
			}
			self.child_exit_queue.wait()?;
		}
	}
}

impl Drop for Process {
	fn drop(&mut self) {
		pid::free(self.pid);
	}
}

impl core::fmt::Debug for Process {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("Process")
			.field("pid", &self.pid)
			.field("zombie", &self.is_zombie())
			.finish()
	}
}

/// Creates the init process and its initial thread running `entry`.
///
/// Must be called once at boot, after the scheduler is initialized.
pub fn init_kernel_process(entry: Box<dyn FnOnce() + Send>) -> EResult<Arc<Process>> {
	pid::reserve(INIT_PID);
	let proc = Process::new(INIT_PID, b"init", Weak::new())?;
	INIT_PROCESS.init(proc.clone());
	proc.spawn_kernel_thread(entry)?;
	Ok(proc)
}

/// The page fault entry of the process layer: dispatches the fault to the
/// current process's address space.
///
/// Returns `true` if the faulting instruction can be resumed.
pub fn page_fault_handler(addr: VirtAddr, code: FaultCode) -> bool {
	let Some(proc) = scheduler::current_process() else {
		return false;
	};
	let resumable = proc.mem_space().lock().fault(addr, code);
	resumable
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::process::testing as process_testing;

	fn new_proc(name: &[u8]) -> Arc<Process> {
		process_testing::init();
		Process::new(pid::alloc().unwrap(), name, Weak::new()).unwrap()
	}

	#[test]
	fn process_name_packing() {
		let proc = new_proc(b"idle");
		assert_eq!(&proc.name()[..5], b"idle\0");
		proc.set_name(&[b'x'; 100]);
		// The name is truncated to its fixed storage, nul-terminated
		assert_eq!(proc.name()[PROC_NAME_MAX - 1], 0);
	}

	#[test]
	fn process_initial_thread_shares_pid() {
		let proc = new_proc(b"a");
		let t1 = proc.spawn_kernel_thread(Box::new(|| {})).unwrap();
		assert_eq!(t1.tid, proc.pid);
		let t2 = proc.spawn_kernel_thread(Box::new(|| {})).unwrap();
		assert_ne!(t2.tid, proc.pid);
		assert_eq!(proc.thread_count(), 2);
	}

	#[test]
	fn process_fork_resources() {
		let parent = new_proc(b"parent");
		parent.cwd.lock().clone_from(&PathBuf::from_bytes(b"/tmp").unwrap());
		let child = parent.fork().unwrap();
		assert_ne!(child.pid, parent.pid);
		assert!(Arc::ptr_eq(&child.parent().unwrap(), &parent));
		assert_eq!(*child.cwd.lock(), *parent.cwd.lock());
		assert!(Process::get_by_pid(child.pid).is_some());
	}

	#[test]
	fn process_exit_and_reap() {
		let parent = new_proc(b"parent");
		let child = parent.fork().unwrap();
		let child_pid = child.pid;
		assert!(parent.try_reap().is_none());
		child.mark_exited(7);
		assert!(child.is_zombie());
		let (pid, status) = parent.try_reap().unwrap();
		assert_eq!((pid, status), (child_pid, 7));
		// The zombie is gone from the process tree
		assert!(Process::get_by_pid(child_pid).is_none());
		assert!(parent.try_reap().is_none());
	}

	#[test]
	fn process_zombie_invariant() {
		// A process has at least one live thread, or is a zombie
		let proc = new_proc(b"p");
		proc.spawn_kernel_thread(Box::new(|| {})).unwrap();
		assert!(proc.thread_count() >= 1 || proc.is_zombie());
		proc.mark_exited(0);
		assert_eq!(proc.thread_count(), 0);
		assert!(proc.is_zombie());
		// Double exit keeps the first status
		proc.mark_exited(9);
		assert_eq!(proc.exit_status(), Some(0));
	}

	#[test]
	fn process_orphans_reparented() {
		process_testing::init();
		let parent = Process::init().fork().unwrap();
		let orphan = parent.fork().unwrap();
		parent.mark_exited(1);
		// The grandchild now belongs to init
		assert!(Arc::ptr_eq(&orphan.parent().unwrap(), Process::init()));
		// Clean up: reap both from init
		orphan.mark_exited(0);
		while Process::init().try_reap().is_some() {}
	}
}
