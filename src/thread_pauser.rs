use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::unistd::write;

use crate::error::{PipelineError, Result};

/// Pause/resume primitive for worker threads, built over an eventfd in
/// semaphore mode plus an atomic flag.
///
/// `wait_if_paused` fast-paths when not paused; the slow path blocks reading
/// the eventfd until `resume()` writes a token, looping on spurious wakeups
/// and `EINTR`. `close()` is idempotent and wakes every waiter so they can
/// observe shutdown instead of blocking forever.
pub struct ThreadPauser {
	event_fd: EventFd,
	paused: AtomicBool,
	closed: AtomicBool,
}

impl ThreadPauser {
	pub fn new() -> Result<Self> {
		let event_fd = EventFd::from_flags(EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_SEMAPHORE).map_err(|e| PipelineError::IoctlFailed { op: "eventfd", errno: e })?;
		Ok(Self { event_fd, paused: AtomicBool::new(false), closed: AtomicBool::new(false) })
	}

	pub fn pause(&self) {
		self.paused.store(true, Ordering::Release);
	}

	pub fn resume(&self) {
		self.paused.store(false, Ordering::Release);
		let _ = write(&self.event_fd.as_fd_owned(), &1u64.to_ne_bytes());
	}

	pub fn toggle(&self) {
		if self.is_paused() {
			self.resume();
		} else {
			self.pause();
		}
	}

	pub fn is_paused(&self) -> bool {
		self.paused.load(Ordering::Acquire)
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Blocks until not paused. Returns immediately if never paused.
	pub fn wait_if_paused(&self) {
		let _ = self.wait_if_paused_for(None);
	}

	/// Blocks until not paused or `timeout` elapses; returns `false` on timeout.
	pub fn wait_if_paused_for(&self, timeout: Option<Duration>) -> bool {
		loop {
			if !self.is_paused() || self.is_closed() {
				return true;
			}
			let fd = self.event_fd.as_fd_owned();
			let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
			let poll_timeout: PollTimeout = match timeout {
				Some(d) => PollTimeout::from(d.as_millis().min(i32::MAX as u128) as u16),
				None => PollTimeout::NONE,
			};
			match poll(&mut fds, poll_timeout) {
				Ok(0) => return false,
				Ok(_) => {
					// Drain the eventfd counter; spurious-wake safe because we
					// re-check `paused` at the top of the loop.
					let mut buf = [0u8; 8];
					let _ = nix::unistd::read(fd.as_raw_fd(), &mut buf);
				}
				Err(nix::errno::Errno::EINTR) => continue,
				Err(_) => return false,
			}
		}
	}

	pub fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.paused.store(false, Ordering::Release);
		let _ = write(&self.event_fd.as_fd_owned(), &1u64.to_ne_bytes());
	}
}

trait EventFdExt {
	fn as_fd_owned(&self) -> std::os::fd::BorrowedFd<'_>;
}

impl EventFdExt for EventFd {
	fn as_fd_owned(&self) -> std::os::fd::BorrowedFd<'_> {
		use std::os::fd::AsFd;
		self.as_fd()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn not_paused_returns_immediately() {
		let pauser = ThreadPauser::new().unwrap();
		assert!(pauser.wait_if_paused_for(Some(Duration::from_millis(10))));
	}

	#[test]
	fn pause_then_resume_releases_waiter() {
		let pauser = std::sync::Arc::new(ThreadPauser::new().unwrap());
		pauser.pause();

		let waiter = {
			let pauser = pauser.clone();
			std::thread::spawn(move || pauser.wait_if_paused_for(Some(Duration::from_secs(2))))
		};

		std::thread::sleep(Duration::from_millis(20));
		pauser.resume();
		assert!(waiter.join().unwrap());
	}

	#[test]
	fn close_wakes_waiters_without_losing_pause_semantics() {
		let pauser = std::sync::Arc::new(ThreadPauser::new().unwrap());
		pauser.pause();
		let waiter = {
			let pauser = pauser.clone();
			std::thread::spawn(move || pauser.wait_if_paused_for(Some(Duration::from_secs(2))))
		};
		std::thread::sleep(Duration::from_millis(20));
		pauser.close();
		assert!(waiter.join().unwrap());
		assert!(pauser.is_closed());
	}
}
