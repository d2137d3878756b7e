use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::unistd::{close, read, write};

/// Callback invoked when a fence FD becomes readable or times out. Receives
/// no arguments beyond what the caller captured — the watcher thread must
/// never be the place heavy per-frame resources get dropped from (see
/// `DESIGN.md`).
pub type FenceCallback = Box<dyn FnOnce() + Send>;

struct FenceEntry {
	callback: Mutex<Option<FenceCallback>>,
	expires_at: Instant,
}

/// Process-wide singleton: a single epoll thread that retires out-fences
/// from KMS commits. `watch_fence` arms a fence FD edge-triggered and
/// returns immediately; the loop thread invokes the callback on readability
/// or on a 50ms-granularity timeout sweep, whichever comes first.
pub struct FenceWatcher {
	epoll: Epoll,
	wake_fd: EventFd,
	entries: Mutex<HashMap<RawFd, FenceEntry>>,
	running: Arc<AtomicBool>,
	loop_thread: Mutex<Option<JoinHandle<()>>>,
}

const WAKE_TOKEN: u64 = u64::MAX;

impl FenceWatcher {
	pub fn new() -> std::io::Result<Arc<Self>> {
		let epoll = Epoll::new(EpollCreateFlags::empty())?;
		let wake_fd = EventFd::from_flags(EfdFlags::EFD_NONBLOCK)?;
		epoll.add(&wake_fd, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))?;

		let watcher = Arc::new(Self {
			epoll,
			wake_fd,
			entries: Mutex::new(HashMap::new()),
			running: Arc::new(AtomicBool::new(true)),
			loop_thread: Mutex::new(None),
		});

		let thread_watcher = watcher.clone();
		let handle = std::thread::Builder::new()
			.name("fence-watcher".into())
			.spawn(move || thread_watcher.event_loop())
			.expect("failed to spawn fence-watcher thread");
		*watcher.loop_thread.lock().unwrap() = Some(handle);

		Ok(watcher)
	}

	/// Arms `fd` edge-triggered and stores `(callback, expire_at)`. If arming
	/// fails for a reason other than "already registered" (`EEXIST`, which we
	/// degrade to `EPOLL_CTL_MOD`), the callback fires immediately rather
	/// than being silently dropped.
	pub fn watch_fence(&self, fd: RawFd, callback: FenceCallback, timeout: Duration) {
		let entry = FenceEntry { callback: Mutex::new(Some(callback)), expires_at: Instant::now() + timeout };

		let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
		let add_result = self.epoll.add(borrowed, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64));
		let armed = match add_result {
			Ok(()) => true,
			Err(nix::errno::Errno::EEXIST) => self.epoll.modify(borrowed, &mut EpollEvent::new(EpollFlags::EPOLLIN, fd as u64)).is_ok(),
			Err(_) => false,
		};

		if !armed {
			if let Some(cb) = entry.callback.lock().unwrap().take() {
				cb();
			}
			return;
		}

		self.entries.lock().unwrap().insert(fd, entry);
	}

	fn trigger(&self, fd: RawFd) {
		let entry = self.entries.lock().unwrap().remove(&fd);
		if let Some(entry) = entry {
			if let Some(cb) = entry.callback.lock().unwrap().take() {
				cb();
			}
		}
		let _ = close(fd);
	}

	fn event_loop(&self) {
		let mut events = [EpollEvent::empty(); 16];
		while self.running.load(Ordering::Acquire) {
			let n = match self.epoll.wait(&mut events, 50u16) {
				Ok(n) => n,
				Err(nix::errno::Errno::EINTR) => continue,
				Err(_) => break,
			};

			for event in events.iter().take(n) {
				let token = event.data();
				if token == WAKE_TOKEN {
					let mut buf = [0u8; 8];
					let _ = read(self.wake_fd.as_raw_fd(), &mut buf);
					continue;
				}
				self.trigger(token as RawFd);
			}

			let now = Instant::now();
			let expired: Vec<RawFd> = self
				.entries
				.lock()
				.unwrap()
				.iter()
				.filter(|(_, entry)| entry.expires_at <= now)
				.map(|(fd, _)| *fd)
				.collect();
			for fd in expired {
				self.trigger(fd);
			}
		}

		// Shutdown: whatever fences are still outstanding get closed without
		// invoking their callback — the owning commit is being torn down.
		let mut entries = self.entries.lock().unwrap();
		for (fd, _) in entries.drain() {
			let _ = close(fd);
		}
	}

	pub fn shutdown(&self) {
		if !self.running.swap(false, Ordering::AcqRel) {
			return;
		}
		let _ = write(&self.wake_fd, &1u64.to_ne_bytes());
		if let Some(handle) = self.loop_thread.lock().unwrap().take() {
			let _ = handle.join();
		}
	}
}

impl Drop for FenceWatcher {
	fn drop(&mut self) {
		self.shutdown();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::mpsc;

	#[test]
	fn timeout_invokes_callback_without_fd_ever_signaling() {
		let watcher = FenceWatcher::new().unwrap();
		let (tx, rx) = mpsc::channel();

		// A pipe whose read end we never write to: it never becomes readable,
		// so only the timeout sweep can trigger the callback.
		let (read_fd, _write_fd) = nix::unistd::pipe().unwrap();
		let raw = read_fd.as_raw_fd();
		std::mem::forget(read_fd);

		let start = Instant::now();
		watcher.watch_fence(raw, Box::new(move || tx.send(()).unwrap()), Duration::from_millis(100));

		rx.recv_timeout(Duration::from_millis(300)).expect("callback did not fire on timeout");
		assert!(start.elapsed() < Duration::from_millis(300));
	}
}
