//! Background udev "drm" subsystem watcher. One per process, started lazily
//! the first time a `DeviceController` asks to be kept in sync with
//! hotplug. A connector change on most SoCs fires several udev events in
//! quick succession (the HDMI hotplug line bounces, the kernel re-reads
//! EDID, ...), so events are debounced per (subsystem, devpath, action) key,
//! and a short settle delay is given before resources are re-enumerated so
//! the kernel has finished settling by the time `drmModeGetConnector` runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use super::device::DeviceController;

const DEBOUNCE: Duration = Duration::from_millis(500);
const SETTLE: Duration = Duration::from_millis(600);
const STALE_AFTER: Duration = Duration::from_secs(5);

pub struct UdevMonitor {
	running: Arc<AtomicBool>,
	thread: Mutex<Option<JoinHandle<()>>>,
}

static INSTANCE: OnceLock<UdevMonitor> = OnceLock::new();

impl UdevMonitor {
	/// Starts the singleton watcher on first call; later calls with a
	/// different `device` are ignored; this process only ever manages one
	/// DRM node, so that's never actually exercised.
	pub fn watch(device: Arc<DeviceController>) {
		INSTANCE.get_or_init(|| Self::start(device));
	}

	fn start(device: Arc<DeviceController>) -> Self {
		let running = Arc::new(AtomicBool::new(true));
		let thread_running = running.clone();
		let thread = std::thread::Builder::new()
			.name("udev-monitor".into())
			.spawn(move || Self::run(device, thread_running))
			.expect("failed to spawn udev monitor thread");
		Self { running, thread: Mutex::new(Some(thread)) }
	}

	fn run(device: Arc<DeviceController>, running: Arc<AtomicBool>) {
		let socket = match udev::MonitorBuilder::new().and_then(|b| b.match_subsystem("drm")).and_then(|b| b.listen()) {
			Ok(socket) => socket,
			Err(e) => {
				tracing::warn!("udev monitor disabled, failed to open netlink socket: {e}");
				return;
			}
		};

		let epoll = match Epoll::new(EpollCreateFlags::empty()) {
			Ok(epoll) => epoll,
			Err(e) => {
				tracing::warn!("udev monitor disabled, epoll_create1 failed: {e}");
				return;
			}
		};
		if let Err(e) = epoll.add(&socket, EpollEvent::new(EpollFlags::EPOLLIN, 0)) {
			tracing::warn!("udev monitor disabled, epoll_ctl failed: {e}");
			return;
		}

		let mut last_trigger: HashMap<String, Instant> = HashMap::new();
		let mut events = [EpollEvent::empty(); 8];

		while running.load(Ordering::Acquire) {
			let n = match epoll.wait(&mut events, EpollTimeout::try_from(1000u16).unwrap_or(EpollTimeout::NONE)) {
				Ok(n) => n,
				Err(nix::errno::Errno::EINTR) => continue,
				Err(e) => {
					tracing::warn!("udev monitor epoll_wait failed: {e}");
					break;
				}
			};
			if n == 0 {
				continue;
			}

			for event in socket.iter() {
				if !matches!(event.event_type(), udev::EventType::Add | udev::EventType::Remove | udev::EventType::Change) {
					continue;
				}
				let subsystem = event.subsystem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
				let devpath = event.devpath().to_string_lossy().into_owned();
				let key = format!("{subsystem}:{devpath}:{:?}", event.event_type());

				let now = Instant::now();
				let should_trigger = match last_trigger.get(&key) {
					Some(&last) if now.duration_since(last) < DEBOUNCE => false,
					_ => true,
				};
				last_trigger.retain(|_, t| now.duration_since(*t) < STALE_AFTER);
				if !should_trigger {
					continue;
				}
				last_trigger.insert(key, now);

				std::thread::sleep(SETTLE);
				device.notify_pre_refresh();
				if let Err(e) = device.refresh_resources() {
					tracing::warn!("hotplug-triggered refresh_resources failed: {e}");
				}
				device.notify_post_refresh();
			}
		}
	}
}

impl Drop for UdevMonitor {
	fn drop(&mut self) {
		self.running.store(false, Ordering::Release);
		if let Some(handle) = self.thread.lock().unwrap().take() {
			let _ = handle.join();
		}
	}
}
