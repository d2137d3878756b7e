use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use drm_fourcc::DrmFourcc;

use crate::dma::DmaBuffer;
use crate::error::{PipelineError, Result};
use crate::fence::FenceWatcher;
use crate::thread_pauser::ThreadPauser;

use super::device::{DeviceController, PlaneType};
use super::layer::DrmLayer;
use super::compositor::PlanesCompositor;

/// Opaque handle to a plane registered with a `DisplayManager`. Copyable;
/// `valid()` iff the wrapped id is non-negative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneHandle(i32);

impl PlaneHandle {
	pub const INVALID: PlaneHandle = PlaneHandle(-1);

	pub fn valid(&self) -> bool {
		self.0 >= 0
	}
}

#[derive(Clone, Debug)]
pub struct PlaneConfig {
	pub plane_type: PlaneType,
	pub src_w: u32,
	pub src_h: u32,
	pub drm_format: DrmFourcc,
	pub z_order: i64,
}

/// Opaque drop guard kept alive until the buffers it corresponds to have
/// been retired from the scanout cache, e.g. a ref-counted `v4l2::Frame`.
pub type FrameHolder = Box<dyn Any + Send>;

struct PendingFrame {
	plane_id: u32,
	layer: Arc<DrmLayer>,
	pending_buffers: Mutex<Option<Vec<DmaBuffer>>>,
	displayed_holder: Mutex<Option<FrameHolder>>,
	ready: AtomicBool,
}

/// Owns the plane compositor and the single thread allowed to issue atomic
/// commits. Enforces "at most one commit in flight": a new commit is only
/// built once the previous commit's out-fence has signaled.
pub struct DisplayManager {
	device: Arc<DeviceController>,
	compositor: Arc<PlanesCompositor>,
	fence_watcher: Arc<FenceWatcher>,
	pauser: Arc<ThreadPauser>,
	slots: Mutex<Vec<PendingFrame>>,
	refreshing: AtomicBool,
	commit_in_flight: AtomicBool,
	wake: Condvar,
	wake_lock: Mutex<()>,
	running: Arc<AtomicBool>,
	loop_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DisplayManager {
	pub fn new(device: Arc<DeviceController>) -> Result<Arc<Self>> {
		device.refresh_resources()?;
		let crtc_id = device
			.devices()
			.first()
			.map(|d| d.crtc_id)
			.ok_or_else(|| PipelineError::CapabilityMissing("no connected display".into()))?;

		let compositor = Arc::new(PlanesCompositor::new(device.clone(), crtc_id));
		let fence_watcher = FenceWatcher::new().map_err(PipelineError::Io)?;
		let pauser = Arc::new(ThreadPauser::new()?);

		let manager = Arc::new(Self {
			device: device.clone(),
			compositor,
			fence_watcher,
			pauser,
			slots: Mutex::new(Vec::new()),
			refreshing: AtomicBool::new(false),
			commit_in_flight: AtomicBool::new(false),
			wake: Condvar::new(),
			wake_lock: Mutex::new(()),
			running: Arc::new(AtomicBool::new(true)),
			loop_thread: Mutex::new(None),
		});

		manager.register_hotplug_callbacks();

		let thread_manager = manager.clone();
		let handle = std::thread::Builder::new()
			.name("display-main-loop".into())
			.spawn(move || thread_manager.main_loop())
			.map_err(PipelineError::Io)?;
		*manager.loop_thread.lock().unwrap() = Some(handle);

		Ok(manager)
	}

	fn main_loop(self: Arc<Self>) {
		while self.running.load(Ordering::Acquire) {
			{
				let guard = self.wake_lock.lock().unwrap();
				let _ = self.wake.wait_timeout(guard, Duration::from_millis(50));
			}
			if !self.running.load(Ordering::Acquire) {
				break;
			}
			if self.refreshing.load(Ordering::Acquire) {
				continue;
			}
			if self.commit_in_flight.swap(true, Ordering::AcqRel) {
				continue;
			}
			if !self.try_commit_ready_frames() {
				self.commit_in_flight.store(false, Ordering::Release);
			}
		}
	}

	fn register_hotplug_callbacks(self: &Arc<Self>) {
		let pre = {
			let manager = self.clone();
			Box::new(move || manager.on_pre_refresh()) as super::device::PreRefreshFn
		};
		let post = {
			let manager = self.clone();
			Box::new(move || manager.on_post_refresh()) as super::device::PostRefreshFn
		};
		self.device.register_resource_callback(pre, post);
	}

	fn on_pre_refresh(&self) {
		self.refreshing.store(true, Ordering::Release);
		self.pauser.pause();
		for slot in self.slots.lock().unwrap().iter() {
			*slot.pending_buffers.lock().unwrap() = None;
			*slot.displayed_holder.lock().unwrap() = None;
			slot.ready.store(false, Ordering::Release);
		}
	}

	fn on_post_refresh(&self) {
		if self.device.devices().is_empty() {
			return;
		}
		self.refreshing.store(false, Ordering::Release);
		self.pauser.resume();
		let _guard = self.wake_lock.lock().unwrap();
		self.wake.notify_all();
	}

	pub fn create_plane(&self, config: PlaneConfig) -> Result<PlaneHandle> {
		let candidates = self.device.possible_planes(config.plane_type, config.drm_format);
		let plane_id = *candidates
			.first()
			.ok_or_else(|| PipelineError::CapabilityMissing(format!("no {:?} plane supports {:?}", config.plane_type, config.drm_format)))?;

		let kind = match config.plane_type {
			PlaneType::Primary => super::layer::PlaneKind::Primary,
			PlaneType::Overlay => super::layer::PlaneKind::Overlay,
			PlaneType::Cursor => super::layer::PlaneKind::Cursor,
		};
		let layer = Arc::new(DrmLayer::new(kind, plane_id, 3));
		layer.set_property("SRC_W", super::layer::PropertyValue::UInt(config.src_w as u64))?;
		layer.set_property("SRC_H", super::layer::PropertyValue::UInt(config.src_h as u64))?;
		layer.set_property("CRTC_W", super::layer::PropertyValue::UInt(config.src_w as u64))?;
		layer.set_property("CRTC_H", super::layer::PropertyValue::UInt(config.src_h as u64))?;
		layer.set_property("zpos", super::layer::PropertyValue::Int(config.z_order))?;
		if let Some(device_ptr) = self.device.devices().first() {
			layer.set_property("CRTC_ID", super::layer::PropertyValue::UInt(u32::from(device_ptr.crtc_id) as u64))?;
		}

		self.compositor.add_layer(plane_id, layer.clone())?;

		let mut slots = self.slots.lock().unwrap();
		let handle = PlaneHandle(slots.len() as i32);
		slots.push(PendingFrame {
			plane_id,
			layer,
			pending_buffers: Mutex::new(None),
			displayed_holder: Mutex::new(None),
			ready: AtomicBool::new(false),
		});
		Ok(handle)
	}

	/// Hands the plane new content. `holder` is kept alive until the buffers
	/// it backs are no longer possibly on-screen (the fence for the commit
	/// that retires them has signaled).
	pub fn present_frame(&self, handle: PlaneHandle, buffers: Vec<DmaBuffer>, holder: FrameHolder) -> Result<()> {
		if !handle.valid() {
			return Err(PipelineError::InvalidState("invalid plane handle".into()));
		}
		let slots = self.slots.lock().unwrap();
		let slot = slots
			.get(handle.0 as usize)
			.ok_or_else(|| PipelineError::InvalidState("plane handle out of range".into()))?;

		*slot.pending_buffers.lock().unwrap() = Some(buffers);
		*slot.displayed_holder.lock().unwrap() = Some(holder);
		slot.ready.store(true, Ordering::Release);
		drop(slots);

		let _guard = self.wake_lock.lock().unwrap();
		self.wake.notify_all();
		Ok(())
	}

	/// Builds framebuffers for any plane with pending content, issues one
	/// atomic commit, and arms the fence watcher to retire old framebuffers
	/// and clear `commit_in_flight` once the commit lands. Returns `false`
	/// if nothing was submitted (no fence will ever signal to clear the
	/// flag, so the caller must clear it itself).
	fn try_commit_ready_frames(self: &Arc<Self>) -> bool {
		let slots = self.slots.lock().unwrap();
		let mut any_submitted = false;
		for slot in slots.iter() {
			if !slot.ready.swap(false, Ordering::AcqRel) {
				continue;
			}
			let buffers = slot.pending_buffers.lock().unwrap().take();
			let Some(buffers) = buffers else { continue };
			if slot.layer.update_buffer(&self.device, &buffers).is_ok() {
				// The buffers themselves are retained by the framebuffer's
				// GEM handles in the kernel; DmaBuffer only needs to outlive
				// this call, not the commit.
				any_submitted = true;
			}
		}
		drop(slots);

		if !any_submitted {
			return false;
		}

		let out_fence = match self.compositor.commit() {
			Ok(fd) => fd,
			Err(_) => return false,
		};
		if out_fence < 0 {
			return false;
		}

		let manager = self.clone();
		self.fence_watcher.watch_fence(
			out_fence,
			Box::new(move || {
				let device = manager.device.clone();
				let layers: Vec<Arc<DrmLayer>> = manager.slots.lock().unwrap().iter().map(|s| s.layer.clone()).collect();
				for layer in &layers {
					layer.on_fence_signaled(&device);
				}
				manager.commit_in_flight.store(false, Ordering::Release);
				let _guard = manager.wake_lock.lock().unwrap();
				manager.wake.notify_all();
			}),
			Duration::from_millis(500),
		);
		true
	}

	pub fn plane_ids(&self) -> Vec<u32> {
		self.slots.lock().unwrap().iter().map(|s| s.plane_id).collect()
	}

	pub fn shutdown(&self) {
		self.running.store(false, Ordering::Release);
		self.pauser.close();
		{
			let _guard = self.wake_lock.lock().unwrap();
			self.wake.notify_all();
		}
		if let Some(handle) = self.loop_thread.lock().unwrap().take() {
			let _ = handle.join();
		}
	}
}

impl Drop for DisplayManager {
	fn drop(&mut self) {
		self.shutdown();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn invalid_handle_is_negative() {
		assert!(!PlaneHandle::INVALID.valid());
		assert!(PlaneHandle(0).valid());
	}
}
