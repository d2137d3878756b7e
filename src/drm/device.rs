use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::Path;
use std::sync::{Arc, Mutex};

use drm::control::{atomic, connector, crtc, property, AtomicCommitFlags, Device as ControlDevice, Mode, ResourceHandle};
use drm_fourcc::DrmFourcc;

use crate::error::{PipelineError, Result};

use super::udev_monitor::UdevMonitor;

/// One bound connector+CRTC+mode combination, discovered during enumeration.
/// Cached after enumeration; invalidated on hot-plug.
#[derive(Clone, Debug)]
pub struct DevicePtr {
	pub connector_id: connector::Handle,
	pub crtc_id: crtc::Handle,
	pub width: u32,
	pub height: u32,
	/// The CRTC's configuration before we bound it, so it can be restored.
	pub previous_crtc: Option<crtc::Handle>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaneType {
	Primary,
	Overlay,
	Cursor,
}

#[derive(Clone, Debug)]
pub struct PlaneCacheEntry {
	pub plane_type: PlaneType,
	pub supported_fourccs: Vec<DrmFourcc>,
}

pub type PreRefreshFn = Box<dyn Fn() + Send + Sync>;
pub type PostRefreshFn = Box<dyn Fn() + Send + Sync>;

struct State {
	devices: Vec<DevicePtr>,
	planes: HashMap<u32, PlaneCacheEntry>,
	callbacks: Vec<(PreRefreshFn, PostRefreshFn)>,
}

/// Process-wide DRM device singleton. The device FD is guarded by a single
/// mutex across every ioctl (`ioctl_lock`); `state` caches enumeration
/// results separately so readers don't contend with in-flight ioctls.
pub struct DeviceController {
	fd: File,
	ioctl_lock: Mutex<()>,
	state: Mutex<State>,
}

impl AsFd for DeviceController {
	fn as_fd(&self) -> BorrowedFd<'_> {
		self.fd.as_fd()
	}
}

impl drm::Device for DeviceController {}
impl ControlDevice for DeviceController {}

impl DeviceController {
	pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
		let fd = OpenOptions::new()
			.read(true)
			.write(true)
			.open(path.as_ref())
			.map_err(|e| PipelineError::DeviceOpenFailed(format!("{}: {e}", path.as_ref().display())))?;

		let controller = Self {
			fd,
			ioctl_lock: Mutex::new(()),
			state: Mutex::new(State { devices: Vec::new(), planes: HashMap::new(), callbacks: Vec::new() }),
		};

		{
			let _guard = controller.ioctl_lock.lock().unwrap();
			let caps = controller.get_driver_capabilities().map_err(|e| {
				PipelineError::IoctlFailed { op: "DRM_IOCTL_GET_CAP", errno: io_err_to_errno(&e) }
			})?;
			if !caps.has_dumb_buffer() {
				return Err(PipelineError::CapabilityMissing("DRM_CAP_DUMB_BUFFER".into()));
			}
		}

		Ok(controller)
	}

	pub fn register_resource_callback(&self, pre: PreRefreshFn, post: PostRefreshFn) {
		self.state.lock().unwrap().callbacks.push((pre, post));
	}

	pub fn devices(&self) -> Vec<DevicePtr> {
		self.state.lock().unwrap().devices.clone()
	}

	pub fn possible_planes(&self, plane_type: PlaneType, format: DrmFourcc) -> Vec<u32> {
		self.state
			.lock()
			.unwrap()
			.planes
			.iter()
			.filter(|(_, e)| e.plane_type == plane_type && e.supported_fourccs.contains(&format))
			.map(|(id, _)| *id)
			.collect()
	}

	pub fn plane_by_id(&self, id: u32) -> Option<PlaneCacheEntry> {
		self.state.lock().unwrap().planes.get(&id).cloned()
	}

	/// Enumerate connectors/CRTCs, pick the preferred mode for each connected
	/// connector, bind it to a CRTC with an atomic modeset (reusing the
	/// connector's current CRTC when it's still free, otherwise scanning its
	/// encoders' `possible_crtcs` the way `setUpDevice`/`bindConn2Crtc` do),
	/// and repopulate the plane cache.
	pub fn refresh_resources(&self) -> Result<()> {
		let _guard = self.ioctl_lock.lock().unwrap();

		let res = self
			.resource_handles()
			.map_err(|e| PipelineError::IoctlFailed { op: "DRM_IOCTL_MODE_GETRESOURCES", errno: io_err_to_errno(&e) })?;

		let mut devices = Vec::new();
		let mut occupied: Vec<crtc::Handle> = Vec::new();
		for &conn_id in res.connectors() {
			let info = match self.get_connector(conn_id, true) {
				Ok(info) => info,
				Err(_) => continue,
			};
			if info.state() != connector::State::Connected {
				continue;
			}
			let mode = match info.modes().first() {
				Some(m) => *m,
				None => continue,
			};

			let previous_crtc = info.current_encoder().and_then(|enc| self.get_encoder(enc).ok()).and_then(|e| e.crtc());

			let crtc_id = match self.bind_connector_to_crtc(&res, &info, conn_id, mode, previous_crtc, &mut occupied) {
				Some(c) => c,
				None => continue,
			};

			devices.push(DevicePtr {
				connector_id: conn_id,
				crtc_id,
				width: mode.size().0 as u32,
				height: mode.size().1 as u32,
				previous_crtc,
			});
		}

		let mut planes = HashMap::new();
		if let Ok(plane_res) = self.plane_handles() {
			for &plane_id in plane_res.as_ref() {
				if let Ok(info) = self.get_plane(plane_id) {
					let plane_type = self.classify_plane(plane_id).unwrap_or(PlaneType::Overlay);
					let supported_fourccs = info.formats().iter().filter_map(|f| DrmFourcc::try_from(*f).ok()).collect();
					planes.insert(u32::from(plane_id), PlaneCacheEntry { plane_type, supported_fourccs });
				}
			}
		}

		let mut state = self.state.lock().unwrap();
		state.devices = devices;
		state.planes = planes;
		Ok(())
	}

	/// Picks a free CRTC for `conn_id` (reusing `reuse` when it isn't already
	/// claimed by an earlier connector this pass, otherwise scanning the
	/// connector's encoders' `possible_crtcs`) and issues the atomic commit
	/// that activates it: CRTC `ACTIVE=1`, `MODE_ID=<mode blob>`, connector
	/// `CRTC_ID=<crtc>`. Must be called with `ioctl_lock` already held by the
	/// caller (`refresh_resources`) — property lookups below go through the
	/// non-locking `property_id_locked` for that reason.
	fn bind_connector_to_crtc(
		&self,
		res: &drm::control::ResourceHandles,
		info: &connector::Info,
		conn_id: connector::Handle,
		mode: Mode,
		reuse: Option<crtc::Handle>,
		occupied: &mut Vec<crtc::Handle>,
	) -> Option<crtc::Handle> {
		let crtc_id = self.select_crtc(res, info, reuse, occupied)?;

		if let Err(e) = self.commit_mode_locked(conn_id, crtc_id, mode) {
			tracing::warn!("failed to bind connector {conn_id:?} to crtc {crtc_id:?}: {e}");
			return None;
		}
		occupied.push(crtc_id);
		Some(crtc_id)
	}

	fn select_crtc(
		&self,
		res: &drm::control::ResourceHandles,
		info: &connector::Info,
		reuse: Option<crtc::Handle>,
		occupied: &[crtc::Handle],
	) -> Option<crtc::Handle> {
		if let Some(c) = reuse {
			if !occupied.contains(&c) {
				return Some(c);
			}
		}
		for &enc_id in info.encoders() {
			let Ok(enc) = self.get_encoder(enc_id) else { continue };
			for crtc_id in res.filter_crtcs(enc.possible_crtcs()) {
				if !occupied.contains(&crtc_id) {
					return Some(crtc_id);
				}
			}
		}
		None
	}

	/// Creates the mode blob and commits the three properties that bind a
	/// connector to an active CRTC in one atomic request.
	fn commit_mode_locked(&self, conn_id: connector::Handle, crtc_id: crtc::Handle, mode: Mode) -> Result<()> {
		let crtc_id_prop = self
			.property_id_locked(conn_id, "CRTC_ID")
			.ok_or_else(|| PipelineError::ConfigRejected("connector missing CRTC_ID property".into()))?;
		let active_prop = self
			.property_id_locked(crtc_id, "ACTIVE")
			.ok_or_else(|| PipelineError::ConfigRejected("crtc missing ACTIVE property".into()))?;
		let mode_id_prop = self
			.property_id_locked(crtc_id, "MODE_ID")
			.ok_or_else(|| PipelineError::ConfigRejected("crtc missing MODE_ID property".into()))?;

		let mode_blob = self
			.create_property_blob(&mode)
			.map_err(|e| PipelineError::IoctlFailed { op: "DRM_IOCTL_MODE_CREATEPROPBLOB", errno: io_err_to_errno(&e) })?;

		let mut req = atomic::AtomicModeReq::new();
		req.add_property(crtc_id, active_prop, property::Value::UnsignedRange(1));
		req.add_property(crtc_id, mode_id_prop, mode_blob);
		req.add_property(conn_id, crtc_id_prop, property::Value::UnsignedRange(u32::from(crtc_id) as u64));

		self.atomic_commit(AtomicCommitFlags::ALLOW_MODESET, req)
			.map_err(|e| PipelineError::IoctlFailed { op: "DRM_IOCTL_MODE_ATOMIC", errno: io_err_to_errno(&e) })?;
		Ok(())
	}

	/// Looks up the DRM property ID for `name` on `handle`, used by the
	/// compositor to cache CRTC_ID/FB_ID/SRC_*/CRTC_*/OUT_FENCE_PTR once per layer.
	pub fn property_id(&self, handle: impl ResourceHandle, name: &str) -> Option<drm::control::property::Handle> {
		let _guard = self.ioctl_lock.lock().unwrap();
		self.property_id_locked(handle, name)
	}

	fn property_id_locked(&self, handle: impl ResourceHandle, name: &str) -> Option<drm::control::property::Handle> {
		let props = self.get_properties(handle).ok()?;
		for (prop_handle, _) in props.as_hashmap(self).ok()?.iter().filter(|(_, info)| info.name().to_str() == Ok(name)) {
			return Some(*prop_handle);
		}
		None
	}

	/// Starts the process-wide udev hotplug watcher for this device, if it
	/// isn't already running. Safe to call more than once.
	pub fn watch_hotplug(self: &Arc<Self>) {
		UdevMonitor::watch(self.clone());
	}

	fn classify_plane(&self, plane_id: drm::control::plane::Handle) -> Option<PlaneType> {
		let props = self.get_properties(plane_id).ok()?;
		let map = props.as_hashmap(self).ok()?;
		for (prop_handle, info) in map.iter() {
			if info.name().to_str() == Ok("type") {
				let value = props.as_map().get(prop_handle).copied().unwrap_or(0);
				return Some(match value {
					1 => PlaneType::Primary,
					2 => PlaneType::Cursor,
					_ => PlaneType::Overlay,
				});
			}
		}
		None
	}

	pub fn notify_pre_refresh(&self) {
		let state = self.state.lock().unwrap();
		for (pre, _) in state.callbacks.iter() {
			pre();
		}
	}

	pub fn notify_post_refresh(&self) {
		let state = self.state.lock().unwrap();
		for (_, post) in state.callbacks.iter() {
			post();
		}
	}

	pub fn raw_fd(&self) -> i32 {
		self.fd.as_raw_fd()
	}
}

fn io_err_to_errno(e: &std::io::Error) -> nix::errno::Errno {
	nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0))
}
