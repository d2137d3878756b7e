use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use drm::buffer::{Buffer as DrmBuffer, PlanarBuffer};
use drm::control::{framebuffer, Device as ControlDevice};
use drm_fourcc::{DrmFourcc, DrmModifier};

use crate::dma::DmaBuffer;
use crate::error::{PipelineError, Result};

use super::device::DeviceController;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaneKind {
	Overlay,
	Primary,
	Cursor,
}

/// Tagged union of the property value types KMS atomic properties take.
#[derive(Clone, Copy, Debug)]
pub enum PropertyValue {
	Int(i64),
	UInt(u64),
	Float32_32(i64),
}

/// Snapshot of the values the compositor submits for one plane on the next
/// commit. `src_*` fields are 16.16 fixed-point per the KMS ABI.
#[derive(Clone, Debug)]
pub struct LayerProperties {
	pub kind: PlaneKind,
	pub plane_id: u32,
	pub crtc_id: u32,
	pub fb_id: u32,
	pub src_x: u32,
	pub src_y: u32,
	pub src_w: u32,
	pub src_h: u32,
	pub crtc_x: i32,
	pub crtc_y: i32,
	pub crtc_w: u32,
	pub crtc_h: u32,
	pub z_order: i64,
	pub alpha: u64,
}

pub type UpdateLayerCallback = Box<dyn Fn(u32, u32) + Send + Sync>;

/// Owns a plane's property snapshot and a FIFO of framebuffer IDs built from
/// successive buffer submissions. `update_buffer` appends a new FB; only
/// `on_fence_signaled` is allowed to retire older ones, since the head is
/// always still possibly scanning out.
pub struct DrmLayer {
	properties: Mutex<LayerProperties>,
	fb_cache: Mutex<VecDeque<u32>>,
	cache_size: usize,
	update_callback: Mutex<Option<UpdateLayerCallback>>,
}

impl DrmLayer {
	pub fn new(kind: PlaneKind, plane_id: u32, cache_size: usize) -> Self {
		Self {
			properties: Mutex::new(LayerProperties {
				kind,
				plane_id,
				crtc_id: 0,
				fb_id: 0,
				src_x: 0,
				src_y: 0,
				src_w: 0,
				src_h: 0,
				crtc_x: 0,
				crtc_y: 0,
				crtc_w: 0,
				crtc_h: 0,
				z_order: 0,
				alpha: u16::MAX as u64,
			}),
			fb_cache: Mutex::new(VecDeque::with_capacity(cache_size.max(1))),
			cache_size: cache_size.max(1),
			update_callback: Mutex::new(None),
		}
	}

	pub fn set_update_callback(&self, callback: UpdateLayerCallback) {
		*self.update_callback.lock().unwrap() = Some(callback);
	}

	pub fn set_property(&self, name: &str, value: PropertyValue) -> Result<()> {
		let mut props = self.properties.lock().unwrap();
		match (name, value) {
			("CRTC_ID", PropertyValue::UInt(v)) => props.crtc_id = v as u32,
			("FB_ID", PropertyValue::UInt(v)) => props.fb_id = v as u32,
			("SRC_X", PropertyValue::UInt(v)) => props.src_x = v as u32,
			("SRC_Y", PropertyValue::UInt(v)) => props.src_y = v as u32,
			("SRC_W", PropertyValue::UInt(v)) => props.src_w = v as u32,
			("SRC_H", PropertyValue::UInt(v)) => props.src_h = v as u32,
			("CRTC_X", PropertyValue::Int(v)) => props.crtc_x = v as i32,
			("CRTC_Y", PropertyValue::Int(v)) => props.crtc_y = v as i32,
			("CRTC_W", PropertyValue::UInt(v)) => props.crtc_w = v as u32,
			("CRTC_H", PropertyValue::UInt(v)) => props.crtc_h = v as u32,
			("zpos", PropertyValue::Int(v)) | ("zposition", PropertyValue::Int(v)) => props.z_order = v,
			("alpha", PropertyValue::UInt(v)) => props.alpha = v,
			_ => return Err(PipelineError::InvalidState(format!("unknown layer property {name}"))),
		}
		Ok(())
	}

	pub fn properties_snapshot(&self) -> LayerProperties {
		self.properties.lock().unwrap().clone()
	}

	/// Builds a new framebuffer from `buffers` (up to 4 planes, e.g. NV12's
	/// Y + UV), appends it to the FB cache, and invokes the update callback
	/// with `(plane_id, fb_id)` so the compositor refreshes its snapshot.
	pub fn update_buffer(&self, device: &Arc<DeviceController>, buffers: &[DmaBuffer]) -> Result<u32> {
		if buffers.is_empty() || buffers.len() > 4 {
			return Err(PipelineError::InvalidState(format!("update_buffer requires 1-4 planes, got {}", buffers.len())));
		}
		let adapter = PlanarAdapter { buffers };
		let fb = device
			.add_planar_framebuffer(&adapter, drm::control::FbCmd2Flags::empty())
			.map_err(|e| PipelineError::IoctlFailed { op: "DRM_IOCTL_MODE_ADDFB2", errno: nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0)) })?;
		let fb_id: u32 = fb.into();

		{
			let mut props = self.properties.lock().unwrap();
			props.fb_id = fb_id;
		}
		{
			let mut cache = self.fb_cache.lock().unwrap();
			cache.push_back(fb_id);
		}

		if let Some(cb) = self.update_callback.lock().unwrap().as_ref() {
			let plane_id = self.properties.lock().unwrap().plane_id;
			cb(plane_id, fb_id);
		}

		Ok(fb_id)
	}

	/// Retires every cached FB except the newest `cache_size` entries. Only
	/// safe to call after the KMS out-fence for the commit that used the
	/// now-oldest entries has signaled — retiring the scan-out target early
	/// causes tearing or an EBUSY on destroy.
	pub fn on_fence_signaled(&self, device: &Arc<DeviceController>) {
		let mut cache = self.fb_cache.lock().unwrap();
		while cache.len() > self.cache_size {
			if let Some(old) = cache.pop_front() {
				let _ = device.destroy_framebuffer(framebuffer::Handle::from(old));
			}
		}
	}
}

struct PlanarAdapter<'a> {
	buffers: &'a [DmaBuffer],
}

impl<'a> DrmBuffer for PlanarAdapter<'a> {
	fn size(&self) -> (u32, u32) {
		(self.buffers[0].width(), self.buffers[0].height())
	}
	fn format(&self) -> DrmFourcc {
		self.buffers[0].format()
	}
	fn pitch(&self) -> u32 {
		self.buffers[0].pitch()
	}
	fn handle(&self) -> drm::buffer::Handle {
		self.buffers[0].handle().into()
	}
}

impl<'a> PlanarBuffer for PlanarAdapter<'a> {
	fn size(&self) -> (u32, u32) {
		(self.buffers[0].width(), self.buffers[0].height())
	}
	fn format(&self) -> DrmFourcc {
		self.buffers[0].format()
	}
	fn pitches(&self) -> [u32; 4] {
		let mut out = [0u32; 4];
		for (i, b) in self.buffers.iter().enumerate() {
			out[i] = b.pitch();
		}
		out
	}
	fn handles(&self) -> [Option<drm::buffer::Handle>; 4] {
		let mut out = [None; 4];
		for (i, b) in self.buffers.iter().enumerate() {
			out[i] = Some(b.handle().into());
		}
		out
	}
	fn offsets(&self) -> [u32; 4] {
		let mut out = [0u32; 4];
		for (i, b) in self.buffers.iter().enumerate() {
			out[i] = b.offset();
		}
		out
	}
	fn modifier(&self) -> Option<DrmModifier> {
		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn new_layer_has_no_pending_framebuffer() {
		let layer = DrmLayer::new(PlaneKind::Overlay, 42, 2);
		let props = layer.properties_snapshot();
		assert_eq!(props.fb_id, 0);
		assert_eq!(props.plane_id, 42);
	}

	#[test]
	fn set_property_rejects_unknown_names() {
		let layer = DrmLayer::new(PlaneKind::Overlay, 1, 2);
		assert!(layer.set_property("not_a_real_property", PropertyValue::Int(1)).is_err());
	}
}
