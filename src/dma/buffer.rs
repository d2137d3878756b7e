use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::Arc;

use drm::buffer::Buffer as DrmBuffer;
use drm::control::Device as ControlDevice;
use drm_fourcc::DrmFourcc;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::drm::DeviceController;
use crate::error::{PipelineError, Result};

use super::format::plane_info;

/// Alignments tried in order when allocating a dumb buffer for a given
/// `required_size`.
const ALIGN_OPTIONS: [u32; 5] = [8, 16, 32, 64, 128];

/// A DMA-BUF backed image buffer: `{handle, width, height, fourcc, pitch,
/// size, offset, fd}`. Immutable after creation.
///
/// Two provenances:
/// - *owned*: created via the dumb-buffer ioctl; destroys the DRM handle and
///   closes the FD on drop.
/// - *imported*: prime-FD -> handle, or a sub-plane view over someone else's
///   FD; closes nothing on drop, the exporter owns the lifetime.
pub struct DmaBuffer {
	fd: OwnedFd,
	handle: u32,
	width: u32,
	height: u32,
	format: DrmFourcc,
	pitch: u32,
	size: u32,
	offset: u32,
	/// `Some` only for owned buffers; kept alive so `Drop` can destroy the
	/// dumb-buffer handle. Imported buffers carry `None` — the exporter owns
	/// the handle's lifetime, we only own the FD view (which we don't close).
	device: Option<Arc<DeviceController>>,
	mapped: Option<(NonNull<u8>, usize)>,
}

unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
	/// Allocate a buffer of at least `required_size` bytes. Iterates
	/// `ALIGN_OPTIONS`, passing the pitch-aligned width directly into the
	/// dumb-buffer create ioctl so a kernel-side re-alignment can't shrink
	/// the result below `required_size` (the driver may round the requested
	/// size down to a value it deems canonical; feeding it an already
	/// over-aligned width keeps that rounding above our floor).
	pub fn create(
		device: &Arc<DeviceController>,
		width: u32,
		height: u32,
		format: DrmFourcc,
		required_size: u32,
		offset: u32,
		plane_index: usize,
	) -> Result<Self> {
		if required_size == 0 {
			return Err(PipelineError::AllocationFailed("required_size must be non-zero".into()));
		}
		let info = plane_info(format).ok_or_else(|| PipelineError::AllocationFailed(format!("unsupported format {format:?}")))?;
		let (ratio_w, ratio_h) = info.ratios.get(plane_index).copied().ok_or_else(|| {
			PipelineError::AllocationFailed(format!("plane index {plane_index} out of range for {format:?}"))
		})?;

		for &align in ALIGN_OPTIONS.iter() {
			let aligned_w = align_up((width as f32 * ratio_w) as u32, align);
			let aligned_h = align_up((height as f32 * ratio_h) as u32, align);

			let dumb = match device.create_dumb_buffer((aligned_w, aligned_h), format, info.bpp as u32) {
				Ok(dumb) => dumb,
				Err(_) => continue,
			};

			if dumb.size() < required_size as u64 {
				let _ = device.destroy_dumb_buffer(dumb.handle());
				continue;
			}

			let handle = dumb.handle();
			let fd = device
				.buffer_to_prime_fd(handle.into(), libc::O_CLOEXEC | libc::O_RDWR)
				.map_err(|e| {
					let _ = device.destroy_dumb_buffer(handle);
					PipelineError::IoctlFailed { op: "DRM_IOCTL_PRIME_HANDLE_TO_FD", errno: nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0)) }
				})?;

			return Ok(Self {
				fd,
				handle: handle.into(),
				width,
				height,
				format,
				pitch: dumb.pitch(),
				size: dumb.size() as u32,
				offset,
				device: Some(device.clone()),
				mapped: None,
			});
		}

		Err(PipelineError::AllocationFailed(format!(
			"failed to create dumb buffer with required size {required_size} after trying all alignments"
		)))
	}

	/// Computes `required_size` from the plane's ratio and bpp, then delegates
	/// to [`DmaBuffer::create`].
	pub fn create_auto(device: &Arc<DeviceController>, width: u32, height: u32, format: DrmFourcc, offset: u32, plane_index: usize) -> Result<Self> {
		let info = plane_info(format).ok_or_else(|| PipelineError::AllocationFailed(format!("unsupported format {format:?}")))?;
		let (ratio_w, ratio_h) = info.ratios[plane_index.min(info.ratios.len() - 1)];
		let required_size = (width as f32 * ratio_w * height as f32 * ratio_h * info.bpp as f32 / 8.0) as u32;
		Self::create(device, width, height, format, required_size, offset, plane_index)
	}

	/// Import a PRIME FD exported by another component (or the kernel). The
	/// resulting buffer does not own the FD's lifetime; dropping it closes
	/// nothing.
	pub fn import_from_fd(
		device: &Arc<DeviceController>,
		import_fd: RawFd,
		width: u32,
		height: u32,
		format: DrmFourcc,
		size: u32,
		offset: u32,
	) -> Result<Self> {
		if import_fd < 0 {
			return Err(PipelineError::BufferImportFailed("invalid fd".into()));
		}
		if width == 0 || height == 0 {
			return Err(PipelineError::BufferImportFailed(format!("invalid dimensions {width}x{height}")));
		}

		let handle = device
			.prime_fd_to_buffer(import_fd)
			.map_err(|e| PipelineError::IoctlFailed { op: "DRM_IOCTL_PRIME_FD_TO_HANDLE", errno: nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0)) })?;

		// Pitch is recovered from the caller-supplied size; the kernel does
		// not hand back a pitch for an imported handle.
		let pitch = if height > 0 { size / height } else { 0 };
		let fd = unsafe { OwnedFd::from_raw_fd(import_fd) };

		Ok(Self {
			fd,
			handle: handle.into(),
			width,
			height,
			format,
			pitch,
			size,
			offset,
			device: None,
			mapped: None,
		})
	}

	pub fn fd(&self) -> RawFd {
		self.fd.as_raw_fd()
	}
	pub fn handle(&self) -> u32 {
		self.handle
	}
	pub fn width(&self) -> u32 {
		self.width
	}
	pub fn height(&self) -> u32 {
		self.height
	}
	pub fn format(&self) -> DrmFourcc {
		self.format
	}
	pub fn pitch(&self) -> u32 {
		self.pitch
	}
	pub fn size(&self) -> u32 {
		self.size
	}
	pub fn offset(&self) -> u32 {
		self.offset
	}
	pub fn is_owned(&self) -> bool {
		self.device.is_some()
	}

	fn map(&mut self) -> Result<NonNull<u8>> {
		if let Some((ptr, _)) = self.mapped {
			return Ok(ptr);
		}
		let ptr = unsafe {
			mmap(
				None,
				std::num::NonZeroUsize::new(self.size as usize).ok_or_else(|| PipelineError::AllocationFailed("zero-size mmap".into()))?,
				ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
				MapFlags::MAP_SHARED,
				self.fd.as_raw_fd(),
				0,
			)
		}
		.map_err(|e| PipelineError::IoctlFailed { op: "mmap", errno: e })?;
		let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| PipelineError::AllocationFailed("mmap returned null".into()))?;
		self.mapped = Some((ptr, self.size as usize));
		Ok(ptr)
	}

	fn unmap(&mut self) {
		if let Some((ptr, len)) = self.mapped.take() {
			unsafe {
				let _ = munmap(ptr.cast(), len);
			}
		}
	}

	/// Returns an RAII view over the CPU-mapped buffer; unmaps on drop.
	pub fn scoped_map(&mut self) -> Result<MappedView<'_>> {
		let ptr = self.map()?;
		Ok(MappedView { owner: self, ptr })
	}
}

impl Drop for DmaBuffer {
	fn drop(&mut self) {
		self.unmap();
		let Some(device) = self.device.take() else { return };
		if self.handle == 0 {
			return;
		}
		let _ = device.destroy_dumb_buffer(self.handle.into());
	}
}

/// RAII view over a [`DmaBuffer`]'s CPU mapping; unmaps when dropped.
pub struct MappedView<'a> {
	owner: &'a mut DmaBuffer,
	ptr: NonNull<u8>,
}

impl<'a> MappedView<'a> {
	pub fn as_slice(&self) -> &[u8] {
		unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.owner.size as usize) }
	}

	pub fn as_mut_slice(&mut self) -> &mut [u8] {
		unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.owner.size as usize) }
	}
}

impl<'a> Drop for MappedView<'a> {
	fn drop(&mut self) {
		self.owner.unmap();
	}
}

fn align_up(value: u32, align: u32) -> u32 {
	value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn align_up_rounds_to_next_multiple() {
		assert_eq!(align_up(100, 32), 128);
		assert_eq!(align_up(128, 32), 128);
		assert_eq!(align_up(1, 8), 8);
	}
}
