use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use drm_fourcc::DrmFourcc;

use crate::dma::DmaBuffer;
use crate::drm::DeviceController;
use crate::error::{PipelineError, Result};
use crate::ordered_queue::{OrderedQueue, OverflowPolicy};
use crate::v4l2::{Frame, FrameMeta, FrameQueue, SharedBufferState};

use super::format::drm_to_rga;

#[derive(Clone, Debug)]
pub struct Config {
	pub width: u32,
	pub height: u32,
	pub src_format: DrmFourcc,
	pub dst_format: DrmFourcc,
	pub pool_size: usize,
	pub worker_count: usize,
}

impl Default for Config {
	fn default() -> Self {
		Self { width: 1920, height: 1080, src_format: DrmFourcc::Nv12, dst_format: DrmFourcc::Abgr8888, pool_size: 4, worker_count: 2 }
	}
}

struct PooledBuffer {
	dmabuf: DmaBuffer,
	in_use: AtomicBool,
}

/// Converts NV12 camera frames to an RGA-native format (RGBA8888 by
/// default, matching the YOLOv5 preprocessing and display-overlay paths) on
/// a small worker pool. Output frames carry the same `v4l2::Frame` handle
/// the camera path uses, just wrapping a pool buffer's fd instead of a
/// capture ring slot; `OrderedQueue` restores frame order on the way out
/// since the worker pool races itself.
pub struct RgaProcessor {
	config: Config,
	pool: Vec<PooledBuffer>,
	next_index: AtomicUsize,
	raw_queue: Arc<FrameQueue>,
	output: Arc<OrderedQueue<Frame>>,
	running: Arc<AtomicBool>,
	paused: Arc<AtomicBool>,
	workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RgaProcessor {
	pub fn new(device: &Arc<DeviceController>, config: Config, raw_queue: Arc<FrameQueue>) -> Result<Arc<Self>> {
		if drm_to_rga(config.src_format).is_none() {
			return Err(PipelineError::ConfigRejected(format!("unsupported RGA source format {:?}", config.src_format)));
		}
		if drm_to_rga(config.dst_format).is_none() {
			return Err(PipelineError::ConfigRejected(format!("unsupported RGA destination format {:?}", config.dst_format)));
		}

		let mut pool = Vec::with_capacity(config.pool_size);
		for _ in 0..config.pool_size {
			let dmabuf = DmaBuffer::create_auto(device, config.width, config.height, config.dst_format, 0, 0)?;
			pool.push(PooledBuffer { dmabuf, in_use: AtomicBool::new(false) });
		}

		Ok(Arc::new(Self {
			config,
			pool,
			next_index: AtomicUsize::new(0),
			raw_queue,
			output: Arc::new(OrderedQueue::new(64)),
			running: Arc::new(AtomicBool::new(false)),
			paused: Arc::new(AtomicBool::new(false)),
			workers: Mutex::new(Vec::new()),
		}))
	}

	pub fn output_queue(&self) -> Arc<OrderedQueue<Frame>> {
		self.output.clone()
	}

	pub fn start(self: &Arc<Self>) {
		if self.running.swap(true, Ordering::AcqRel) {
			return;
		}
		let mut workers = self.workers.lock().unwrap();
		for i in 0..self.config.worker_count {
			let processor = self.clone();
			let handle = std::thread::Builder::new()
				.name(format!("rga-worker-{i}"))
				.spawn(move || processor.worker_loop())
				.expect("failed to spawn rga worker thread");
			workers.push(handle);
		}
	}

	pub fn pause(&self) {
		self.paused.store(true, Ordering::Release);
	}

	pub fn resume(&self) {
		self.paused.store(false, Ordering::Release);
	}

	pub fn stop(&self) {
		if !self.running.swap(false, Ordering::AcqRel) {
			return;
		}
		for handle in self.workers.lock().unwrap().drain(..) {
			let _ = handle.join();
		}
	}

	/// Round-robins starting from wherever the last successful acquire left
	/// off, scanning at most once around the pool.
	fn acquire_buffer_index(&self) -> Option<usize> {
		let pool_size = self.pool.len();
		let start = self.next_index.load(Ordering::Acquire);
		for offset in 0..pool_size {
			let idx = (start + offset) % pool_size;
			if self.pool[idx].in_use.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
				self.next_index.store((idx + 1) % pool_size, Ordering::Release);
				return Some(idx);
			}
		}
		None
	}

	fn release_buffer(&self, index: usize) {
		self.pool[index].in_use.store(false, Ordering::Release);
	}

	fn worker_loop(self: Arc<Self>) {
		while self.running.load(Ordering::Acquire) {
			if self.paused.load(Ordering::Acquire) {
				std::thread::sleep(Duration::from_millis(10));
				continue;
			}

			let Some(raw) = self.raw_queue.pop(Duration::from_millis(50)) else {
				continue;
			};

			let Some(index) = self.acquire_buffer_index() else {
				tracing::trace!("rga pool exhausted, dropping frame {}", raw.meta().frame_id);
				continue;
			};

			match self.convert(&raw, index) {
				Ok(converted) => {
					self.output.enqueue(converted.meta().frame_id, converted, OverflowPolicy::DiscardOldest);
				}
				Err(e) => {
					tracing::warn!("rga conversion failed: {e}");
					self.release_buffer(index);
				}
			}
		}
	}

	fn convert(self: &Arc<Self>, raw: &Frame, pool_index: usize) -> Result<Frame> {
		let meta = raw.meta();
		let src_fd = raw.dma_fd().ok_or_else(|| PipelineError::InvalidState("rga source frame has no dma fd".into()))?;
		let dst = &self.pool[pool_index].dmabuf;

		let src_rk_fmt = drm_to_rga(self.config.src_format).expect("validated in new()");
		let dst_rk_fmt = drm_to_rga(self.config.dst_format).expect("validated in new()");
		let dst_wstride = (dst.pitch() / 4).max(dst.width()) as i32;

		let status = unsafe {
			let src_buf = rga_sys::wrapbuffer_fd(src_fd, meta.width as i32, meta.height as i32, meta.stride as i32, meta.height as i32, src_rk_fmt);
			let dst_buf = rga_sys::wrapbuffer_fd(dst.fd(), dst.width() as i32, dst.height() as i32, dst_wstride, dst.height() as i32, dst_rk_fmt);
			rga_sys::imcvtcolor(src_buf, dst_buf, src_rk_fmt, dst_rk_fmt, 0, 1)
		};

		if status != rga_sys::IM_STATUS_IM_STATUS_SUCCESS {
			return Err(PipelineError::InvalidState(format!("RGA imcvtcolor failed with status {status}")));
		}

		let out_meta = FrameMeta {
			frame_id: meta.frame_id,
			width: dst.width(),
			height: dst.height(),
			stride: dst.pitch(),
			format: self.config.dst_format,
			timestamp: meta.timestamp,
			buffer_index: pool_index,
		};

		let processor = self.clone();
		let release = Box::new(move |idx: usize| processor.release_buffer(idx));
		Ok(Frame::new(out_meta, SharedBufferState::DmaBufFd(dst.fd()), release))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_uses_abgr_destination() {
		let config = Config::default();
		assert_eq!(config.dst_format, DrmFourcc::Abgr8888);
		assert_eq!(config.src_format, DrmFourcc::Nv12);
	}
}
