//! Top-level orchestration: owns every hardware-facing subsystem and ties
//! them together with a double-buffered "current frame" and a small
//! dispatch pool, the way a single-process vision pipeline on an embedded
//! SoC is expected to run without an async runtime.

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use drm_fourcc::DrmFourcc;

use crate::config::Config;
use crate::dma::DmaBuffer;
use crate::drm::{DeviceController, DisplayManager};
use crate::error::{PipelineError, Result};
use crate::mpp::{self, JpegEncoder, MppEncoderCore, StreamWriter};
use crate::rga::{self, RgaProcessor};
use crate::thread_pauser::ThreadPauser;
use crate::v4l2::{CameraController, Frame, FrameQueue};

/// Produces one overlay buffer (ABGR8888, tightly packed) per display tick.
/// Left unimplemented here: the concrete source (a clock/logo overlay, a
/// detection-box renderer, ...) lives outside this crate's scope.
pub trait OverlaySource: Send + Sync {
	fn render(&self, width: u32, height: u32) -> Vec<u8>;
}

/// One detected object, in the coordinate space of the frame that was submitted.
#[derive(Clone, Debug)]
pub struct Detection {
	pub class_id: u32,
	pub confidence: f32,
	pub x: f32,
	pub y: f32,
	pub w: f32,
	pub h: f32,
}

/// NPU/YOLOv5 inference, contract only: submit a frame for async inference,
/// poll for a finished result, and read back the confidence threshold used
/// to filter `poll`'s output. No implementation ships in this crate.
pub trait InferenceBackend: Send + Sync {
	fn submit(&self, frame: &Frame) -> Result<()>;
	fn poll(&self) -> Option<Vec<Detection>>;
	fn threshold(&self) -> f32;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordStatus {
	Start,
	Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelStatus {
	Start,
	Stop,
}

fn aligned_dim(value: u32) -> u32 {
	if value == 0 {
		1920
	} else {
		(value + 7) / 8 * 8
	}
}

/// Fills in 0-valued width/height with a 1920x1080 default and rounds both
/// up to a multiple of 8, the alignment every downstream hardware block
/// (RGA, MPP) assumes.
pub fn default_camera_config(width: u32, height: u32) -> crate::config::CameraConfig {
	let (width, height) = if width == 0 || height == 0 { (1920, 1080) } else { (aligned_dim(width), aligned_dim(height)) };
	crate::config::CameraConfig { width, height, buffer_count: 4, use_dmabuf: true, ..Default::default() }
}

fn mpp_config_from(ec: &crate::config::EncoderConfig) -> mpp::Config {
	mpp::Config {
		width: ec.width,
		height: ec.height,
		stride: ec.stride,
		fps_in: ec.fps_in,
		fps_out: ec.fps_out,
		bps_target: ec.bps_target,
		gop: ec.gop,
		profile: ec.profile,
		rc_mode: match ec.rc_mode {
			crate::config::RateControlMode::Vbr => mpp::RateControlMode::Vbr,
			crate::config::RateControlMode::Cbr => mpp::RateControlMode::Cbr,
		},
	}
}

/// Converts the ambient 1-100 JPEG quality scale to MPP's 0-10 `jpeg:quant`
/// scale, and supplies the dimensions MPP needs from the camera config since
/// `config::JpegConfig` itself only carries `save_dir`/`quality`.
fn mpp_jpeg_config_from(jc: &crate::config::JpegConfig, width: u32, height: u32) -> mpp::JpegConfig {
	mpp::JpegConfig { width, height, quality: (jc.quality as i32 * 10 / 100).clamp(0, 10), save_dir: jc.save_dir.clone() }
}

struct CapturePipeline {
	camera: Arc<CameraController>,
	/// Kept alive for the camera's lifetime; `CameraController` only stores
	/// the raw fds it was given, not the buffers backing them.
	camera_dma_buffers: Vec<DmaBuffer>,
	rga: Arc<RgaProcessor>,
	rga_input: Arc<FrameQueue>,
}

fn build_capture_pipeline(device: &Arc<DeviceController>, config: &Config) -> Result<CapturePipeline> {
	let camera = CameraController::open(&config.camera)?;

	let mut camera_dma_buffers = Vec::new();
	if config.camera.use_dmabuf {
		for index in 0..camera.buffer_count() {
			let dmabuf = DmaBuffer::create_auto(device, config.camera.width, config.camera.height, DrmFourcc::Nv12, 0, 0)?;
			camera.import_dma_buffer(index, dmabuf.fd())?;
			camera_dma_buffers.push(dmabuf);
		}
	}

	let rga_input = Arc::new(FrameQueue::new(config.camera.buffer_count as usize));
	let rga_config = rga::Config {
		width: config.camera.width,
		height: config.camera.height,
		src_format: DrmFourcc::Nv12,
		dst_format: DrmFourcc::Abgr8888,
		..Default::default()
	};
	let rga = RgaProcessor::new(device, rga_config, rga_input.clone())?;

	Ok(CapturePipeline { camera, camera_dma_buffers, rga, rga_input })
}

/// The 500ms sliding window the FPS counter averages over.
const FPS_WINDOW: Duration = Duration::from_millis(500);

/// Owns the camera, RGA processor, hardware encoder, stream writer, JPEG
/// snapshot path, and (when a display is attached) the DRM compositor.
/// Frames flow: camera -> double-buffered "current frame" + RGA input queue
/// -> a 2-thread dispatch pool that notifies the display and, when the
/// model is running, the inference backend.
pub struct VisionPipeline {
	device: Arc<DeviceController>,
	config: Mutex<Config>,

	capture: Mutex<CapturePipeline>,
	encoder: Arc<MppEncoderCore>,
	stream_writer: Arc<StreamWriter>,
	jpeg: Mutex<JpegEncoder>,
	display: Mutex<Option<Arc<DisplayManager>>>,

	pauser: Arc<ThreadPauser>,

	current: [Mutex<Option<Frame>>; 2],
	current_rga: Mutex<Option<Frame>>,
	read_index: AtomicU64,
	publish_lock: Mutex<()>,
	publish_cv: Condvar,

	recording: AtomicBool,
	model_running: AtomicBool,

	window_start: Mutex<Instant>,
	window_count: AtomicU64,
	fps_millihertz: AtomicU64,

	overlay_source: Mutex<Option<Arc<dyn OverlaySource>>>,
	inference_backend: Mutex<Option<Arc<dyn InferenceBackend>>>,
	on_display: Mutex<Option<Box<dyn Fn(&Frame) + Send + Sync>>>,

	running: Arc<AtomicBool>,
	main_thread: Mutex<Option<JoinHandle<()>>>,
	display_thread: Mutex<Option<JoinHandle<()>>>,
	inference_thread: Mutex<Option<JoinHandle<()>>>,
	drain_thread: Mutex<Option<JoinHandle<()>>>,
}

impl VisionPipeline {
	pub fn new(config: Config) -> Result<Arc<Self>> {
		let device = Arc::new(DeviceController::open(&config.display.card)?);
		device.watch_hotplug();
		let capture = build_capture_pipeline(&device, &config)?;

		let encoder = MppEncoderCore::new(&device, mpp_config_from(&config.encoder), 0)?;
		let stream_writer = StreamWriter::with_packets_per_segment(&config.encoder.output_base, config.encoder.packets_per_segment)
			.map_err(PipelineError::Io)?;
		let jpeg = JpegEncoder::new(mpp_jpeg_config_from(&config.jpeg, config.camera.width, config.camera.height))?;

		let display = match DisplayManager::new(device.clone()) {
			Ok(manager) => Some(manager),
			Err(e) => {
				tracing::warn!("no display attached, running headless: {e}");
				None
			}
		};

		let pipeline = Arc::new(Self {
			device,
			config: Mutex::new(config),
			capture: Mutex::new(capture),
			encoder,
			stream_writer,
			jpeg: Mutex::new(jpeg),
			display: Mutex::new(display),
			pauser: Arc::new(ThreadPauser::new()?),
			current: [Mutex::new(None), Mutex::new(None)],
			current_rga: Mutex::new(None),
			read_index: AtomicU64::new(0),
			publish_lock: Mutex::new(()),
			publish_cv: Condvar::new(),
			recording: AtomicBool::new(false),
			model_running: AtomicBool::new(false),
			window_start: Mutex::new(Instant::now()),
			window_count: AtomicU64::new(0),
			fps_millihertz: AtomicU64::new(0),
			overlay_source: Mutex::new(None),
			inference_backend: Mutex::new(None),
			on_display: Mutex::new(None),
			running: Arc::new(AtomicBool::new(false)),
			main_thread: Mutex::new(None),
			display_thread: Mutex::new(None),
			inference_thread: Mutex::new(None),
			drain_thread: Mutex::new(None),
		});

		Ok(pipeline)
	}

	pub fn register_display_callback(&self, callback: Box<dyn Fn(&Frame) + Send + Sync>) {
		*self.on_display.lock().unwrap() = Some(callback);
	}

	pub fn register_overlay_source(&self, source: Arc<dyn OverlaySource>) {
		*self.overlay_source.lock().unwrap() = Some(source);
	}

	pub fn register_inference_backend(&self, backend: Arc<dyn InferenceBackend>) {
		*self.inference_backend.lock().unwrap() = Some(backend);
	}

	pub fn start(self: &Arc<Self>) -> Result<()> {
		if self.running.swap(true, Ordering::AcqRel) {
			return Ok(());
		}

		{
			let capture = self.capture.lock().unwrap();
			capture.camera.start(&capture.camera)?;
			capture.rga.start();
		}

		let main_pipeline = self.clone();
		*self.main_thread.lock().unwrap() = Some(
			std::thread::Builder::new()
				.name("vision-pipeline-main".into())
				.spawn(move || main_pipeline.main_loop())
				.map_err(PipelineError::Io)?,
		);

		let display_pipeline = self.clone();
		*self.display_thread.lock().unwrap() = Some(
			std::thread::Builder::new()
				.name("vision-pipeline-display".into())
				.spawn(move || display_pipeline.display_dispatch_loop())
				.map_err(PipelineError::Io)?,
		);

		let inference_pipeline = self.clone();
		*self.inference_thread.lock().unwrap() = Some(
			std::thread::Builder::new()
				.name("vision-pipeline-inference".into())
				.spawn(move || inference_pipeline.inference_dispatch_loop())
				.map_err(PipelineError::Io)?,
		);

		let drain_pipeline = self.clone();
		*self.drain_thread.lock().unwrap() = Some(
			std::thread::Builder::new()
				.name("vision-pipeline-drain".into())
				.spawn(move || drain_pipeline.drain_loop())
				.map_err(PipelineError::Io)?,
		);

		Ok(())
	}

	pub fn stop(&self) {
		if !self.running.swap(false, Ordering::AcqRel) {
			return;
		}
		self.pauser.close();
		{
			let _guard = self.publish_lock.lock().unwrap();
			self.publish_cv.notify_all();
		}

		{
			let capture = self.capture.lock().unwrap();
			capture.camera.stop();
			capture.rga.stop();
		}
		self.encoder.end_of_encode();
		self.stream_writer.stop();

		for thread in [&self.main_thread, &self.display_thread, &self.inference_thread, &self.drain_thread] {
			if let Some(handle) = thread.lock().unwrap().take() {
				let _ = handle.join();
			}
		}

		if let Some(display) = self.display.lock().unwrap().take() {
			display.shutdown();
		}
	}

	pub fn pause(&self) {
		self.pauser.pause();
		self.capture.lock().unwrap().camera.pauser().pause();
	}

	pub fn resume(&self) {
		self.pauser.resume();
		self.capture.lock().unwrap().camera.pauser().resume();
	}

	/// Pauses everything, tears down the camera/RGA pair, rebuilds it against
	/// `new_config`, reconfigures the encoder and JPEG path in place, then
	/// resumes. The display compositor is left untouched since plane
	/// geometry doesn't depend on camera config.
	pub fn reset_config(self: &Arc<Self>, new_config: Config) -> Result<()> {
		self.pause();

		{
			let old_capture = self.capture.lock().unwrap();
			old_capture.camera.stop();
			old_capture.rga.stop();
		}

		let new_capture = build_capture_pipeline(&self.device, &new_config)?;
		*self.capture.lock().unwrap() = new_capture;

		self.encoder.reset_config(&mpp_config_from(&new_config.encoder))?;
		self.jpeg
			.lock()
			.unwrap()
			.reset_config(mpp_jpeg_config_from(&new_config.jpeg, new_config.camera.width, new_config.camera.height))?;

		{
			let capture = self.capture.lock().unwrap();
			capture.camera.start(&capture.camera)?;
			capture.rga.start();
		}

		*self.config.lock().unwrap() = new_config;
		self.resume();
		Ok(())
	}

	pub fn try_record(&self, status: RecordStatus) -> bool {
		let target = status == RecordStatus::Start;
		self.recording.swap(target, Ordering::AcqRel) != target
	}

	pub fn set_model_running_status(&self, status: ModelStatus) -> bool {
		let target = status == ModelStatus::Start;
		self.model_running.swap(target, Ordering::AcqRel) != target
	}

	pub fn set_mirror_mode(&self, horizontal: bool, vertical: bool) -> Result<()> {
		self.capture.lock().unwrap().camera.set_mirror(horizontal, vertical)
	}

	pub fn set_exposure_percentage(&self, percentage: f32) -> Result<()> {
		self.capture.lock().unwrap().camera.set_exposure_percentage(percentage)
	}

	/// Pauses the pipeline, snapshots the current raw frame's DMA-BUF to a
	/// JPEG file, and resumes. Blocks for the duration of the encode.
	pub fn try_capture(&self) -> Result<PathBuf> {
		self.pause();
		let result = (|| {
			let frame = self.get_current_raw_frame().ok_or_else(|| PipelineError::InvalidState("no frame captured yet".into()))?;
			let meta = frame.meta();
			let fd = frame.dma_fd().ok_or_else(|| PipelineError::InvalidState("current frame has no dma fd".into()))?;
			let size = meta.stride * meta.height * 3 / 2;
			self.jpeg.lock().unwrap().capture_from_fd(fd, meta.width, meta.height, meta.stride, size)
		})();
		self.resume();
		result
	}

	pub fn get_current_raw_frame(&self) -> Option<Frame> {
		let index = (self.read_index.load(Ordering::Acquire) % 2) as usize;
		self.current[index].lock().unwrap().clone()
	}

	pub fn get_current_rga_frame(&self) -> Option<Frame> {
		self.current_rga.lock().unwrap().clone()
	}

	pub fn get_fps(&self) -> f32 {
		self.fps_millihertz.load(Ordering::Acquire) as f32 / 1000.0
	}

	pub fn get_camera_fd(&self) -> RawFd {
		self.capture.lock().unwrap().camera.fd()
	}

	fn main_loop(self: Arc<Self>) {
		while self.running.load(Ordering::Acquire) {
			self.pauser.wait_if_paused_for(Some(Duration::from_millis(200)));
			if !self.running.load(Ordering::Acquire) {
				break;
			}

			let frame = {
				let capture = self.capture.lock().unwrap();
				capture.camera.frames().pop(Duration::from_millis(200))
			};
			let Some(frame) = frame else { continue };

			let write_index = ((self.read_index.load(Ordering::Acquire) + 1) % 2) as usize;
			*self.current[write_index].lock().unwrap() = Some(frame.clone());
			self.read_index.store(write_index as u64, Ordering::Release);

			{
				let _guard = self.publish_lock.lock().unwrap();
				self.publish_cv.notify_all();
			}

			self.tick_fps();

			{
				let capture = self.capture.lock().unwrap();
				capture.rga_input.push(frame.clone());
			}

			if self.recording.load(Ordering::Acquire) {
				self.submit_to_encoder(&frame);
			}
		}
	}

	fn tick_fps(&self) {
		self.window_count.fetch_add(1, Ordering::Relaxed);
		let mut window_start = self.window_start.lock().unwrap();
		let elapsed = window_start.elapsed();
		if elapsed >= FPS_WINDOW {
			let count = self.window_count.swap(0, Ordering::Relaxed);
			let hz = count as f64 / elapsed.as_secs_f64();
			self.fps_millihertz.store((hz * 1000.0) as u64, Ordering::Release);
			*window_start = Instant::now();
		}
	}

	/// Fast path only: the camera's raw frame is submitted to the encoder
	/// directly when its format/dimensions already match the encoder's
	/// configured input (the common case with a DMA-BUF capable sensor).
	/// A format mismatch is logged and the frame is dropped rather than
	/// routed through an RGA conversion into the encoder's own slot buffer;
	/// see `DESIGN.md` for why that path is out of scope here.
	fn submit_to_encoder(&self, frame: &Frame) {
		let meta = frame.meta();
		let (encoder_width, encoder_height) = {
			let config = self.config.lock().unwrap();
			(config.encoder.width, config.encoder.height)
		};
		if meta.format != DrmFourcc::Nv12 || meta.width != encoder_width || meta.height != encoder_height {
			tracing::debug!("dropping frame {}: format/dims don't match encoder input, no RGA fallback wired", meta.frame_id);
			return;
		}
		let Some(src_fd) = frame.dma_fd() else {
			tracing::debug!("dropping frame {}: no dma fd to submit", meta.frame_id);
			return;
		};

		let Some((_slot_buffer, slot_id)) = self.encoder.acquire_writable_slot() else {
			tracing::trace!("encoder slot pool exhausted, dropping frame {}", meta.frame_id);
			return;
		};

		let dup_fd = unsafe { libc::dup(src_fd) };
		if dup_fd < 0 {
			self.encoder.release_slot(slot_id);
			tracing::warn!("dup failed for frame {}, dropping", meta.frame_id);
			return;
		}

		match DmaBuffer::import_from_fd(&self.device, dup_fd, meta.width, meta.height, meta.format, meta.stride * meta.height * 3 / 2, 0) {
			Ok(external) => {
				self.encoder.submit_filled_slot_with_external(slot_id, external, Box::new(frame.clone()));
			}
			Err(e) => {
				unsafe { libc::close(dup_fd) };
				self.encoder.release_slot(slot_id);
				tracing::warn!("failed to import frame {} for external submit: {e}", meta.frame_id);
			}
		}
	}

	fn display_dispatch_loop(self: Arc<Self>) {
		while self.running.load(Ordering::Acquire) {
			let guard = self.publish_lock.lock().unwrap();
			let _ = self.publish_cv.wait_timeout(guard, Duration::from_millis(200)).unwrap();
			if !self.running.load(Ordering::Acquire) {
				break;
			}
			let Some(frame) = self.get_current_raw_frame() else { continue };
			if let Some(callback) = self.on_display.lock().unwrap().as_ref() {
				callback(&frame);
			}
		}
	}

	fn inference_dispatch_loop(self: Arc<Self>) {
		while self.running.load(Ordering::Acquire) {
			let guard = self.publish_lock.lock().unwrap();
			let _ = self.publish_cv.wait_timeout(guard, Duration::from_millis(200)).unwrap();
			if !self.running.load(Ordering::Acquire) {
				break;
			}
			if !self.model_running.load(Ordering::Acquire) {
				continue;
			}

			let rga_frame = {
				let capture = self.capture.lock().unwrap();
				capture.rga.output_queue().try_dequeue(Duration::from_millis(20))
			};
			let Some(frame) = rga_frame else { continue };
			*self.current_rga.lock().unwrap() = Some(frame.clone());

			if let Some(backend) = self.inference_backend.lock().unwrap().as_ref() {
				if let Err(e) = backend.submit(&frame) {
					tracing::warn!("inference submit failed: {e}");
				}
			}
		}
	}

	/// Continuously forwards finished encoder packets to the stream writer.
	/// Harmless to run even when nothing is being submitted to the encoder.
	fn drain_loop(self: Arc<Self>) {
		while self.running.load(Ordering::Acquire) {
			match self.encoder.try_get_encoded_packet() {
				Some(meta) => {
					self.stream_writer.push_meta(meta);
				}
				None => std::thread::sleep(Duration::from_millis(5)),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_camera_config_falls_back_to_1080p() {
		let config = default_camera_config(0, 0);
		assert_eq!((config.width, config.height), (1920, 1080));
	}

	#[test]
	fn default_camera_config_aligns_to_multiple_of_8() {
		let config = default_camera_config(1281, 723);
		assert_eq!((config.width, config.height), (1288, 728));
	}

	#[test]
	fn jpeg_quality_scales_from_percent_to_mpp_quant() {
		let jc = crate::config::JpegConfig { save_dir: PathBuf::from("/tmp"), quality: 90 };
		let mc = mpp_jpeg_config_from(&jc, 1280, 720);
		assert_eq!(mc.quality, 9);
		assert_eq!((mc.width, mc.height), (1280, 720));
	}
}
