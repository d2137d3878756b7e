use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use drm_fourcc::DrmFourcc;

use crate::dma::DmaBuffer;
use crate::drm::DeviceController;
use crate::error::{PipelineError, Result};

use super::context::{Config, EncoderContext};

/// Slot count the RK356x MPP encoder was measured to need headroom for
/// without stalling the writer thread under normal GOP sizes.
pub const SLOT_COUNT: usize = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
	Writable = 0,
	Writing = 1,
	Filled = 2,
	Encoding = 3,
	Encoded = 4,
	Invalid = 5,
}

impl SlotState {
	fn from_u8(v: u8) -> Self {
		match v {
			0 => SlotState::Writable,
			1 => SlotState::Writing,
			2 => SlotState::Filled,
			3 => SlotState::Encoding,
			4 => SlotState::Encoded,
			_ => SlotState::Invalid,
		}
	}
}

struct AtomicSlotState(AtomicU8);

impl AtomicSlotState {
	fn new(s: SlotState) -> Self {
		Self(AtomicU8::new(s as u8))
	}
	fn load(&self) -> SlotState {
		SlotState::from_u8(self.0.load(Ordering::Acquire))
	}
	/// Transitions `from -> to` iff currently `from`. Returns whether it happened.
	fn transition(&self, from: SlotState, to: SlotState) -> bool {
		self.0.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire).is_ok()
	}
	fn store(&self, s: SlotState) {
		self.0.store(s as u8, Ordering::Release);
	}
}

struct Slot {
	dmabuf: DmaBuffer,
	external_dmabuf: Mutex<Option<DmaBuffer>>,
	using_external: AtomicBool,
	lifetime_holder: Mutex<Option<Box<dyn Any + Send>>>,
	state: AtomicSlotState,
	/// Monotonic-clock PTS, stamped by `submit_filled_slot` at submit time so
	/// it reflects when the caller handed the frame over, not when the
	/// worker thread eventually got around to encoding it.
	pts: AtomicU64,
}

pub struct EncodedPacket {
	pub data: Vec<u8>,
	pub pts: u64,
	pub keyframe: bool,
}

#[derive(Clone)]
pub struct EncodedMeta {
	pub core_id: i32,
	pub slot_id: i32,
	pub packet: Option<Arc<EncodedPacket>>,
	/// Owning core, kept alive so a holder can release the slot via `SlotGuard`.
	pub core: Option<Arc<MppEncoderCore>>,
}

impl EncodedMeta {
	fn empty(core_id: i32) -> Self {
		Self { core_id, slot_id: -1, packet: None, core: None }
	}
}

/// RAII guard that calls `release_slot` on drop unless disarmed. Used the
/// same way by `stream_writer`'s packet handling to guarantee release on
/// every exit path, including errors.
pub struct SlotGuard {
	core: Arc<MppEncoderCore>,
	slot_id: i32,
}

impl SlotGuard {
	pub fn new(core: Arc<MppEncoderCore>, slot_id: i32) -> Self {
		Self { core, slot_id }
	}
	pub fn release(mut self) {
		self.slot_id = -1;
	}
}

impl Drop for SlotGuard {
	fn drop(&mut self) {
		if self.slot_id != -1 {
			self.core.release_slot(self.slot_id as usize);
		}
	}
}

/// NV12-in, H.264-out hardware encoder core. Maintains a fixed pool of
/// `SLOT_COUNT` DMA-BUF backed frame buffers cycling through
/// `Writable -> Writing -> Filled -> Encoding -> Encoded -> Writable`.
/// A caller writes pixels into the `DmaBuffer` returned by
/// `acquire_writable_slot`, then calls `submit_filled_slot`; a worker thread
/// picks the slot up, feeds it to MPP, and appends the resulting packets
/// (there can be more than one per input frame, or zero) to an output queue
/// drained by `try_get_encoded_packet`.
pub struct MppEncoderCore {
	core_id: i32,
	context: Mutex<EncoderContext>,
	slots: Vec<Slot>,
	free_slots: Mutex<VecDeque<usize>>,
	pending_slots: Mutex<VecDeque<usize>>,
	pending_cv: Condvar,
	encoded: Mutex<VecDeque<EncodedMeta>>,
	running: AtomicBool,
	end_of_encode: AtomicBool,
	worker: Mutex<Option<JoinHandle<()>>>,
	width: u32,
	height: u32,
	stride: u32,
}

impl MppEncoderCore {
	pub fn new(device: &Arc<DeviceController>, config: Config, core_id: i32) -> Result<Arc<Self>> {
		let context = EncoderContext::new(&config)?;

		let mut slots = Vec::with_capacity(SLOT_COUNT);
		for _ in 0..SLOT_COUNT {
			let dmabuf = DmaBuffer::create_auto(device, config.width, config.height, DrmFourcc::Nv12, 0, 0)?;
			slots.push(Slot {
				dmabuf,
				external_dmabuf: Mutex::new(None),
				using_external: AtomicBool::new(false),
				lifetime_holder: Mutex::new(None),
				state: AtomicSlotState::new(SlotState::Writable),
				pts: AtomicU64::new(0),
			});
		}

		let core = Arc::new(Self {
			core_id,
			context: Mutex::new(context),
			slots,
			free_slots: Mutex::new((0..SLOT_COUNT).collect()),
			pending_slots: Mutex::new(VecDeque::new()),
			pending_cv: Condvar::new(),
			encoded: Mutex::new(VecDeque::new()),
			running: AtomicBool::new(true),
			end_of_encode: AtomicBool::new(false),
			worker: Mutex::new(None),
			width: config.width,
			height: config.height,
			stride: config.stride,
		});

		let worker_core = core.clone();
		let handle = std::thread::Builder::new()
			.name(format!("mpp-encoder-{core_id}"))
			.spawn(move || worker_core.worker_loop())
			.map_err(PipelineError::Io)?;
		*core.worker.lock().unwrap() = Some(handle);

		Ok(core)
	}

	pub fn core_id(&self) -> i32 {
		self.core_id
	}

	pub fn load(&self) -> usize {
		SLOT_COUNT - self.free_slots.lock().unwrap().len()
	}

	pub fn reset_config(&self, config: &Config) -> Result<()> {
		self.context.lock().unwrap().reset(config)
	}

	pub fn end_of_encode(&self) {
		self.end_of_encode.store(true, Ordering::Release);
		self.pending_cv.notify_all();
	}

	/// Acquires a free slot, marks it `Writing`, and hands back its internal
	/// DMA-BUF so the caller can blit pixels into it directly.
	pub fn acquire_writable_slot(self: &Arc<Self>) -> Option<(&DmaBuffer, usize)> {
		let slot_id = self.free_slots.lock().unwrap().pop_front()?;
		let slot = &self.slots[slot_id];
		if !slot.state.transition(SlotState::Writable, SlotState::Writing) {
			self.free_slots.lock().unwrap().push_back(slot_id);
			return None;
		}
		Some((&slot.dmabuf, slot_id))
	}

	pub fn submit_filled_slot(&self, slot_id: usize) {
		let slot = &self.slots[slot_id];
		slot.pts.store(now_monotonic_micros(), Ordering::Release);
		if slot.state.transition(SlotState::Writing, SlotState::Filled) {
			self.pending_slots.lock().unwrap().push_back(slot_id);
			self.pending_cv.notify_one();
		}
	}

	/// Same as `submit_filled_slot`, but the encoder reads from
	/// `external_dmabuf` (e.g. an RGA conversion output) instead of the
	/// slot's own buffer. `lifetime_holder` is kept alive until the slot is
	/// released, e.g. a `v4l2::Frame` clone backing the external buffer.
	pub fn submit_filled_slot_with_external(&self, slot_id: usize, external_dmabuf: DmaBuffer, lifetime_holder: Box<dyn Any + Send>) {
		let slot = &self.slots[slot_id];
		*slot.external_dmabuf.lock().unwrap() = Some(external_dmabuf);
		*slot.lifetime_holder.lock().unwrap() = Some(lifetime_holder);
		slot.using_external.store(true, Ordering::Release);
		self.submit_filled_slot(slot_id);
	}

	pub fn try_get_encoded_packet(&self) -> Option<EncodedMeta> {
		self.encoded.lock().unwrap().pop_front()
	}

	pub fn release_slot(&self, slot_id: usize) {
		let slot = &self.slots[slot_id];
		slot.state.store(SlotState::Writable);
		slot.using_external.store(false, Ordering::Release);
		*slot.external_dmabuf.lock().unwrap() = None;
		*slot.lifetime_holder.lock().unwrap() = None;
		self.free_slots.lock().unwrap().push_back(slot_id);
	}

	fn worker_loop(self: Arc<Self>) {
		while self.running.load(Ordering::Acquire) {
			let slot_id = {
				let mut pending = self.pending_slots.lock().unwrap();
				loop {
					if let Some(id) = pending.pop_front() {
						break Some(id);
					}
					if !self.running.load(Ordering::Acquire) {
						break None;
					}
					let (guard, timeout) = self.pending_cv.wait_timeout(pending, Duration::from_millis(200)).unwrap();
					pending = guard;
					if timeout.timed_out() && pending.is_empty() && self.end_of_encode.load(Ordering::Acquire) {
						break None;
					}
				}
			};

			let Some(slot_id) = slot_id else { continue };
			let slot = &self.slots[slot_id];
			if !slot.state.transition(SlotState::Filled, SlotState::Encoding) {
				continue;
			}

			let fd = if slot.using_external.load(Ordering::Acquire) {
				slot.external_dmabuf.lock().unwrap().as_ref().map(|b| b.fd())
			} else {
				Some(slot.dmabuf.fd())
			};
			let Some(fd) = fd else {
				slot.state.store(SlotState::Encoded);
				continue;
			};

			let pts = slot.pts.load(Ordering::Acquire);
			let put_result = self.context.lock().unwrap().encode_put_frame(fd, self.width, self.height, self.stride, pts, false);
			if let Err(e) = put_result {
				tracing::warn!("encode_put_frame failed on core {}: {e}", self.core_id);
				slot.state.store(SlotState::Encoded);
				continue;
			}

			loop {
				let packet = match self.context.lock().unwrap().encode_get_packet() {
					Ok(p) => p,
					Err(e) => {
						tracing::warn!("encode_get_packet failed on core {}: {e}", self.core_id);
						break;
					}
				};
				let Some(raw) = packet else { break };
				let encoded = EncodedPacket { data: raw.data, pts: raw.pts, keyframe: raw.keyframe };
				self.encoded.lock().unwrap().push_back(EncodedMeta {
					core_id: self.core_id,
					slot_id: slot_id as i32,
					packet: Some(Arc::new(encoded)),
					core: Some(self.clone()),
				});
			}

			slot.state.store(SlotState::Encoded);
		}
	}
}

impl Drop for MppEncoderCore {
	fn drop(&mut self) {
		self.running.store(false, Ordering::Release);
		self.pending_cv.notify_all();
		if let Some(handle) = self.worker.lock().unwrap().take() {
			let _ = handle.join();
		}
	}
}

static CLOCK_START: OnceLock<Instant> = OnceLock::new();

/// Microseconds since an arbitrary process-local epoch. MPP only needs PTS
/// values that are monotonic and comparable to each other, not wall-clock
/// time, so a clock anchored at first use avoids a dependency on the system
/// clock ever jumping backward (NTP step, suspend/resume).
fn now_monotonic_micros() -> u64 {
	let start = CLOCK_START.get_or_init(Instant::now);
	start.elapsed().as_micros() as u64
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn slot_state_round_trips_through_u8() {
		for s in [SlotState::Writable, SlotState::Writing, SlotState::Filled, SlotState::Encoding, SlotState::Encoded, SlotState::Invalid] {
			assert_eq!(SlotState::from_u8(s as u8), s);
		}
	}

	#[test]
	fn empty_meta_has_no_packet() {
		let meta = EncodedMeta::empty(3);
		assert_eq!(meta.core_id, 3);
		assert_eq!(meta.slot_id, -1);
		assert!(meta.packet.is_none());
	}
}
