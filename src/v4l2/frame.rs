use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use drm_fourcc::DrmFourcc;

use crate::dma::DmaBuffer;
use crate::ordered_queue::OverflowPolicy;

/// Backing storage for one captured frame. `Mmap` holds a private copy taken
/// out of the driver's ring (the ring slot itself is requeued as soon as the
/// copy is made); the DMA-BUF variants are zero-copy and keep the kernel
/// buffer alive until every `Frame` clone referencing it is dropped.
pub enum SharedBufferState {
	Mmap(Arc<[u8]>),
	DmaBufFd(RawFd),
	DmaBufObj(DmaBuffer),
}

#[derive(Clone, Debug)]
pub struct FrameMeta {
	pub frame_id: u64,
	pub width: u32,
	pub height: u32,
	pub stride: u32,
	pub format: DrmFourcc,
	pub timestamp: Duration,
	pub buffer_index: usize,
}

/// Called exactly once, when the last `Frame` clone referencing a buffer
/// index is dropped. For MMAP capture this re-queues the index with
/// `VIDIOC_QBUF`; for DMA-BUF capture it does the same, handing the fd back.
pub type ReleaseFn = Box<dyn FnOnce(usize) + Send>;

struct FrameInner {
	meta: FrameMeta,
	state: SharedBufferState,
	release: Mutex<Option<ReleaseFn>>,
}

impl Drop for FrameInner {
	fn drop(&mut self) {
		if let Some(release) = self.release.lock().unwrap().take() {
			release(self.meta.buffer_index);
		}
	}
}

/// Reference-counted handle to a captured frame. Cloning is cheap (bumps an
/// `Arc`); the buffer slot is only released back to the camera once the last
/// clone is dropped, so a frame can be handed to the RGA converter, the
/// display compositor, and a JPEG snapshot request simultaneously.
#[derive(Clone)]
pub struct Frame(Arc<FrameInner>);

impl Frame {
	pub fn new(meta: FrameMeta, state: SharedBufferState, release: ReleaseFn) -> Self {
		Self(Arc::new(FrameInner { meta, state, release: Mutex::new(Some(release)) }))
	}

	pub fn meta(&self) -> &FrameMeta {
		&self.0.meta
	}

	pub fn as_bytes(&self) -> Option<&[u8]> {
		match &self.0.state {
			SharedBufferState::Mmap(bytes) => Some(bytes),
			_ => None,
		}
	}

	pub fn dma_fd(&self) -> Option<RawFd> {
		match &self.0.state {
			SharedBufferState::DmaBufFd(fd) => Some(*fd),
			SharedBufferState::DmaBufObj(buf) => Some(buf.fd()),
			SharedBufferState::Mmap(_) => None,
		}
	}

	pub fn dma_buffer(&self) -> Option<&DmaBuffer> {
		match &self.0.state {
			SharedBufferState::DmaBufObj(buf) => Some(buf),
			_ => None,
		}
	}

	pub fn strong_count(&self) -> usize {
		Arc::strong_count(&self.0)
	}
}

/// Bounded handoff between the capture thread and its consumers. V4L2 hands
/// frames out strictly in capture order, so there is no reordering to
/// restore (contrast `crate::ordered_queue::OrderedQueue`, used downstream of
/// the RGA worker pool where that guarantee no longer holds); what this still
/// needs over a plain channel is a choice of overflow behavior, since
/// different stages disagree on whether a full queue should drop the oldest
/// frame, drop the new one, or block the producer.
pub struct FrameQueue {
	capacity: usize,
	queue: Mutex<VecDeque<Frame>>,
	not_empty: Condvar,
	not_full: Condvar,
	closed: AtomicBool,
}

impl FrameQueue {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			queue: Mutex::new(VecDeque::new()),
			not_empty: Condvar::new(),
			not_full: Condvar::new(),
			closed: AtomicBool::new(false),
		}
	}

	/// Equivalent to `push_with_policy(frame, OverflowPolicy::DiscardNewest)`.
	pub fn push(&self, frame: Frame) -> bool {
		self.push_with_policy(frame, OverflowPolicy::DiscardNewest)
	}

	pub fn push_with_policy(&self, frame: Frame, policy: OverflowPolicy) -> bool {
		if self.closed.load(Ordering::Acquire) {
			return false;
		}
		let mut queue = self.queue.lock().unwrap();
		loop {
			if queue.len() < self.capacity {
				queue.push_back(frame);
				self.not_empty.notify_one();
				return true;
			}
			match policy {
				OverflowPolicy::DiscardNewest => return false,
				OverflowPolicy::DiscardOldest => {
					queue.pop_front();
					queue.push_back(frame);
					self.not_empty.notify_one();
					return true;
				}
				OverflowPolicy::ThrowException => panic!("FrameQueue overflow"),
				OverflowPolicy::Block => {
					if self.closed.load(Ordering::Acquire) {
						return false;
					}
					let (guard, timeout) = self.not_full.wait_timeout(queue, Duration::from_millis(50)).unwrap();
					queue = guard;
					if timeout.timed_out() && self.closed.load(Ordering::Acquire) {
						return false;
					}
				}
			}
		}
	}

	pub fn pop(&self, timeout: Duration) -> Option<Frame> {
		let deadline = Instant::now() + timeout;
		let mut queue = self.queue.lock().unwrap();
		loop {
			if let Some(frame) = queue.pop_front() {
				self.not_full.notify_one();
				return Some(frame);
			}
			if self.closed.load(Ordering::Acquire) {
				return None;
			}
			let now = Instant::now();
			if now >= deadline {
				return None;
			}
			let (guard, _) = self.not_empty.wait_timeout(queue, deadline - now).unwrap();
			queue = guard;
		}
	}

	pub fn try_pop(&self) -> Option<Frame> {
		let mut queue = self.queue.lock().unwrap();
		let frame = queue.pop_front();
		if frame.is_some() {
			self.not_full.notify_one();
		}
		frame
	}

	/// Wakes every blocked `pop`/`push` waiter so shutdown doesn't depend on
	/// them timing out on their own.
	pub fn close(&self) {
		self.closed.store(true, Ordering::Release);
		self.not_empty.notify_all();
		self.not_full.notify_all();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn dummy_meta(frame_id: u64, buffer_index: usize) -> FrameMeta {
		FrameMeta { frame_id, width: 1280, height: 720, stride: 1280, format: DrmFourcc::Nv12, timestamp: Duration::ZERO, buffer_index }
	}

	#[test]
	fn releases_slot_only_after_last_clone_drops() {
		let released = Arc::new(Mutex::new(None));
		let released_clone = released.clone();
		let frame = Frame::new(
			dummy_meta(1, 3),
			SharedBufferState::Mmap(Arc::from(vec![0u8; 4].into_boxed_slice())),
			Box::new(move |idx| *released_clone.lock().unwrap() = Some(idx)),
		);
		let second = frame.clone();
		drop(frame);
		assert!(released.lock().unwrap().is_none());
		drop(second);
		assert_eq!(*released.lock().unwrap(), Some(3));
	}

	#[test]
	fn frame_queue_respects_capacity() {
		let queue = FrameQueue::new(1);
		assert!(queue.push(Frame::new(dummy_meta(0, 0), SharedBufferState::Mmap(Arc::from(vec![].into_boxed_slice())), Box::new(|_| {}))));
		assert!(!queue.push(Frame::new(dummy_meta(1, 1), SharedBufferState::Mmap(Arc::from(vec![].into_boxed_slice())), Box::new(|_| {}))));
		assert!(queue.try_pop().is_some());
	}

	fn empty_frame(frame_id: u64) -> Frame {
		Frame::new(dummy_meta(frame_id, frame_id as usize), SharedBufferState::Mmap(Arc::from(Vec::new().into_boxed_slice())), Box::new(|_| {}))
	}

	#[test]
	fn discard_oldest_evicts_the_head_on_overflow() {
		let queue = FrameQueue::new(2);
		queue.push_with_policy(empty_frame(0), OverflowPolicy::DiscardOldest);
		queue.push_with_policy(empty_frame(1), OverflowPolicy::DiscardOldest);
		queue.push_with_policy(empty_frame(2), OverflowPolicy::DiscardOldest);

		assert_eq!(queue.try_pop().unwrap().meta().frame_id, 1);
		assert_eq!(queue.try_pop().unwrap().meta().frame_id, 2);
		assert!(queue.try_pop().is_none());
	}

	#[test]
	fn close_wakes_a_blocked_pop() {
		let queue = Arc::new(FrameQueue::new(4));
		let waiter = {
			let queue = queue.clone();
			std::thread::spawn(move || queue.pop(Duration::from_secs(5)))
		};
		std::thread::sleep(Duration::from_millis(20));
		queue.close();
		assert!(waiter.join().unwrap().is_none());
	}

	#[test]
	fn push_after_close_is_rejected() {
		let queue = FrameQueue::new(4);
		queue.close();
		assert!(!queue.push(empty_frame(0)));
	}
}
