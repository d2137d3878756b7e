use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Policy applied when a slot is already occupied (conflict) or the ring is
/// full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
	DiscardOldest,
	DiscardNewest,
	Block,
	ThrowException,
}

struct Slot<T> {
	filled: AtomicBool,
	frame_id: std::sync::Mutex<u64>,
	data: std::sync::Mutex<Option<T>>,
}

/// Lock-free-ish ring buffer that restores `frame_id` ordering across
/// parallel producers (e.g. several RGA workers). Capacity is rounded up to
/// a power of two so the ring index is a mask, not a modulo.
///
/// Each slot's "filled" flag is an inline `AtomicBool` rather than a
/// heap-allocated pointer to one, since the slot already lives behind the
/// ring's own `Vec`.
pub struct OrderedQueue<T> {
	capacity: usize,
	ring: Vec<Slot<T>>,
	expected_id: AtomicU64,
	total_enqueued: AtomicU64,
	total_dequeued: AtomicU64,
	timeout_skip: AtomicU64,
	slot_conflict: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
	pub total_enqueued: u64,
	pub total_dequeued: u64,
	pub timeout_skip: u64,
	pub slot_conflict: u64,
	pub pending: usize,
	pub timeout_rate: f64,
	pub conflict_rate: f64,
}

impl<T> OrderedQueue<T> {
	pub fn new(capacity: usize) -> Self {
		let capacity = next_power_of_two(capacity);
		let mut ring = Vec::with_capacity(capacity);
		for _ in 0..capacity {
			ring.push(Slot { filled: AtomicBool::new(false), frame_id: std::sync::Mutex::new(0), data: std::sync::Mutex::new(None) });
		}
		Self {
			capacity,
			ring,
			expected_id: AtomicU64::new(0),
			total_enqueued: AtomicU64::new(0),
			total_dequeued: AtomicU64::new(0),
			timeout_skip: AtomicU64::new(0),
			slot_conflict: AtomicU64::new(0),
		}
	}

	pub fn enqueue(&self, frame_id: u64, data: T, policy: OverflowPolicy) -> bool {
		let idx = (frame_id & (self.capacity as u64 - 1)) as usize;
		let slot = &self.ring[idx];

		if frame_id < self.expected_id.load(Ordering::Relaxed) {
			return false;
		}

		loop {
			match slot.filled.compare_exchange_weak(false, true, Ordering::AcqRel, Ordering::Relaxed) {
				Ok(()) => break,
				Err(_) => {
					self.slot_conflict.fetch_add(1, Ordering::Relaxed);
					match policy {
						OverflowPolicy::DiscardNewest => return false,
						OverflowPolicy::DiscardOldest => {
							slot.filled.store(false, Ordering::Release);
						}
						OverflowPolicy::Block => {
							std::thread::sleep(Duration::from_micros(1));
						}
						OverflowPolicy::ThrowException => panic!("OrderedQueue slot conflict"),
					}
				}
			}
		}

		*slot.data.lock().unwrap() = Some(data);
		*slot.frame_id.lock().unwrap() = frame_id;
		self.total_enqueued.fetch_add(1, Ordering::Relaxed);
		true
	}

	pub fn try_dequeue(&self, timeout: Duration) -> Option<T> {
		let start = Instant::now();
		loop {
			let id = self.expected_id.load(Ordering::Relaxed);
			let idx = (id & (self.capacity as u64 - 1)) as usize;
			let slot = &self.ring[idx];

			if slot.filled.load(Ordering::Acquire) && *slot.frame_id.lock().unwrap() == id {
				let data = slot.data.lock().unwrap().take();
				slot.filled.store(false, Ordering::Release);
				let _ = self.expected_id.compare_exchange(id, id + 1, Ordering::Release, Ordering::Relaxed);
				self.total_dequeued.fetch_add(1, Ordering::Relaxed);
				return data;
			}

			if timeout.is_zero() {
				return None;
			}
			if start.elapsed() >= timeout {
				self.timeout_skip.fetch_add(1, Ordering::Relaxed);
				return None;
			}
			std::thread::sleep(Duration::from_micros(5));
		}
	}

	pub fn size(&self) -> usize {
		let enqueued = self.total_enqueued.load(Ordering::Relaxed);
		let dequeued = self.total_dequeued.load(Ordering::Relaxed);
		enqueued.saturating_sub(dequeued) as usize
	}

	pub fn is_empty(&self) -> bool {
		self.size() == 0
	}

	pub fn expected_id(&self) -> u64 {
		self.expected_id.load(Ordering::Relaxed)
	}

	pub fn stats(&self) -> Stats {
		let total_enqueued = self.total_enqueued.load(Ordering::Relaxed);
		let total_dequeued = self.total_dequeued.load(Ordering::Relaxed);
		let timeout_skip = self.timeout_skip.load(Ordering::Relaxed);
		let slot_conflict = self.slot_conflict.load(Ordering::Relaxed);
		let pending = self.ring.iter().filter(|s| s.filled.load(Ordering::Relaxed)).count();

		Stats {
			total_enqueued,
			total_dequeued,
			timeout_skip,
			slot_conflict,
			pending,
			timeout_rate: if total_dequeued > 0 { timeout_skip as f64 / total_dequeued as f64 } else { 0.0 },
			conflict_rate: if total_enqueued > 0 { slot_conflict as f64 / total_enqueued as f64 } else { 0.0 },
		}
	}

	pub fn reset_stats(&self) {
		self.total_enqueued.store(0, Ordering::Relaxed);
		self.total_dequeued.store(0, Ordering::Relaxed);
		self.timeout_skip.store(0, Ordering::Relaxed);
		self.slot_conflict.store(0, Ordering::Relaxed);
	}
}

fn next_power_of_two(n: usize) -> usize {
	n.next_power_of_two().max(1)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::sync::atomic::AtomicU64 as StdAtomicU64;

	#[test]
	fn capacity_rounds_up_to_power_of_two() {
		let queue: OrderedQueue<u32> = OrderedQueue::new(100);
		assert_eq!(queue.capacity, 128);
	}

	#[test]
	fn dequeues_in_strictly_monotonic_order() {
		let queue = OrderedQueue::new(16);
		for i in (0..8).rev() {
			queue.enqueue(i, i * 10, OverflowPolicy::DiscardNewest);
		}
		for i in 0..8u64 {
			assert_eq!(queue.try_dequeue(Duration::ZERO), Some(i * 10));
		}
		assert_eq!(queue.try_dequeue(Duration::ZERO), None);
	}

	#[test]
	fn stale_enqueue_below_expected_id_is_dropped() {
		let queue = OrderedQueue::new(16);
		assert!(queue.enqueue(0, 1u32, OverflowPolicy::DiscardNewest));
		assert_eq!(queue.try_dequeue(Duration::ZERO), Some(1));
		assert!(!queue.enqueue(0, 2u32, OverflowPolicy::DiscardNewest));
	}

	#[test]
	fn ten_producers_restore_monotonic_sequence() {
		let queue = Arc::new(OrderedQueue::new(1024));
		let next_expected = Arc::new(StdAtomicU64::new(0));

		std::thread::scope(|scope| {
			for producer in 0..10u64 {
				let queue = queue.clone();
				scope.spawn(move || {
					for i in (producer..1000).step_by(10) {
						queue.enqueue(i, i, OverflowPolicy::DiscardNewest);
					}
				});
			}
		});

		let mut last = None;
		while let Some(v) = queue.try_dequeue(Duration::from_millis(10)) {
			if let Some(last) = last {
				assert_eq!(v, last + 1);
			}
			last = Some(v);
		}
		let _ = next_expected;
	}
}
