//! Many frame_ids racing into an `OrderedQueue` through a handful of workers
//! with uneven latency, and a single consumer that must observe a strictly
//! monotonic sequence regardless of submission order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use edge_vision_pipeline::ordered_queue::{OrderedQueue, OverflowPolicy};

#[test]
fn many_frames_through_a_worker_pool_restore_monotonic_order() {
	let queue = Arc::new(OrderedQueue::new(1024));
	const TOTAL: u64 = 10_000;
	const WORKERS: u64 = 4;

	let next_id = Arc::new(AtomicU64::new(0));
	let producers_done = Arc::new(std::sync::atomic::AtomicBool::new(false));

	let observed = std::thread::scope(|scope| {
		// Drain concurrently with production: the ring only holds 1024 slots,
		// so letting it fill up before dequeuing anything would discard most
		// of the later frame_ids before the consumer ever saw them.
		let consumer_queue = queue.clone();
		let consumer_done = producers_done.clone();
		let consumer = scope.spawn(move || {
			let mut last: Option<u64> = None;
			let mut count = 0u64;
			loop {
				match consumer_queue.try_dequeue(Duration::from_millis(2)) {
					Some(v) => {
						if let Some(last) = last {
							assert!(v > last, "expected strictly increasing sequence, got {v} after {last}");
						}
						last = Some(v);
						count += 1;
					}
					None if consumer_done.load(Ordering::Acquire) => break,
					None => continue,
				}
			}
			count
		});

		let producers: Vec<_> = (0..WORKERS)
			.map(|worker| {
				let queue = queue.clone();
				let next_id = next_id.clone();
				scope.spawn(move || loop {
					let id = next_id.fetch_add(1, Ordering::AcqRel);
					if id >= TOTAL {
						break;
					}
					// Deterministic stand-in for "randomized latency": stagger
					// each worker's processing time by its own index and the
					// item's position so submission order doesn't match id order.
					std::thread::sleep(Duration::from_micros((id % (worker + 7)) * 5));
					queue.enqueue(id, id, OverflowPolicy::DiscardNewest);
				})
			})
			.collect();

		for producer in producers {
			producer.join().unwrap();
		}
		producers_done.store(true, Ordering::Release);
		consumer.join().unwrap()
	});

	let stats = queue.stats();
	assert!(observed >= (TOTAL as f64 * 0.99) as u64, "lost too many frames: observed {observed}/{TOTAL}");
	// `try_dequeue` counts every timeout, including the ones the consumer hits
	// while simply waiting for the next id to arrive, so this only bounds the
	// *rate* rather than requiring zero.
	assert!(stats.timeout_rate < 0.5, "timeout rate too high: {}", stats.timeout_rate);
	assert!(
		(stats.slot_conflict as f64) < (TOTAL as f64 * 0.01),
		"slot-conflict count too high: {} of {TOTAL}",
		stats.slot_conflict
	);
}
