use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use super::encoder::{EncodedMeta, SlotGuard};

const FLUSH_THRESHOLD: usize = 2 * 1024 * 1024;

/// Writer-thread queue plus the segment file it is currently appending to.
struct WriterCtx {
	queue: Mutex<VecDeque<EncodedMeta>>,
	cv: Condvar,
	file: Mutex<Option<File>>,
}

impl WriterCtx {
	fn new() -> Self {
		Self { queue: Mutex::new(VecDeque::new()), cv: Condvar::new(), file: Mutex::new(None) }
	}

	/// Replaces the current segment file, flushing and advising the kernel
	/// to drop the previous one's page cache (it won't be read again).
	fn open_segment(&self, path: &Path) -> std::io::Result<()> {
		let new_file = File::create(path)?;
		let mut slot = self.file.lock().unwrap();
		if let Some(old) = slot.take() {
			let _ = old.sync_data();
			advise_dontneed(&old);
		}
		advise_sequential(&new_file);
		*slot = Some(new_file);
		Ok(())
	}
}

fn advise_sequential(file: &File) {
	unsafe {
		libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL);
	}
}

fn advise_dontneed(file: &File) {
	unsafe {
		libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
	}
}

/// Splits encoded H.264 packets across rotating segment files, handing each
/// segment to one of two writer threads so a fresh segment can be opened
/// while the previous one is still being flushed. A dedicated dispatch
/// thread owns the rotation decision (one I-frame boundary per
/// `packets_per_segment`) so writer threads stay single-purpose: pull a
/// meta, write its packet, release its slot.
pub struct StreamWriter {
	base_name: PathBuf,
	suffix: String,
	packets_per_segment: usize,
	current_packet_count: AtomicUsize,
	segment_index: AtomicUsize,
	dropped_until_first_keyframe: AtomicBool,

	dispatch_queue: Mutex<VecDeque<EncodedMeta>>,
	dispatch_cv: Condvar,

	writer_a: Arc<WriterCtx>,
	writer_b: Arc<WriterCtx>,
	current_is_a: AtomicBool,

	running: Arc<AtomicBool>,
	dispatch_thread: Mutex<Option<JoinHandle<()>>>,
	writer_thread_a: Mutex<Option<JoinHandle<()>>>,
	writer_thread_b: Mutex<Option<JoinHandle<()>>>,
}

impl StreamWriter {
	pub fn new(output_base: &Path) -> std::io::Result<Arc<Self>> {
		Self::with_packets_per_segment(output_base, 60)
	}

	pub fn with_packets_per_segment(output_base: &Path, packets_per_segment: u32) -> std::io::Result<Arc<Self>> {
		let (base_name, suffix) = split_suffix(output_base);

		let writer_a = Arc::new(WriterCtx::new());
		let writer_b = Arc::new(WriterCtx::new());
		writer_a.open_segment(&segment_path(&base_name, 1, &suffix))?;

		let writer = Arc::new(Self {
			base_name,
			suffix,
			packets_per_segment: packets_per_segment as usize,
			current_packet_count: AtomicUsize::new(0),
			segment_index: AtomicUsize::new(1),
			dropped_until_first_keyframe: AtomicBool::new(true),
			dispatch_queue: Mutex::new(VecDeque::new()),
			dispatch_cv: Condvar::new(),
			writer_a,
			writer_b,
			current_is_a: AtomicBool::new(true),
			running: Arc::new(AtomicBool::new(true)),
			dispatch_thread: Mutex::new(None),
			writer_thread_a: Mutex::new(None),
			writer_thread_b: Mutex::new(None),
		});

		writer.spawn_threads();
		Ok(writer)
	}

	fn spawn_threads(self: &Arc<Self>) {
		let dispatch_writer = self.clone();
		*self.dispatch_thread.lock().unwrap() = Some(
			std::thread::Builder::new()
				.name("stream-writer-dispatch".into())
				.spawn(move || dispatch_writer.dispatch_loop())
				.expect("failed to spawn stream-writer dispatch thread"),
		);

		let a_writer = self.clone();
		*self.writer_thread_a.lock().unwrap() = Some(
			std::thread::Builder::new()
				.name("stream-writer-a".into())
				.spawn(move || a_writer.writer_loop(a_writer.writer_a.clone()))
				.expect("failed to spawn stream-writer-a thread"),
		);

		let b_writer = self.clone();
		*self.writer_thread_b.lock().unwrap() = Some(
			std::thread::Builder::new()
				.name("stream-writer-b".into())
				.spawn(move || b_writer.writer_loop(b_writer.writer_b.clone()))
				.expect("failed to spawn stream-writer-b thread"),
		);
	}

	/// Enqueues a meta that already carries its encoded packet (the caller
	/// polled it off `MppEncoderCore::try_get_encoded_packet`). Never blocks.
	pub fn push_meta(&self, meta: EncodedMeta) -> bool {
		if !self.running.load(Ordering::Acquire) {
			return false;
		}
		self.dispatch_queue.lock().unwrap().push_back(meta);
		self.dispatch_cv.notify_all();
		true
	}

	fn dispatch_loop(self: Arc<Self>) {
		while self.running.load(Ordering::Acquire) {
			let meta = {
				let mut queue = self.dispatch_queue.lock().unwrap();
				loop {
					if let Some(m) = queue.pop_front() {
						break Some(m);
					}
					if !self.running.load(Ordering::Acquire) {
						break None;
					}
					queue = self.dispatch_cv.wait(queue).unwrap();
				}
			};
			let Some(meta) = meta else { break };

			let Some(core) = meta.core.clone() else {
				continue;
			};
			let guard = SlotGuard::new(core, meta.slot_id);
			let Some(packet) = meta.packet.clone() else {
				continue;
			};

			let mut cut_segment = false;
			if packet.keyframe {
				self.dropped_until_first_keyframe.store(false, Ordering::Release);
				let count = self.current_packet_count.fetch_add(1, Ordering::AcqRel) + 1;
				if count >= self.packets_per_segment {
					cut_segment = true;
				}
			}

			if cut_segment {
				let next_index = self.segment_index.fetch_add(1, Ordering::AcqRel) + 1;
				let idle = if self.current_is_a.load(Ordering::Acquire) { &self.writer_b } else { &self.writer_a };
				if let Err(e) = idle.open_segment(&segment_path(&self.base_name, next_index, &self.suffix)) {
					tracing::warn!("failed to open segment {next_index}: {e}");
				}
				self.current_is_a.fetch_xor(true, Ordering::AcqRel);
				self.current_packet_count.store(0, Ordering::Release);
			}

			if self.dropped_until_first_keyframe.load(Ordering::Acquire) {
				continue;
			}

			guard.release();
			let target = if self.current_is_a.load(Ordering::Acquire) { &self.writer_a } else { &self.writer_b };
			target.queue.lock().unwrap().push_back(meta);
			target.cv.notify_one();
		}
	}

	fn writer_loop(self: Arc<Self>, ctx: Arc<WriterCtx>) {
		let mut accumulated = 0usize;
		while self.running.load(Ordering::Acquire) {
			let meta = {
				let mut queue = ctx.queue.lock().unwrap();
				loop {
					if let Some(m) = queue.pop_front() {
						break Some(m);
					}
					if !self.running.load(Ordering::Acquire) {
						break None;
					}
					queue = ctx.cv.wait(queue).unwrap();
				}
			};
			let Some(meta) = meta else { break };

			let Some(core) = meta.core.clone() else { continue };
			let _guard = SlotGuard::new(core, meta.slot_id);
			let Some(packet) = meta.packet else { continue };

			let mut file_slot = ctx.file.lock().unwrap();
			let Some(file) = file_slot.as_mut() else {
				tracing::warn!("stream writer has no open segment, dropping packet");
				continue;
			};
			if let Err(e) = file.write_all(&packet.data) {
				tracing::warn!("failed to write packet: {e}");
				continue;
			}
			accumulated += packet.data.len();
			if accumulated >= FLUSH_THRESHOLD {
				let _ = file.flush();
				advise_dontneed(file);
				accumulated = 0;
			}
		}
	}

	pub fn stop(&self) {
		if !self.running.swap(false, Ordering::AcqRel) {
			return;
		}
		self.dispatch_cv.notify_all();
		self.writer_a.cv.notify_all();
		self.writer_b.cv.notify_all();
		if let Some(h) = self.dispatch_thread.lock().unwrap().take() {
			let _ = h.join();
		}
		if let Some(h) = self.writer_thread_a.lock().unwrap().take() {
			let _ = h.join();
		}
		if let Some(h) = self.writer_thread_b.lock().unwrap().take() {
			let _ = h.join();
		}
	}
}

impl Drop for StreamWriter {
	fn drop(&mut self) {
		self.stop();
	}
}

fn split_suffix(path: &Path) -> (PathBuf, String) {
	match path.extension() {
		Some(ext) => (path.with_extension(""), format!(".{}", ext.to_string_lossy())),
		None => (path.to_path_buf(), String::new()),
	}
}

fn segment_path(base: &Path, index: usize, suffix: &str) -> PathBuf {
	let mut name = base.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
	name.push_str(&format!("_{index:04}{suffix}"));
	match base.parent() {
		Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
		_ => PathBuf::from(name),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn segment_filenames_are_zero_padded() {
		let base = PathBuf::from("/var/lib/out");
		assert_eq!(segment_path(&base, 1, ".h264"), PathBuf::from("/var/lib/out_0001.h264"));
		assert_eq!(segment_path(&base, 23, ".h264"), PathBuf::from("/var/lib/out_0023.h264"));
	}

	#[test]
	fn split_suffix_handles_missing_extension() {
		let (base, suffix) = split_suffix(Path::new("/tmp/stream"));
		assert_eq!(base, PathBuf::from("/tmp/stream"));
		assert_eq!(suffix, "");
	}
}
