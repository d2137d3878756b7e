use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::ptr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::dma::DmaBuffer;
use crate::error::{PipelineError, Result};

const MAX_RETRY: u32 = 50;
const RETRY_SLEEP: Duration = Duration::from_micros(2000);

/// Single-shot MJPEG encoder used for snapshot capture. Unlike
/// `MppEncoderCore` there is no slot pool or background worker: one call in,
/// one file out, blocking the caller for the duration of the encode.
#[derive(Clone, Debug)]
pub struct JpegConfig {
	pub width: u32,
	pub height: u32,
	pub quality: i32,
	pub save_dir: PathBuf,
}

pub struct JpegEncoder {
	ctx: Mutex<mpp_sys::MppCtx>,
	api: *mut mpp_sys::MppApi,
	config: Mutex<JpegConfig>,
}

unsafe impl Send for JpegEncoder {}
unsafe impl Sync for JpegEncoder {}

impl JpegEncoder {
	pub fn new(config: JpegConfig) -> Result<Self> {
		let mut ctx: mpp_sys::MppCtx = ptr::null_mut();
		let mut api: *mut mpp_sys::MppApi = ptr::null_mut();

		let ret = unsafe { mpp_sys::mpp_create(&mut ctx, &mut api) };
		check(ret, "mpp_create")?;
		let ret = unsafe { mpp_sys::mpp_init(ctx, mpp_sys::MppCtxType_MPP_CTX_ENC, mpp_sys::MppCodingType_MPP_VIDEO_CodingMJPEG) };
		check(ret, "mpp_init")?;

		let encoder = Self { ctx: Mutex::new(ctx), api, config: Mutex::new(config) };
		encoder.apply_config()?;
		fs::create_dir_all(&encoder.config.lock().unwrap().save_dir).map_err(PipelineError::Io)?;
		Ok(encoder)
	}

	fn apply_config(&self) -> Result<()> {
		let config = self.config.lock().unwrap().clone();
		let mut enc_cfg: mpp_sys::MppEncCfg = ptr::null_mut();
		let ret = unsafe { mpp_sys::mpp_enc_cfg_init(&mut enc_cfg) };
		check(ret, "mpp_enc_cfg_init")?;

		unsafe {
			mpp_sys::mpp_enc_cfg_set_s32(enc_cfg, c"prep:width".as_ptr(), config.width as i32);
			mpp_sys::mpp_enc_cfg_set_s32(enc_cfg, c"prep:height".as_ptr(), config.height as i32);
			mpp_sys::mpp_enc_cfg_set_s32(enc_cfg, c"prep:hor_stride".as_ptr(), config.width as i32);
			mpp_sys::mpp_enc_cfg_set_s32(enc_cfg, c"prep:ver_stride".as_ptr(), config.height as i32);
			mpp_sys::mpp_enc_cfg_set_s32(enc_cfg, c"prep:format".as_ptr(), mpp_sys::MPP_FMT_YUV420SP as i32);
			mpp_sys::mpp_enc_cfg_set_s32(enc_cfg, c"jpeg:quant".as_ptr(), config.quality);

			let ctx = *self.ctx.lock().unwrap();
			let control = (*self.api).control.ok_or_else(|| PipelineError::ConfigRejected("MppApi::control missing".into()))?;
			let ret = control(ctx, mpp_sys::MPP_ENC_SET_CFG, enc_cfg as *mut _);
			mpp_sys::mpp_enc_cfg_deinit(enc_cfg);
			check(ret, "MPP_ENC_SET_CFG")?;
		}
		Ok(())
	}

	pub fn reset_config(&self, config: JpegConfig) -> Result<()> {
		*self.config.lock().unwrap() = config;
		self.apply_config()
	}

	/// Imports `dmabuf`'s fd as an `MppBuffer`, builds a frame around it with
	/// the source's own dimensions and format, and encodes it to one JPEG
	/// file in `save_dir`.
	pub fn capture_from_dmabuf(&self, dmabuf: &DmaBuffer) -> Result<PathBuf> {
		self.capture_from_fd(dmabuf.fd(), dmabuf.width(), dmabuf.height(), dmabuf.pitch(), dmabuf.size())
	}

	/// Same as [`Self::capture_from_dmabuf`] but for a frame that only carries
	/// a raw DMA-BUF fd (e.g. a `v4l2::Frame` in `SharedBufferState::DmaBufFd`
	/// form) rather than an owned `DmaBuffer`. Blocks (polling every 2ms, up
	/// to `MAX_RETRY` times) until MPP hands back a packet or the retry
	/// budget runs out.
	pub fn capture_from_fd(&self, fd: std::os::fd::RawFd, width: u32, height: u32, pitch: u32, size: u32) -> Result<PathBuf> {
		let mut buffer: mpp_sys::MppBuffer = ptr::null_mut();
		let mut buffer_info = mpp_sys::MppBufferInfo {
			type_: mpp_sys::MppBufferType_MPP_BUFFER_TYPE_EXT_DMA,
			size: size as usize,
			fd,
			ptr: ptr::null_mut(),
			hnd: ptr::null_mut(),
			index: 0,
		};
		let ret = unsafe { mpp_sys::mpp_buffer_import(&mut buffer, &mut buffer_info) };
		check(ret, "mpp_buffer_import")?;

		let mut frame: mpp_sys::MppFrame = ptr::null_mut();
		let ret = unsafe { mpp_sys::mpp_frame_init(&mut frame) };
		if ret != 0 {
			unsafe { mpp_sys::mpp_buffer_put(buffer) };
			return Err(mpp_err("mpp_frame_init", ret));
		}

		unsafe {
			mpp_sys::mpp_frame_set_width(frame, width);
			mpp_sys::mpp_frame_set_height(frame, height);
			mpp_sys::mpp_frame_set_hor_stride(frame, pitch as i32);
			mpp_sys::mpp_frame_set_ver_stride(frame, height as i32);
			mpp_sys::mpp_frame_set_fmt(frame, mpp_sys::MPP_FMT_YUV420SP);
			mpp_sys::mpp_frame_set_buffer(frame, buffer);
		}

		let path = self.generate_filename();
		let result = self.encode_to_file(frame, &path);

		unsafe {
			mpp_sys::mpp_frame_deinit(&mut frame);
			mpp_sys::mpp_buffer_put(buffer);
		}

		result.map(|_| path)
	}

	fn encode_to_file(&self, frame: mpp_sys::MppFrame, path: &std::path::Path) -> Result<()> {
		let ctx = *self.ctx.lock().unwrap();
		unsafe {
			let encode_put_frame = (*self.api).encode_put_frame.ok_or_else(|| PipelineError::ConfigRejected("MppApi::encode_put_frame missing".into()))?;
			check(encode_put_frame(ctx, frame), "encode_put_frame")?;
		}

		let mut packet: mpp_sys::MppPacket = ptr::null_mut();
		for _ in 0..MAX_RETRY {
			let ret = unsafe {
				let encode_get_packet = (*self.api).encode_get_packet.ok_or_else(|| PipelineError::ConfigRejected("MppApi::encode_get_packet missing".into()))?;
				encode_get_packet(ctx, &mut packet)
			};
			if ret == 0 && !packet.is_null() {
				break;
			}
			std::thread::sleep(RETRY_SLEEP);
		}
		if packet.is_null() {
			return Err(PipelineError::Timeout(RETRY_SLEEP * MAX_RETRY));
		}

		let ptr = unsafe { mpp_sys::mpp_packet_get_data(packet) } as *const u8;
		let len = unsafe { mpp_sys::mpp_packet_get_length(packet) } as usize;
		let data = if ptr.is_null() || len == 0 { &[][..] } else { unsafe { std::slice::from_raw_parts(ptr, len) } };

		let write_result = fs::File::create(path).and_then(|mut f| f.write_all(data)).map_err(PipelineError::Io);
		unsafe { mpp_sys::mpp_packet_deinit(&mut packet) };
		write_result
	}

	fn generate_filename(&self) -> PathBuf {
		let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
		let millis = now.subsec_millis();
		let save_dir = self.config.lock().unwrap().save_dir.clone();

		let timestamp = time::OffsetDateTime::UNIX_EPOCH + now;
		let name = format!(
			"{:04}{:02}{:02}_{:02}{:02}{:02}_{millis:03}.jpg",
			timestamp.year(),
			u8::from(timestamp.month()),
			timestamp.day(),
			timestamp.hour(),
			timestamp.minute(),
			timestamp.second(),
		);
		save_dir.join(name)
	}
}

impl Drop for JpegEncoder {
	fn drop(&mut self) {
		unsafe {
			mpp_sys::mpp_destroy(*self.ctx.lock().unwrap());
		}
	}
}

fn check(ret: mpp_sys::MPP_RET, op: &'static str) -> Result<()> {
	if ret == 0 {
		Ok(())
	} else {
		Err(mpp_err(op, ret))
	}
}

fn mpp_err(op: &'static str, ret: mpp_sys::MPP_RET) -> PipelineError {
	PipelineError::IoctlFailed { op, errno: nix::errno::Errno::from_raw(ret) }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn config_carries_requested_dimensions() {
		let config = JpegConfig { width: 1920, height: 1080, quality: 8, save_dir: PathBuf::from("/tmp/snapshots") };
		assert_eq!((config.width, config.height), (1920, 1080));
	}
}
