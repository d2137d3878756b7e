use std::os::fd::RawFd;
use std::ptr;

use crate::error::{PipelineError, Result};

/// MPP-native rate control strategies this encoder exposes. `Avbr`/`Fixqp`
/// exist in the hardware but aren't wired through the pipeline's config.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateControlMode {
	Vbr,
	Cbr,
}

/// Encoder parameters the hardware context is (re)built from. Rebuilding
/// happens on `reset`, e.g. after a live bitrate or resolution change.
#[derive(Clone, Debug)]
pub struct Config {
	pub width: u32,
	pub height: u32,
	pub stride: u32,
	pub fps_in: (u32, u32),
	pub fps_out: (u32, u32),
	pub bps_target: u32,
	pub gop: u32,
	pub profile: u32,
	pub rc_mode: RateControlMode,
}

/// One encoded access unit copied out of MPP's packet buffer. Copying avoids
/// holding MPP's internal packet pool hostage for as long as a segment
/// writer needs the bytes; the pool is small (tens of packets) and reusing
/// it promptly matters a lot more than avoiding one memcpy per frame.
pub struct RawPacket {
	pub data: Vec<u8>,
	pub pts: u64,
	pub keyframe: bool,
}

/// Safe wrapper around one `MppCtx`/`MppApi` pair configured for encode.
/// Owns the raw handles; `Drop` tears them down in the order MPP requires
/// (api control deinit is implicit in `mpp_destroy`).
pub struct EncoderContext {
	ctx: mpp_sys::MppCtx,
	api: *mut mpp_sys::MppApi,
}

unsafe impl Send for EncoderContext {}

impl EncoderContext {
	pub fn new(config: &Config) -> Result<Self> {
		let mut ctx: mpp_sys::MppCtx = ptr::null_mut();
		let mut api: *mut mpp_sys::MppApi = ptr::null_mut();

		let ret = unsafe { mpp_sys::mpp_create(&mut ctx, &mut api) };
		check_ret(ret, "mpp_create")?;

		let ret = unsafe { mpp_sys::mpp_init(ctx, mpp_sys::MppCtxType_MPP_CTX_ENC, mpp_sys::MppCodingType_MPP_VIDEO_CodingAVC) };
		check_ret(ret, "mpp_init")?;

		let context = Self { ctx, api };
		context.apply_config(config)?;
		Ok(context)
	}

	/// Applies `config` plus the fixed ffmpeg-compatibility surface: NV12
	/// input, MPEG (16-235) color range, H.264 profile clamped to
	/// {Main=77, High=100}, and a level auto-selected from the pixel count.
	/// Mirrors `fixForFfmpeg` + the `rc:*`/`h264:*` key list an encoder
	/// context is expected to set before its first `MPP_ENC_SET_CFG`.
	fn apply_config(&self, config: &Config) -> Result<()> {
		let mut enc_cfg: mpp_sys::MppEncCfg = ptr::null_mut();
		let ret = unsafe { mpp_sys::mpp_enc_cfg_init(&mut enc_cfg) };
		check_ret(ret, "mpp_enc_cfg_init")?;

		let profile = match config.profile {
			77 | 100 => config.profile,
			_ => 77,
		};
		let pixels = config.width as u64 * config.height as u64;
		let level = if pixels <= 1280 * 720 {
			31
		} else if pixels <= 1920 * 1080 {
			40
		} else {
			51
		};
		let gop = if config.gop > 0 { config.gop } else { config.fps_out.0 * 2 };
		let bps_target = config.bps_target;
		let (rc_mode, bps_max, bps_min) = match config.rc_mode {
			RateControlMode::Cbr => (mpp_sys::MPP_ENC_RC_MODE_CBR, bps_target * 17 / 16, bps_target * 15 / 16),
			RateControlMode::Vbr => (mpp_sys::MPP_ENC_RC_MODE_VBR, bps_target * 17 / 16, bps_target / 16),
		};

		unsafe {
			set_s32(enc_cfg, c"prep:width", config.width as i32);
			set_s32(enc_cfg, c"prep:height", config.height as i32);
			set_s32(enc_cfg, c"prep:hor_stride", config.stride as i32);
			set_s32(enc_cfg, c"prep:ver_stride", config.height as i32);
			set_s32(enc_cfg, c"prep:format", mpp_sys::MPP_FMT_YUV420SP as i32);

			set_s32(enc_cfg, c"rc:mode", rc_mode as i32);
			set_s32(enc_cfg, c"rc:fps_in_num", config.fps_in.0 as i32);
			set_s32(enc_cfg, c"rc:fps_in_denorm", config.fps_in.1 as i32);
			set_s32(enc_cfg, c"rc:fps_out_num", config.fps_out.0 as i32);
			set_s32(enc_cfg, c"rc:fps_out_denorm", config.fps_out.1 as i32);
			set_s32(enc_cfg, c"rc:gop", gop as i32);

			set_s32(enc_cfg, c"rc:bps_target", bps_target as i32);
			set_s32(enc_cfg, c"rc:bps_max", bps_max as i32);
			set_s32(enc_cfg, c"rc:bps_min", bps_min as i32);
			set_s32(enc_cfg, c"rc:force_idr_interval", 1);

			// FIXQP isn't wired through `RateControlMode`, so these stay at the
			// non-FIXQP defaults `encoderContext.cpp` falls back to.
			set_s32(enc_cfg, c"rc:qp_init", -1);
			set_s32(enc_cfg, c"rc:qp_max", 51);
			set_s32(enc_cfg, c"rc:qp_min", 10);
			set_s32(enc_cfg, c"rc:qp_max_i", 51);
			set_s32(enc_cfg, c"rc:qp_min_i", 10);
			set_s32(enc_cfg, c"rc:qp_ip", 2);

			set_s32(enc_cfg, c"h264:profile", profile as i32);
			set_s32(enc_cfg, c"h264:level", level);

			// Forced MPEG range regardless of the sensor's native range: ffmpeg
			// mishandles anything else when remuxing the raw Annex-B stream.
			set_s32(enc_cfg, c"rc:color_range_override", 1);

			let control = (*self.api).control.ok_or_else(|| PipelineError::ConfigRejected("MppApi::control missing".into()))?;

			let mut sei_mode: i32 = mpp_sys::MPP_ENC_SEI_MODE_ONE_FRAME as i32;
			control(self.ctx, mpp_sys::MPP_ENC_SET_SEI_CFG, &mut sei_mode as *mut i32 as *mut _);
			let mut header_mode: i32 = mpp_sys::MPP_ENC_HEADER_MODE_EACH_IDR as i32;
			control(self.ctx, mpp_sys::MPP_ENC_SET_HEADER_MODE, &mut header_mode as *mut i32 as *mut _);

			let ret = control(self.ctx, mpp_sys::MPP_ENC_SET_CFG, enc_cfg as *mut _);
			mpp_sys::mpp_enc_cfg_deinit(enc_cfg);
			check_ret(ret, "MPP_ENC_SET_CFG")?;
		}
		Ok(())
	}

	pub fn reset(&mut self, config: &Config) -> Result<()> {
		self.apply_config(config)
	}

	/// Imports a DMA-BUF fd as an `MppBuffer`, wraps it in an `MppFrame`
	/// describing the NV12 layout, and hands it to the encoder. The frame
	/// and the imported buffer handle are released before returning.
	pub fn encode_put_frame(&self, fd: RawFd, width: u32, height: u32, stride: u32, pts: u64, eos: bool) -> Result<()> {
		let mut buffer: mpp_sys::MppBuffer = ptr::null_mut();
		let mut buffer_info = mpp_sys::MppBufferInfo {
			type_: mpp_sys::MppBufferType_MPP_BUFFER_TYPE_DMA_HEAP,
			size: (stride * height * 3 / 2) as usize,
			fd,
			ptr: ptr::null_mut(),
			hnd: ptr::null_mut(),
			index: 0,
		};
		let ret = unsafe { mpp_sys::mpp_buffer_import(&mut buffer, &mut buffer_info) };
		check_ret(ret, "mpp_buffer_import")?;

		let mut frame: mpp_sys::MppFrame = ptr::null_mut();
		let ret = unsafe { mpp_sys::mpp_frame_init(&mut frame) };
		if ret != 0 {
			unsafe { mpp_sys::mpp_buffer_put(buffer) };
			return Err(mpp_err("mpp_frame_init", ret));
		}

		unsafe {
			mpp_sys::mpp_frame_set_width(frame, width);
			mpp_sys::mpp_frame_set_height(frame, height);
			mpp_sys::mpp_frame_set_hor_stride(frame, stride as i32);
			mpp_sys::mpp_frame_set_ver_stride(frame, height as i32);
			mpp_sys::mpp_frame_set_fmt(frame, mpp_sys::MPP_FMT_YUV420SP);
			mpp_sys::mpp_frame_set_buffer(frame, buffer);
			mpp_sys::mpp_frame_set_pts(frame, pts as i64);
			if eos {
				mpp_sys::mpp_frame_set_eos(frame, 1);
			}
		}

		let result = unsafe {
			let encode_put_frame = (*self.api).encode_put_frame.ok_or_else(|| PipelineError::ConfigRejected("MppApi::encode_put_frame missing".into()))?;
			let ret = encode_put_frame(self.ctx, frame);
			check_ret(ret, "encode_put_frame")
		};

		unsafe {
			mpp_sys::mpp_frame_deinit(&mut frame);
			mpp_sys::mpp_buffer_put(buffer);
		}
		result
	}

	/// Drains at most one packet from the encoder. Returns `Ok(None)` when
	/// nothing is ready yet (non-blocking mode).
	pub fn encode_get_packet(&self) -> Result<Option<RawPacket>> {
		let mut packet: mpp_sys::MppPacket = ptr::null_mut();
		let ret = unsafe {
			let encode_get_packet = (*self.api).encode_get_packet.ok_or_else(|| PipelineError::ConfigRejected("MppApi::encode_get_packet missing".into()))?;
			encode_get_packet(self.ctx, &mut packet)
		};
		check_ret(ret, "encode_get_packet")?;
		if packet.is_null() {
			return Ok(None);
		}

		let ptr = unsafe { mpp_sys::mpp_packet_get_pos(packet) } as *const u8;
		let len = unsafe { mpp_sys::mpp_packet_get_length(packet) } as usize;
		let pts = unsafe { mpp_sys::mpp_packet_get_pts(packet) } as u64;
		let flag = unsafe { mpp_sys::mpp_packet_get_flag(packet) };
		let keyframe = flag & mpp_sys::MPP_PACKET_FLAG_INTRA as u32 != 0;

		let data = if ptr.is_null() || len == 0 { Vec::new() } else { unsafe { std::slice::from_raw_parts(ptr, len).to_vec() } };

		unsafe { mpp_sys::mpp_packet_deinit(&mut packet) };
		Ok(Some(RawPacket { data, pts, keyframe }))
	}
}

impl Drop for EncoderContext {
	fn drop(&mut self) {
		unsafe {
			mpp_sys::mpp_destroy(self.ctx);
		}
	}
}

unsafe fn set_s32(cfg: mpp_sys::MppEncCfg, name: &std::ffi::CStr, value: i32) {
	mpp_sys::mpp_enc_cfg_set_s32(cfg, name.as_ptr(), value);
}

fn check_ret(ret: mpp_sys::MPP_RET, op: &'static str) -> Result<()> {
	if ret == 0 {
		Ok(())
	} else {
		Err(mpp_err(op, ret))
	}
}

fn mpp_err(op: &'static str, ret: mpp_sys::MPP_RET) -> PipelineError {
	PipelineError::IoctlFailed { op, errno: nix::errno::Errno::from_raw(ret) }
}
