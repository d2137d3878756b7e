//! Minimal subset of `linux/videodev2.h` needed for REQBUFS/QBUF/DQBUF on
//! both MMAP and DMABUF memory types. The `v4l` crate covers capability and
//! format negotiation; it doesn't expose a generic enough buffer-queue API
//! for DMABUF import, so that slice is done here with the same raw-ioctl
//! approach used by other from-scratch V4L2 clients.

#![allow(non_camel_case_types, dead_code)]

use std::os::fd::RawFd;

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;

pub const V4L2_CAP_VIDEO_CAPTURE_MPLANE: u32 = 0x0000_1000;

pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_MEMORY_DMABUF: u32 = 4;

pub const VIDEO_MAX_PLANES: usize = 8;

pub const V4L2_PIX_FMT_NV12: u32 = fourcc(b"NV12");
pub const V4L2_PIX_FMT_YUYV: u32 = fourcc(b"YUYV");

const fn fourcc(code: &[u8; 4]) -> u32 {
	(code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct v4l2_timeval {
	pub tv_sec: i64,
	pub tv_usec: i64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct v4l2_fract {
	pub numerator: u32,
	pub denominator: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct v4l2_pix_format {
	pub width: u32,
	pub height: u32,
	pub pixelformat: u32,
	pub field: u32,
	pub bytesperline: u32,
	pub sizeimage: u32,
	pub colorspace: u32,
	pub priv_: u32,
	pub flags: u32,
	pub ycbcr_enc: u32,
	pub quantization: u32,
	pub xfer_func: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct v4l2_plane_pix_format {
	pub sizeimage: u32,
	pub bytesperline: u32,
	pub reserved: [u16; 6],
}

/// `struct v4l2_pix_format_mplane`. Used instead of `v4l2_pix_format` when the
/// device is opened with `V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct v4l2_pix_format_mplane {
	pub width: u32,
	pub height: u32,
	pub pixelformat: u32,
	pub field: u32,
	pub colorspace: u32,
	pub plane_fmt: [v4l2_plane_pix_format; VIDEO_MAX_PLANES],
	pub num_planes: u8,
	pub flags: u8,
	pub ycbcr_enc: u8,
	pub quantization: u8,
	pub xfer_func: u8,
	pub reserved: [u8; 7],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_format_fmt {
	pub pix: v4l2_pix_format,
	pub pix_mp: v4l2_pix_format_mplane,
	pub raw_data: [u8; 200],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_format {
	pub type_: u32,
	pub fmt: v4l2_format_fmt,
}

impl Default for v4l2_format {
	fn default() -> Self {
		Self { type_: 0, fmt: v4l2_format_fmt { raw_data: [0u8; 200] } }
	}
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct v4l2_requestbuffers {
	pub count: u32,
	pub type_: u32,
	pub memory: u32,
	pub capabilities: u32,
	pub reserved: [u32; 1],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_buffer_m {
	pub offset: u32,
	pub userptr: std::os::raw::c_ulong,
	pub planes: *mut std::os::raw::c_void,
	pub fd: RawFd,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_buffer {
	pub index: u32,
	pub type_: u32,
	pub bytesused: u32,
	pub flags: u32,
	pub field: u32,
	pub timestamp: v4l2_timeval,
	pub timecode: [u8; 32],
	pub sequence: u32,
	pub memory: u32,
	pub m: v4l2_buffer_m,
	pub length: u32,
	pub reserved2: u32,
	pub request_fd: RawFd,
}

impl Default for v4l2_buffer {
	fn default() -> Self {
		Self {
			index: 0,
			type_: 0,
			bytesused: 0,
			flags: 0,
			field: 0,
			timestamp: v4l2_timeval::default(),
			timecode: [0u8; 32],
			sequence: 0,
			memory: 0,
			m: v4l2_buffer_m { offset: 0 },
			length: 0,
			reserved2: 0,
			request_fd: -1,
		}
	}
}

/// One plane of a `V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE` buffer.
#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_plane_m {
	pub mem_offset: u32,
	pub userptr: std::os::raw::c_ulong,
	pub fd: RawFd,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_plane {
	pub bytesused: u32,
	pub length: u32,
	pub m: v4l2_plane_m,
	pub data_offset: u32,
	pub reserved: [u32; 11],
}

impl Default for v4l2_plane {
	fn default() -> Self {
		Self { bytesused: 0, length: 0, m: v4l2_plane_m { mem_offset: 0 }, data_offset: 0, reserved: [0; 11] }
	}
}

pub const V4L2_CID_BASE: u32 = 0x00980900;
pub const V4L2_CID_HFLIP: u32 = V4L2_CID_BASE + 20;
pub const V4L2_CID_VFLIP: u32 = V4L2_CID_BASE + 21;
pub const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = V4L2_CID_BASE + 200 + 17;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct v4l2_control {
	pub id: u32,
	pub value: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct v4l2_queryctrl {
	pub id: u32,
	pub type_: u32,
	pub name: [u8; 32],
	pub minimum: i32,
	pub maximum: i32,
	pub step: i32,
	pub default_value: i32,
	pub flags: u32,
	pub reserved: [u32; 2],
}

const VIDIOC_MAGIC: u8 = b'V';

nix::ioctl_readwrite!(vidioc_g_fmt, VIDIOC_MAGIC, 4, v4l2_format);
nix::ioctl_readwrite!(vidioc_s_fmt, VIDIOC_MAGIC, 5, v4l2_format);
nix::ioctl_readwrite!(vidioc_reqbufs, VIDIOC_MAGIC, 8, v4l2_requestbuffers);
nix::ioctl_readwrite!(vidioc_querybuf, VIDIOC_MAGIC, 9, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_qbuf, VIDIOC_MAGIC, 15, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_dqbuf, VIDIOC_MAGIC, 17, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_streamon, VIDIOC_MAGIC, 18, u32);
nix::ioctl_readwrite!(vidioc_streamoff, VIDIOC_MAGIC, 19, u32);
nix::ioctl_readwrite!(vidioc_queryctrl, VIDIOC_MAGIC, 36, v4l2_queryctrl);
nix::ioctl_readwrite!(vidioc_g_ctrl, VIDIOC_MAGIC, 27, v4l2_control);
nix::ioctl_readwrite!(vidioc_s_ctrl, VIDIOC_MAGIC, 28, v4l2_control);
