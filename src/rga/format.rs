use drm_fourcc::DrmFourcc;

/// librga's `RK_FORMAT_*` enum values (from `rga/RgaUtils.h`), duplicated
/// here rather than pulled through bindgen since they're plain integer
/// constants and the allowlist in `rga-sys/build.rs` only pulls in the
/// `im_*`/`rga_*` families.
const RK_FORMAT_YCBCR_420_SP: i32 = 0x3;
const RK_FORMAT_YUYV_422: i32 = 0x7;
const RK_FORMAT_RGBA_8888: i32 = 0x1;
const RK_FORMAT_RGBX_8888: i32 = 0x2;
const RK_FORMAT_BGR_888: i32 = 0x9;
const RK_FORMAT_RGB_888: i32 = 0x8;

/// Maps a DRM fourcc to the RK_FORMAT constant librga expects. Returns
/// `None` for formats RGA cannot source or sink directly.
pub fn drm_to_rga(format: DrmFourcc) -> Option<i32> {
	match format {
		DrmFourcc::Nv12 => Some(RK_FORMAT_YCBCR_420_SP),
		DrmFourcc::Yuyv => Some(RK_FORMAT_YUYV_422),
		DrmFourcc::Abgr8888 => Some(RK_FORMAT_RGBA_8888),
		DrmFourcc::Xbgr8888 => Some(RK_FORMAT_RGBX_8888),
		DrmFourcc::Bgr888 => Some(RK_FORMAT_RGB_888),
		DrmFourcc::Rgb888 => Some(RK_FORMAT_BGR_888),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn nv12_maps_to_ycbcr_420_sp() {
		assert_eq!(drm_to_rga(DrmFourcc::Nv12), Some(RK_FORMAT_YCBCR_420_SP));
	}

	#[test]
	fn unsupported_format_returns_none() {
		assert_eq!(drm_to_rga(DrmFourcc::C8), None);
	}
}
