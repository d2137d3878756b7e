use drm_fourcc::DrmFourcc;

/// Per-plane `(width_scale, height_scale)` for a FOURCC, plus bits-per-pixel.
///
/// NV12 is modelled as a *single* physical plane with ratio `(1.0, 1.5)`
/// because capture drivers hand back Y and UV contiguously; the UV half is
/// later exposed as an imported view over the same FD at `offset = pitch * height`.
#[derive(Clone, Copy, Debug)]
pub struct PlaneFormatInfo {
	pub ratios: &'static [(f32, f32)],
	pub bpp: u32,
}

pub fn plane_info(format: DrmFourcc) -> Option<PlaneFormatInfo> {
	match format {
		DrmFourcc::Nv12 => Some(PlaneFormatInfo { ratios: &[(1.0, 1.5)], bpp: 8 }),
		DrmFourcc::Yuyv => Some(PlaneFormatInfo { ratios: &[(1.0, 1.0)], bpp: 16 }),
		DrmFourcc::Xrgb8888 | DrmFourcc::Argb8888 | DrmFourcc::Abgr8888 | DrmFourcc::Xbgr8888 => {
			Some(PlaneFormatInfo { ratios: &[(1.0, 1.0)], bpp: 32 })
		}
		DrmFourcc::Rgb888 | DrmFourcc::Bgr888 => Some(PlaneFormatInfo { ratios: &[(1.0, 1.0)], bpp: 24 }),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn nv12_is_a_single_plane_with_half_height_chroma() {
		let info = plane_info(DrmFourcc::Nv12).unwrap();
		assert_eq!(info.ratios, &[(1.0, 1.5)]);
		assert_eq!(info.bpp, 8);
	}

	#[test]
	fn unsupported_fourcc_is_none() {
		assert!(plane_info(DrmFourcc::C8).is_none());
	}
}
