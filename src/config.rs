use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
	/// Configuration for the camera capture ring.
	pub camera: CameraConfig,

	/// Configuration for the display compositor.
	pub display: DisplayConfig,

	/// Configuration for the MPP hardware encoder.
	pub encoder: EncoderConfig,

	/// Configuration for JPEG snapshot capture.
	pub jpeg: JpegConfig,
}

impl Config {
	#[allow(clippy::result_unit_err)]
	pub fn read_from_file<P: AsRef<Path>>(file: P) -> Result<Config, ()> {
		let raw = std::fs::read_to_string(file)
			.map_err(|e| tracing::error!("Failed to open configuration file: {e}"))?;
		let mut config: Config = toml::from_str(&raw)
			.map_err(|e| tracing::error!("Failed to parse configuration file: {e}"))?;

		config.expand_paths();
		Ok(config)
	}

	/// Expands `~` and environment variables in every path field, so config
	/// files can say `~/recordings/out.h264` instead of a hardcoded home dir.
	fn expand_paths(&mut self) {
		self.camera.device = expand_path(&self.camera.device);
		self.display.card = expand_path(&self.display.card);
		self.encoder.output_base = expand_path(&self.encoder.output_base);
		self.jpeg.save_dir = expand_path(&self.jpeg.save_dir);
	}
}

fn expand_path(path: &Path) -> PathBuf {
	match shellexpand::full(&path.to_string_lossy()) {
		Ok(expanded) => PathBuf::from(expanded.into_owned()),
		Err(_) => path.to_path_buf(),
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			camera: Default::default(),
			display: Default::default(),
			encoder: Default::default(),
			jpeg: Default::default(),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraConfig {
	/// Path to the V4L2 device node.
	pub device: PathBuf,

	/// Requested capture width.
	pub width: u32,

	/// Requested capture height.
	pub height: u32,

	/// Number of capture buffers to request from the driver.
	pub buffer_count: u32,

	/// Whether to request DMA-BUF backed buffers instead of MMAP.
	pub use_dmabuf: bool,
}

impl Default for CameraConfig {
	fn default() -> Self {
		Self {
			device: "/dev/video0".into(),
			width: 1280,
			height: 720,
			buffer_count: 4,
			use_dmabuf: false,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DisplayConfig {
	/// Path to the DRM render/primary node.
	pub card: PathBuf,

	/// Depth of each plane's framebuffer cache (see `DrmLayer::fb_cache`).
	pub fb_cache_size: usize,
}

impl Default for DisplayConfig {
	fn default() -> Self {
		Self {
			card: "/dev/dri/card0".into(),
			fb_cache_size: 2,
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateControlMode {
	Vbr,
	Cbr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncoderConfig {
	/// Target output width.
	pub width: u32,

	/// Target output height.
	pub height: u32,

	/// Input pixel stride in bytes.
	pub stride: u32,

	/// Numerator/denominator of the input frame rate.
	pub fps_in: (u32, u32),

	/// Numerator/denominator of the output frame rate.
	pub fps_out: (u32, u32),

	/// Target bitrate in bits per second.
	pub bps_target: u32,

	/// Group-of-pictures length, in frames.
	pub gop: u32,

	/// H.264 profile (77 = Main, 100 = High).
	pub profile: u32,

	/// Rate control strategy: `"vbr"` or `"cbr"`.
	pub rc_mode: RateControlMode,

	/// Output base path; segments are written as `<base>_%04d.h264`.
	pub output_base: PathBuf,

	/// Number of I-frames per output segment.
	pub packets_per_segment: u32,
}

impl Default for EncoderConfig {
	fn default() -> Self {
		let target = 4_000_000;
		Self {
			width: 1280,
			height: 720,
			stride: 1280,
			fps_in: (30, 1),
			fps_out: (30, 1),
			bps_target: target,
			gop: 60,
			profile: 77,
			rc_mode: RateControlMode::Vbr,
			output_base: "/var/lib/edge-vision-pipeline/out.h264".into(),
			packets_per_segment: 60,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JpegConfig {
	/// Directory snapshots are written to.
	pub save_dir: PathBuf,

	/// JPEG quality factor, 1-100.
	pub quality: u8,
}

impl Default for JpegConfig {
	fn default() -> Self {
		Self {
			save_dir: "/var/lib/edge-vision-pipeline/snapshots".into(),
			quality: 90,
		}
	}
}
