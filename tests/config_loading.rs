//! Config-file round trip: parse a TOML file on disk, confirm every field
//! lands where expected, and confirm `~`/env-var expansion runs on the path
//! fields without the caller having to do it themselves.

use std::io::Write;

use edge_vision_pipeline::config::Config;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
	let mut file = tempfile::NamedTempFile::new().expect("create temp config file");
	file.write_all(contents.as_bytes()).expect("write temp config file");
	file
}

#[test]
fn reads_full_config_from_file() {
	let file = write_config(
		r#"
        [camera]
        device = "/dev/video1"
        width = 1920
        height = 1080
        buffer_count = 6
        use_dmabuf = true

        [display]
        card = "/dev/dri/card1"
        fb_cache_size = 3

        [encoder]
        width = 1920
        height = 1080
        stride = 1920
        fps_in = [30, 1]
        fps_out = [30, 1]
        bps_target = 8000000
        gop = 30
        profile = 100
        output_base = "/var/lib/out.h264"
        packets_per_segment = 30

        [jpeg]
        save_dir = "/var/lib/snapshots"
        quality = 85
        "#,
	);

	let config = Config::read_from_file(file.path()).expect("parse config file");

	assert_eq!(config.camera.width, 1920);
	assert_eq!(config.camera.height, 1080);
	assert_eq!(config.camera.buffer_count, 6);
	assert!(config.camera.use_dmabuf);
	assert_eq!(config.display.fb_cache_size, 3);
	assert_eq!(config.encoder.profile, 100);
	assert_eq!(config.encoder.packets_per_segment, 30);
	assert_eq!(config.jpeg.quality, 85);
}

#[test]
fn expands_home_directory_in_path_fields() {
	let home = std::env::var("HOME").expect("HOME must be set to run this test");
	let file = write_config(
		r#"
        [camera]
        device = "~/cam0"
        width = 1280
        height = 720
        buffer_count = 4
        use_dmabuf = false

        [display]
        card = "/dev/dri/card0"
        fb_cache_size = 2

        [encoder]
        width = 1280
        height = 720
        stride = 1280
        fps_in = [30, 1]
        fps_out = [30, 1]
        bps_target = 4000000
        gop = 60
        profile = 77
        output_base = "~/recordings/out.h264"
        packets_per_segment = 60

        [jpeg]
        save_dir = "~/snapshots"
        quality = 90
        "#,
	);

	let config = Config::read_from_file(file.path()).expect("parse config file");

	assert_eq!(config.camera.device, std::path::PathBuf::from(format!("{home}/cam0")));
	assert_eq!(config.encoder.output_base, std::path::PathBuf::from(format!("{home}/recordings/out.h264")));
	assert_eq!(config.jpeg.save_dir, std::path::PathBuf::from(format!("{home}/snapshots")));
}

#[test]
fn rejects_malformed_toml() {
	let file = write_config("this is not valid toml {{{");
	assert!(Config::read_from_file(file.path()).is_err());
}

#[test]
fn rejects_missing_file() {
	assert!(Config::read_from_file("/nonexistent/path/to/config.toml").is_err());
}
