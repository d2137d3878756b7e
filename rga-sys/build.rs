use bindgen::builder;

use std::env;
use std::path::PathBuf;

fn main() {
	println!("cargo:rerun-if-changed=wrapper.h");
	println!("cargo:rustc-link-lib=dylib=rga");
	println!("cargo:rustc-link-search=native=/usr/lib/aarch64-linux-gnu");

	// Generate bindings for Rockchip's librga (im2d.h C entry points: imcopy,
	// imresize, imcvtcolor, imfill, improcess).
	let bindings = builder()
		.header("wrapper.h")
		.clang_arg("-I/usr/include/rga")
		.allowlist_function("im.*")
		.allowlist_type("rga_.*")
		.allowlist_type("im_.*")
		.parse_callbacks(Box::new(bindgen::CargoCallbacks))
		.generate()
		.expect("Unable to generate RGA bindings");

	let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
	bindings
		.write_to_file(out_path.join("bindings.rs"))
		.expect("Couldn't write bindings!");
}
