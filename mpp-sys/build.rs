use bindgen::builder;

use std::env;
use std::path::PathBuf;

fn main() {
	println!("cargo:rerun-if-changed=wrapper.h");
	println!("cargo:rustc-link-lib=dylib=rockchip_mpp");
	println!("cargo:rustc-link-search=native=/usr/lib/aarch64-linux-gnu");

	// Generate bindings for the Rockchip MPP headers (rk_mpi.h, mpp_frame.h,
	// mpp_packet.h, mpp_buffer.h, rk_venc_cmd.h) installed by the board's SDK.
	let bindings = builder()
		.header("wrapper.h")
		.clang_arg("-I/usr/include/rockchip")
		.allowlist_function("mpp_.*")
		.allowlist_function("rk_mpi_.*")
		.allowlist_type("Mpp.*")
		.allowlist_type("mpp_.*")
		.parse_callbacks(Box::new(bindgen::CargoCallbacks))
		.generate()
		.expect("Unable to generate MPP bindings");

	let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
	bindings
		.write_to_file(out_path.join("bindings.rs"))
		.expect("Couldn't write bindings!");
}
