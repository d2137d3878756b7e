use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use edge_vision_pipeline::config::Config;
use edge_vision_pipeline::pipeline::VisionPipeline;

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
	/// Path to configuration file. Falls back to built-in defaults if omitted.
	config: Option<PathBuf>,

	/// Show more log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	verbose: u8,

	/// Show less log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	quiet: u8,
}

fn log_filter(verbose: u8, quiet: u8) -> &'static str {
	match i16::from(verbose) - i16::from(quiet) {
		..=-2 => "error",
		-1 => "warn",
		0 => "info",
		1 => "debug",
		2.. => "trace",
	}
}

fn main() -> Result<(), ()> {
	let args = Args::parse();

	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter(args.verbose, args.quiet))))
		.init();

	let config = match args.config {
		Some(path) => Config::read_from_file(path)?,
		None => {
			tracing::info!("no config file given, using defaults");
			Config::default()
		}
	};

	tracing::debug!("using configuration:\n{:#?}", config);

	let pipeline = VisionPipeline::new(config).map_err(|e| {
		tracing::error!("failed to build vision pipeline: {e}");
	})?;

	pipeline.start().map_err(|e| {
		tracing::error!("failed to start vision pipeline: {e}");
	})?;

	let shutdown = Arc::new(AtomicBool::new(false));
	{
		let shutdown = shutdown.clone();
		ctrlc_handler(move || shutdown.store(true, Ordering::Release));
	}

	while !shutdown.load(Ordering::Acquire) {
		std::thread::sleep(Duration::from_millis(200));
	}

	tracing::info!("received interrupt signal, shutting down");
	pipeline.stop();
	Ok(())
}

/// Installs a `SIGINT`/`SIGTERM` handler via a raw `libc::signal` call rather
/// than pulling in a dedicated signal crate: the pipeline has no async
/// runtime to hand a future to, and a flag plus a polling loop is all a
/// synchronous shutdown needs.
fn ctrlc_handler(on_signal: impl Fn() + Send + Sync + 'static) {
	use std::sync::OnceLock;

	static HANDLER: OnceLock<Box<dyn Fn() + Send + Sync>> = OnceLock::new();
	let _ = HANDLER.set(Box::new(on_signal));

	extern "C" fn dispatch(_signum: i32) {
		if let Some(handler) = HANDLER.get() {
			handler();
		}
	}

	unsafe {
		libc::signal(libc::SIGINT, dispatch as usize);
		libc::signal(libc::SIGTERM, dispatch as usize);
	}
}
