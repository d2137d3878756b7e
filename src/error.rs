use thiserror::Error;

/// Errors shared by every subsystem that talks to the kernel (DRM, V4L2, MPP, RGA).
///
/// Hot paths (capture loop, display loop, encoder worker) never propagate these:
/// they log the error, drop the single frame or packet affected, and continue.
/// Only construction of the process-wide singletons (`DeviceController`,
/// `MppEncoderCore`, the RGA converter) propagates a `PipelineError` to the caller.
#[derive(Error, Debug)]
pub enum PipelineError {
	#[error("failed to open device: {0}")]
	DeviceOpenFailed(String),

	#[error("required capability missing: {0}")]
	CapabilityMissing(String),

	#[error("ioctl {op} failed: {errno}")]
	IoctlFailed { op: &'static str, errno: nix::errno::Errno },

	#[error("allocation failed: {0}")]
	AllocationFailed(String),

	#[error("failed to import buffer: {0}")]
	BufferImportFailed(String),

	#[error("invalid state: {0}")]
	InvalidState(String),

	#[error("operation timed out after {0:?}")]
	Timeout(std::time::Duration),

	#[error("configuration rejected: {0}")]
	ConfigRejected(String),

	/// Transient: a hot-plug refresh is in progress. Collaborators should back
	/// off and retry after the device controller's post-refresh callback fires.
	#[error("hot-plug refresh pending")]
	HotPlugPending,

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
