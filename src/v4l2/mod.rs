//! V4L2 capture: device negotiation, buffer-ring management, and the
//! ref-counted `Frame` handle downstream consumers share zero-copy.

mod camera;
mod frame;
mod sys;

pub use camera::CameraController;
pub use frame::{Frame, FrameMeta, FrameQueue, ReleaseFn, SharedBufferState};
