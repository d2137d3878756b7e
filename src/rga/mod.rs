//! RGA 2D hardware format conversion: NV12 camera frames to an RGA-native
//! format consumed by the display compositor and (contract-only) inference
//! preprocessing.

mod format;
mod processor;

pub use format::drm_to_rga;
pub use processor::{Config, RgaProcessor};
