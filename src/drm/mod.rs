//! DRM/KMS: device enumeration, per-plane layer state, and the atomic-commit
//! compositor that ties them together.

mod compositor;
mod device;
mod display;
mod layer;
mod udev_monitor;

pub use compositor::PlanesCompositor;
pub use device::{DeviceController, DevicePtr, PlaneCacheEntry, PlaneType};
pub use display::{DisplayManager, PlaneConfig, PlaneHandle};
pub use layer::{DrmLayer, LayerProperties, PropertyValue};
