//! Zero-copy DMA-BUF buffers: the primitive every other subsystem shares
//! frames through. See `buffer::DmaBuffer`.

mod buffer;
mod format;

pub use buffer::{DmaBuffer, MappedView};
pub use format::plane_info;
