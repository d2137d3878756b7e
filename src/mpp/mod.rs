//! Hardware H.264/MJPEG encoding: slot-pooled streaming encoder, segmented
//! stream writer, and a stateless single-shot JPEG snapshot path.

mod context;
mod encoder;
mod jpeg;
mod stream_writer;

pub use context::{Config, EncoderContext, RateControlMode, RawPacket};
pub use encoder::{EncodedMeta, EncodedPacket, MppEncoderCore, SlotGuard, SlotState, SLOT_COUNT};
pub use jpeg::{JpegConfig, JpegEncoder};
pub use stream_writer::StreamWriter;
