//! Identifier and timestamp types shared by every protocol component.

mod stream_id;
mod timestamp;

pub use stream_id::StreamId;
pub use timestamp::UtcDateTime;
