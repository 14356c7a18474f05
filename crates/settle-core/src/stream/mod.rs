//! Agent response stream: framing, classification and operation detection.

pub mod classify;
pub mod extract;
pub mod frame;

pub use classify::{StreamEvent, ToolContent, ToolResult, classify};
pub use extract::{Extraction, OPERATION_MARKER, extract};
pub use frame::{DecodeError, DecodeErrorKind, FrameDecoder, FrameStream};
