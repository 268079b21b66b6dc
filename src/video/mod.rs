//! Frame types and pixel formats.

pub mod format;
pub mod frame;

pub use format::{PixelFormat, Resolution};
pub use frame::{is_valid_jpeg, EncodedFrame, Frame};
