//! Image decoding primitives.

pub mod thumbnail;

pub use thumbnail::{DEFAULT_MAX_EDGE, Thumbnail, decode_thumbnail};

pub type Result<T> = crate::Result<T>;
