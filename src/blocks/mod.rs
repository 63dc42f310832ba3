//! Built-in blocks.
//!
//! Real processing blocks (filters, demodulators, resamplers) live outside this
//! crate. These two are plumbing:
//! - [`PassThrough`] - copies its input to its output, format unchanged
//! - [`Discard`] - accepts anything and emits nothing, a terminal sink

mod discard;
mod pass_through;

pub use discard::*;
pub use pass_through::*;
