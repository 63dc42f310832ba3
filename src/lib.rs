//! Push-based DSP block graph.
//!
//! A [`DspGraph`] holds a tree of [`DspBlock`]s per source. Start-up negotiates a
//! sample rate and channel count from each source downwards, letting every block
//! accept, convert or reject what its producer offers; a rejection anywhere rolls
//! the whole tree back. Once running, a driver calls [`DspGraph::pump`] once per
//! frame period and the frame is pushed synchronously, depth-first, through every
//! block while the graph keeps per-block execution time counters.
//!
//! ```
//! use dspflow::{DspGraph, SourceConfig};
//! use dspflow::blocks::{Discard, PassThrough};
//!
//! let mut graph = DspGraph::new();
//! let source = graph.add_named_source("capture", PassThrough, SourceConfig::default());
//! let monitor = graph.add_named("monitor", Discard);
//! graph.connect(source, monitor)?;
//!
//! graph.start(source)?;
//! for _ in 0..4 {
//!     graph.source_buffer_mut(source)?.fill(0.25);
//!     graph.pump(source)?;
//! }
//! graph.stop(source)?;
//! # Ok::<(), dspflow::GraphError>(())
//! ```
//!
//! Graphs are single-threaded: `pump` owns the whole call stack for one frame.
//! Independent graphs can be driven from different threads.

mod clock;
mod error;
mod graph;
mod node;
mod source;
mod stats;
pub mod blocks;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{GraphError, ProcessingError, Result, TopologyError};
pub use graph::{DspGraph, FrameReport, Node, DEFAULT_NAME};
pub use node::{DspBlock, Negotiation, NodeId, ProcessContext, SourceId, StreamFormat};
pub use source::SourceConfig;
pub use stats::NodeStats;

/// One sample of an interleaved stream.
pub type Sample = f32;

pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
pub const DEFAULT_CHANNELS: usize = 2;
/// Frames per pump
pub const DEFAULT_BLOCK_SIZE: usize = 16384;
