//! Core block trait and context types.

use petgraph::stable_graph::NodeIndex;

use crate::Sample;

/// Unique identifier for a node within a [`DspGraph`](crate::DspGraph).
///
/// Ids stay valid when other nodes are removed from the graph. Arena slots are
/// recycled, so an id also carries the serial number of the node it was issued
/// for; an id whose node has been removed never resolves to a newer node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId {
    pub(crate) index: NodeIndex,
    pub(crate) serial: u32,
}

impl NodeId {
    /// Raw arena index, for diagnostics.
    pub fn index(self) -> usize {
        self.index.index()
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.index.index())
    }
}

/// Handle to a source node.
///
/// Only sources can be started, stopped and pumped from outside the graph.
/// A `SourceId` derefs to the underlying [`NodeId`] for connecting and diagnostics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SourceId(pub(crate) NodeId);

impl SourceId {
    pub fn node(self) -> NodeId {
        self.0
    }
}

impl core::ops::Deref for SourceId {
    type Target = NodeId;

    fn deref(&self) -> &NodeId {
        &self.0
    }
}

impl From<SourceId> for NodeId {
    fn from(source: SourceId) -> NodeId {
        source.0
    }
}

/// Sample rate and channel count of a stream.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StreamFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: usize,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self { sample_rate, channels }
    }

    /// Whether a producer has actually set this format.
    pub fn is_set(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0
    }

    /// Number of whole frames held by `samples` interleaved samples.
    pub fn frames(&self, samples: usize) -> usize {
        if self.channels == 0 {
            0
        } else {
            samples / self.channels
        }
    }
}

impl core::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} Hz / {} ch", self.sample_rate, self.channels)
    }
}

/// The format exchange seen by a block during [`DspBlock::init`].
///
/// The input side is whatever the producer decided. The output side starts out
/// equal to the input (pass-through) and may be changed by the block.
#[derive(Clone, Debug)]
pub struct Negotiation {
    pub(crate) input: StreamFormat,
    pub(crate) output: StreamFormat,
    pub(crate) max_input_frames: usize,
}

impl Negotiation {
    pub(crate) fn new(input: StreamFormat, max_input_frames: usize) -> Self {
        Self {
            input,
            output: input,
            max_input_frames,
        }
    }

    pub fn input(&self) -> StreamFormat {
        self.input
    }

    pub fn input_sample_rate(&self) -> u32 {
        self.input.sample_rate
    }

    pub fn input_channels(&self) -> usize {
        self.input.channels
    }

    /// Largest number of frames the block will receive in one `process` call.
    pub fn max_input_frames(&self) -> usize {
        self.max_input_frames
    }

    pub fn output(&self) -> StreamFormat {
        self.output
    }

    pub fn set_output_sample_rate(&mut self, rate: u32) {
        self.output.sample_rate = rate;
    }

    pub fn set_output_channels(&mut self, channels: usize) {
        self.output.channels = channels;
    }

    pub fn set_output(&mut self, format: StreamFormat) {
        self.output = format;
    }
}

/// Information available during processing.
///
/// Passed to every [`DspBlock::process`] call.
#[derive(Clone, Copy, Debug)]
pub struct ProcessContext {
    /// Format of the input buffer, as negotiated at start-up
    pub input: StreamFormat,
    /// Format the output buffer must be written in
    pub output: StreamFormat,
    /// Number of frames in the input buffer
    pub input_frames: usize,
}

/// The processing contract implemented by concrete blocks.
///
/// A block is added to a [`DspGraph`](crate::DspGraph), which owns it and drives it
/// through three phases:
///
/// 1. **Start-up** - [`init`](Self::init) sees the format offered by the producer and
///    decides its own output format (pass-through by default), or rejects the offer.
/// 2. **Running** - [`process`](Self::process) is called once per frame period with the
///    producer's output and fills `output`, which is then pushed to every consumer.
/// 3. **Shut-down** - [`deinit`](Self::deinit) releases whatever `init` acquired.
///
/// ```
/// use dspflow::{DspBlock, Negotiation, ProcessContext, Sample};
///
/// /// Keeps every second frame.
/// struct Halve;
///
/// impl DspBlock for Halve {
///     fn init(&mut self, negotiation: &mut Negotiation) -> bool {
///         let rate = negotiation.input_sample_rate();
///         if rate % 2 != 0 {
///             return false;
///         }
///         negotiation.set_output_sample_rate(rate / 2);
///         true
///     }
///
///     fn process(&mut self, ctx: &ProcessContext, input: &[Sample], output: &mut Vec<Sample>) -> bool {
///         let channels = ctx.input.channels;
///         for frame in input.chunks_exact(channels).step_by(2) {
///             output.extend_from_slice(frame);
///         }
///         true
///     }
/// }
/// ```
pub trait DspBlock: Send + 'static {
    /// Type name used in diagnostics.
    fn kind(&self) -> &'static str {
        "DspBlock"
    }

    /// Accept or reject the input format and choose the output format.
    ///
    /// Returning `false` aborts start-up of the whole graph.
    fn init(&mut self, negotiation: &mut Negotiation) -> bool {
        let _ = negotiation;
        true
    }

    /// Release resources acquired in [`init`](Self::init).
    fn deinit(&mut self) {}

    /// Process one frame period.
    ///
    /// `output` arrives empty with enough capacity reserved for the negotiated output
    /// format, so pushing into it does not allocate. Returning `false` drops the frame:
    /// nothing is forwarded to this block's consumers.
    fn process(&mut self, ctx: &ProcessContext, input: &[Sample], output: &mut Vec<Sample>) -> bool;
}

impl<B: DspBlock + ?Sized> DspBlock for Box<B> {
    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    fn init(&mut self, negotiation: &mut Negotiation) -> bool {
        (**self).init(negotiation)
    }

    fn deinit(&mut self) {
        (**self).deinit()
    }

    fn process(&mut self, ctx: &ProcessContext, input: &[Sample], output: &mut Vec<Sample>) -> bool {
        (**self).process(ctx, input, output)
    }
}
