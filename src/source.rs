//! Sources - the entry points that drive a graph.
//!
//! A source is a node without a producer. It owns the input buffer a driver
//! fills with captured samples, and it is the only kind of node that can be
//! started, stopped or pumped from outside the graph. All of that goes through
//! a [`SourceId`], so a plain [`NodeId`] can never start half a pipeline.

use tracing::{debug, instrument, warn};

use crate::error::{GraphError, Result};
use crate::graph::{DspGraph, FrameReport, Node, DEFAULT_NAME};
use crate::node::{DspBlock, NodeId, SourceId, StreamFormat};
use crate::{Sample, DEFAULT_BLOCK_SIZE, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};

/// Format and driving granularity of a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceConfig {
    /// Sample rate of the captured stream in Hz
    pub sample_rate: u32,
    /// Interleaved channels per frame
    pub channels: usize,
    /// Frames synthesized per [`DspGraph::pump`]
    pub block_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl SourceConfig {
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn format(&self) -> StreamFormat {
        StreamFormat::new(self.sample_rate, self.channels)
    }
}

/// Source-only state kept on a [`Node`].
#[derive(Debug)]
pub(crate) struct SourceState {
    pub(crate) block_size: usize,
    /// Captured samples for the next pump, silence otherwise
    input: Vec<Sample>,
}

impl SourceState {
    fn new(block_size: usize) -> Self {
        Self {
            block_size,
            input: Vec::new(),
        }
    }

    fn resize(&mut self, channels: usize) {
        self.input.clear();
        self.input.resize(self.block_size * channels, 0.0);
    }
}

impl DspGraph {
    /// Add a source named [`DEFAULT_NAME`].
    pub fn add_source<B: DspBlock>(&mut self, block: B, config: SourceConfig) -> SourceId {
        self.add_named_source(DEFAULT_NAME, block, config)
    }

    pub fn add_named_source<B: DspBlock>(
        &mut self,
        name: impl Into<String>,
        block: B,
        config: SourceConfig,
    ) -> SourceId {
        let mut node = Node::new(name.into(), self.next_serial(), Box::new(block));
        node.input = config.format();
        node.max_input_frames = config.block_size;
        let mut state = SourceState::new(config.block_size);
        state.resize(config.channels);
        node.source = Some(state);
        SourceId(self.insert(node))
    }

    fn source_mut(&mut self, source: SourceId) -> Result<&mut Node> {
        let node = self.node_mut(source.0)?;
        if node.source.is_none() {
            return Err(GraphError::NodeNotFound(source.0));
        }
        Ok(node)
    }

    /// Like [`source_mut`](Self::source_mut), but refuses running sources.
    fn stopped_source_mut(&mut self, source: SourceId) -> Result<&mut Node> {
        let node = self.source_mut(source)?;
        if node.running {
            return Err(GraphError::Running {
                node: source.0,
                name: node.name().to_owned(),
            });
        }
        Ok(node)
    }

    /// Change the sample rate a stopped source offers downstream.
    pub fn set_sample_rate(&mut self, source: SourceId, sample_rate: u32) -> Result<()> {
        self.stopped_source_mut(source)?.input.sample_rate = sample_rate;
        Ok(())
    }

    /// Change the channel count of a stopped source.
    pub fn set_channels(&mut self, source: SourceId, channels: usize) -> Result<()> {
        let node = self.stopped_source_mut(source)?;
        node.input.channels = channels;
        if let Some(state) = node.source.as_mut() {
            state.resize(channels);
        }
        Ok(())
    }

    /// Change the number of frames a stopped source synthesizes per pump.
    pub fn set_block_size(&mut self, source: SourceId, block_size: usize) -> Result<()> {
        let node = self.stopped_source_mut(source)?;
        node.max_input_frames = block_size;
        let channels = node.input.channels;
        if let Some(state) = node.source.as_mut() {
            state.block_size = block_size;
            state.resize(channels);
        }
        Ok(())
    }

    pub fn block_size(&self, source: SourceId) -> Result<usize> {
        self.node(source.0)?
            .block_size()
            .ok_or(GraphError::NodeNotFound(source.0))
    }

    /// The buffer the next [`pump`](Self::pump) will push, `block_size * channels`
    /// interleaved samples.
    ///
    /// Drivers write captured samples here before pumping. Anything not written is
    /// silence, since the buffer is zeroed after every pump.
    pub fn source_buffer_mut(&mut self, source: SourceId) -> Result<&mut [Sample]> {
        let node = self.source_mut(source)?;
        match node.source.as_mut() {
            Some(state) => Ok(state.input.as_mut_slice()),
            None => Err(GraphError::NodeNotFound(source.0)),
        }
    }

    /// Negotiate formats from `source` down and mark the whole tree running.
    ///
    /// Either every node reachable from `source` ends up running, or, if any block
    /// rejects its format, every node started by this call is shut down again and
    /// the rejection is returned. Starting a running source does nothing.
    #[instrument(level = "debug", skip(self, source), fields(source = %source.0))]
    pub fn start(&mut self, source: SourceId) -> Result<()> {
        let node = self.source_mut(source)?;
        if node.running {
            return Ok(());
        }
        node.max_input_frames = node.block_size().unwrap_or_default();

        let mut ledger = Vec::new();
        match self.try_start(source.0, &mut ledger) {
            Ok(()) => {
                debug!(nodes = ledger.len(), "started");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, nodes = ledger.len(), "start failed, rolling back");
                self.unwind(&ledger);
                Err(e)
            }
        }
    }

    /// Shut down `source` and everything it feeds.
    ///
    /// Stopping a stopped source does nothing. A frame already being pumped on
    /// another call stack cannot exist, so the stop takes effect for the next pump.
    #[instrument(level = "debug", skip(self, source), fields(source = %source.0))]
    pub fn stop(&mut self, source: SourceId) -> Result<()> {
        self.source_mut(source)?;
        self.stop_node(source.0);
        Ok(())
    }

    /// Push one block of `block_size` frames from `source` through the graph.
    ///
    /// Returns once every running block below the source has processed the frame.
    /// Per-block failures are collected in the [`FrameReport`]; only pumping a
    /// stopped source is an error.
    pub fn pump(&mut self, source: SourceId) -> Result<FrameReport> {
        let id: NodeId = source.0;
        let node = self.source_mut(source)?;
        if !node.running {
            return Err(GraphError::NotRunning {
                node: id,
                name: node.name().to_owned(),
            });
        }

        let mut input = match node.source.as_mut() {
            Some(state) => std::mem::take(&mut state.input),
            None => return Err(GraphError::NodeNotFound(id)),
        };

        let mut report = FrameReport::default();
        self.execute(id, &input, &mut report);

        input.iter_mut().for_each(|s| *s = 0.0);
        if let Some(state) = self.node_mut(id)?.source.as_mut() {
            state.input = input;
        }
        Ok(report)
    }
}
