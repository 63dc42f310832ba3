//! Block graph - owns the blocks, negotiates formats and pushes frames.

use std::sync::Arc;

use petgraph::algo::has_path_connecting;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::Dfs;
use petgraph::Direction;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::error::{GraphError, ProcessingError, Result, TopologyError};
use crate::node::{DspBlock, Negotiation, NodeId, ProcessContext, StreamFormat};
use crate::source::SourceState;
use crate::stats::NodeStats;
use crate::Sample;

/// Name given to nodes added without one.
pub const DEFAULT_NAME: &str = "<undefined>";

/// A vertex of the graph: one block plus the state the graph keeps for it.
///
/// Nodes are owned by their [`DspGraph`]; everything here is read-only from
/// the outside. Look one up with [`DspGraph::node`].
pub struct Node {
    name: String,
    serial: u32,
    pub(crate) block: Box<dyn DspBlock>,

    pub(crate) input: StreamFormat,
    pub(crate) output: StreamFormat,
    /// Largest frame count per `process` call, known once the producer has started
    pub(crate) max_input_frames: usize,
    decimation: u32,
    interpolation: u32,

    pub(crate) running: bool,
    buffer: Vec<Sample>,
    consumers: Vec<NodeId>,
    stats: NodeStats,

    pub(crate) source: Option<SourceState>,
}

impl Node {
    pub(crate) fn new(name: String, serial: u32, block: Box<dyn DspBlock>) -> Self {
        Self {
            name,
            serial,
            block,
            input: StreamFormat::default(),
            output: StreamFormat::default(),
            max_input_frames: 0,
            decimation: 1,
            interpolation: 1,
            running: false,
            buffer: Vec::new(),
            consumers: Vec::new(),
            stats: NodeStats::default(),
            source: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type name reported by the block.
    pub fn kind(&self) -> &'static str {
        match (&self.source, self.block.kind()) {
            (Some(_), "DspBlock") => "DspSource",
            (_, kind) => kind,
        }
    }

    pub fn is_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn input_sample_rate(&self) -> u32 {
        self.input.sample_rate
    }

    pub fn input_channels(&self) -> usize {
        self.input.channels
    }

    pub fn output_sample_rate(&self) -> u32 {
        self.output.sample_rate
    }

    pub fn output_channels(&self) -> usize {
        self.output.channels
    }

    pub fn input_format(&self) -> StreamFormat {
        self.input
    }

    pub fn output_format(&self) -> StreamFormat {
        self.output
    }

    /// Input samples per output sample, reduced against [`interpolation`](Self::interpolation).
    pub fn decimation(&self) -> u32 {
        self.decimation
    }

    /// Output samples per input sample, reduced against [`decimation`](Self::decimation).
    pub fn interpolation(&self) -> u32 {
        self.interpolation
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Downstream nodes, in registration (and delivery) order.
    pub fn consumers(&self) -> &[NodeId] {
        &self.consumers
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// Frames synthesized per pump, for sources.
    pub fn block_size(&self) -> Option<usize> {
        self.source.as_ref().map(|s| s.block_size)
    }

    /// Capacity of the reusable output buffer, in samples.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer.capacity()
    }
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("input", &self.input)
            .field("output", &self.output)
            .field("running", &self.running)
            .field("consumers", &self.consumers)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Outcome of pushing one frame through a graph.
///
/// Per-frame failures do not stop the pipeline; the driver decides what to do with them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FrameReport {
    /// Number of `process` calls made for this frame
    pub processed: usize,
    /// Blocks whose `process` failed; their consumers did not receive the frame
    pub failures: Vec<ProcessingError>,
    /// Consumers that were registered but not running, so were passed over
    pub skipped: Vec<NodeId>,
}

impl FrameReport {
    /// `true` if every reachable block processed the frame.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty()
    }
}

type InnerGraph = StableGraph<Node, ()>;

/// A graph of [`DspBlock`]s driven by one or more sources.
///
/// The graph owns every block. Connections are non-owning [`NodeId`] handles,
/// so removing a node never leaves a dangling consumer behind.
///
/// Each node has at most one producer and the graph is kept acyclic, so every
/// source drives a tree. Frames are pushed depth-first: [`pump`](Self::pump) does
/// not return until every block below the source has seen the frame.
///
/// ```
/// use dspflow::{DspGraph, SourceConfig};
/// use dspflow::blocks::{Discard, PassThrough};
///
/// let mut graph = DspGraph::new();
/// let source = graph.add_source(PassThrough, SourceConfig::default().with_block_size(1024));
/// let sink = graph.add(Discard);
/// graph.connect(source, sink)?;
///
/// graph.start(source)?;
/// let report = graph.pump(source)?;
/// assert!(report.is_clean());
/// assert_eq!(report.processed, 2);
/// graph.stop(source)?;
/// # Ok::<(), dspflow::GraphError>(())
/// ```
pub struct DspGraph {
    graph: InnerGraph,
    #[cfg_attr(not(feature = "profile"), allow(dead_code))]
    clock: Arc<dyn Clock>,
    next_serial: u32,
}

impl Default for DspGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DspGraph {
    /// Create an empty graph timed by a [`MonotonicClock`].
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::new())
    }

    /// Create an empty graph that times blocks with `clock`.
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            graph: InnerGraph::with_capacity(16, 16),
            clock: Arc::new(clock),
            next_serial: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Add a block named [`DEFAULT_NAME`].
    pub fn add<B: DspBlock>(&mut self, block: B) -> NodeId {
        self.add_named(DEFAULT_NAME, block)
    }

    pub fn add_named<B: DspBlock>(&mut self, name: impl Into<String>, block: B) -> NodeId {
        self.insert(Node::new(name.into(), self.next_serial, Box::new(block)))
    }

    pub(crate) fn insert(&mut self, node: Node) -> NodeId {
        let serial = node.serial;
        debug_assert_eq!(serial, self.next_serial);
        self.next_serial = self.next_serial.wrapping_add(1);

        let name = node.name.clone();
        let index = self.graph.add_node(node);
        let id = NodeId { index, serial };
        debug!(node = %id, %name, "added node");
        id
    }

    pub(crate) fn next_serial(&self) -> u32 {
        self.next_serial
    }

    /// Remove a stopped node, detaching it from its producer and consumers.
    ///
    /// Returns the block so the caller can reuse or inspect it.
    pub fn remove(&mut self, id: impl Into<NodeId>) -> Result<Box<dyn DspBlock>> {
        let id = id.into();
        let node = self.node(id)?;
        if node.running {
            return Err(GraphError::Running {
                node: id,
                name: node.name.clone(),
            });
        }

        if let Some(producer) = self.producer(id)? {
            self.node_mut(producer)?.consumers.retain(|c| *c != id);
        }

        let node = self.graph.remove_node(id.index).ok_or(GraphError::NodeNotFound(id))?;
        debug!(node = %id, name = %node.name, "removed node");
        Ok(node.block)
    }

    pub fn node(&self, id: impl Into<NodeId>) -> Result<&Node> {
        let id = id.into();
        match self.graph.node_weight(id.index) {
            Some(node) if node.serial == id.serial => Ok(node),
            _ => Err(GraphError::NodeNotFound(id)),
        }
    }

    pub(crate) fn node_mut(&mut self, id: impl Into<NodeId>) -> Result<&mut Node> {
        let id = id.into();
        match self.graph.node_weight_mut(id.index) {
            Some(node) if node.serial == id.serial => Ok(node),
            _ => Err(GraphError::NodeNotFound(id)),
        }
    }

    pub fn contains(&self, id: impl Into<NodeId>) -> bool {
        self.node(id).is_ok()
    }

    /// Every live node, in arena order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.node_indices().map(move |index| NodeId {
            index,
            serial: self.graph[index].serial,
        })
    }

    pub fn is_running(&self, id: impl Into<NodeId>) -> Result<bool> {
        Ok(self.node(id)?.running)
    }

    /// The node feeding `id`, if any.
    pub fn producer(&self, id: impl Into<NodeId>) -> Result<Option<NodeId>> {
        let id = id.into();
        self.node(id)?;
        Ok(self
            .graph
            .neighbors_directed(id.index, Direction::Incoming)
            .next()
            .map(|index| NodeId {
                index,
                serial: self.graph[index].serial,
            }))
    }

    /// Register `consumer` as a recipient of `producer`'s output.
    ///
    /// Connecting an already connected pair is a no-op. Legal while running; a
    /// consumer added to a running producer only receives frames once it has been
    /// started itself.
    pub fn connect(&mut self, producer: impl Into<NodeId>, consumer: impl Into<NodeId>) -> Result<()> {
        let (producer, consumer) = (producer.into(), consumer.into());
        let topology = |source| GraphError::Topology {
            producer,
            consumer,
            source,
        };

        let from = self.node(producer)?;
        let to = self.node(consumer)?;

        if from.consumers.contains(&consumer) {
            trace!(%producer, %consumer, "already connected");
            return Ok(());
        }
        if producer == consumer {
            return Err(topology(TopologyError::SelfLoop));
        }
        if to.is_source() {
            return Err(topology(TopologyError::SourceAsConsumer));
        }
        if let Some(existing) = self.producer(consumer)? {
            return Err(topology(TopologyError::MultipleProducers { existing }));
        }
        if has_path_connecting(&self.graph, consumer.index, producer.index, None) {
            return Err(topology(TopologyError::Cycle));
        }

        self.graph.add_edge(producer.index, consumer.index, ());
        self.node_mut(producer)?.consumers.push(consumer);
        debug!(%producer, %consumer, "connected");
        Ok(())
    }

    /// Remove a registration. Returns whether the pair was connected.
    ///
    /// Takes effect from the next frame on. A running consumer is stopped together
    /// with its subtree, so it negotiates afresh under whichever producer it joins next.
    pub fn disconnect(&mut self, producer: impl Into<NodeId>, consumer: impl Into<NodeId>) -> Result<bool> {
        let (producer, consumer) = (producer.into(), consumer.into());
        self.node(consumer)?;

        let node = self.node_mut(producer)?;
        let before = node.consumers.len();
        node.consumers.retain(|c| *c != consumer);
        if node.consumers.len() == before {
            return Ok(false);
        }

        if let Some(edge) = self.graph.find_edge(producer.index, consumer.index) {
            self.graph.remove_edge(edge);
        }
        debug!(%producer, %consumer, "disconnected");
        self.stop_node(consumer);
        Ok(true)
    }

    /// Average execution time per input frame of `id` alone.
    pub fn ns_per_frame_one(&self, id: impl Into<NodeId>) -> Result<u64> {
        let id = id.into();
        self.node(id)?
            .stats
            .ns_per_frame_one()
            .ok_or(GraphError::NoFramesProcessed { node: id })
    }

    /// Average execution time per input frame over `id` and everything downstream of it.
    pub fn ns_per_frame_all(&self, id: impl Into<NodeId>) -> Result<u64> {
        let id = id.into();
        self.subtree_stats(id)?
            .ns_per_frame_one()
            .ok_or(GraphError::NoFramesProcessed { node: id })
    }

    /// Counters summed over `id` and every node reachable from it.
    pub fn subtree_stats(&self, id: impl Into<NodeId>) -> Result<NodeStats> {
        let id = id.into();
        self.node(id)?;

        let mut total = NodeStats::default();
        let mut dfs = Dfs::new(&self.graph, id.index);
        while let Some(index) = dfs.next(&self.graph) {
            total = total + self.graph[index].stats;
        }
        Ok(total)
    }

    fn consumer_at(&self, id: NodeId, position: usize) -> Option<NodeId> {
        self.graph.node_weight(id.index)?.consumers.get(position).copied()
    }

    /// Try-start pass: negotiate `id` and its whole subtree.
    ///
    /// Every node whose `init` succeeded is appended to `ledger`, in start order.
    /// A node is marked running only once all of its consumers are.
    pub(crate) fn try_start(&mut self, id: NodeId, ledger: &mut Vec<NodeId>) -> Result<()> {
        let node = self.node_mut(id)?;
        if node.running {
            return Ok(());
        }

        let offered = node.input;
        let rejected = |node: &Node| GraphError::Negotiation {
            node: id,
            name: node.name.clone(),
            format: offered,
        };

        if !offered.is_set() {
            warn!(node = %id, name = %node.name, "no input format was offered");
            return Err(rejected(&*node));
        }

        let mut negotiation = Negotiation::new(offered, node.max_input_frames);
        if !node.block.init(&mut negotiation) {
            warn!(node = %id, name = %node.name, format = %offered, "input format rejected");
            return Err(rejected(&*node));
        }
        ledger.push(id);

        let output = negotiation.output;
        if !output.is_set() {
            warn!(node = %id, name = %node.name, format = %output, "block chose an empty output format");
            return Err(rejected(&*node));
        }

        let (decimation, interpolation) = rate_ratio(offered.sample_rate, output.sample_rate);
        let sized = scale_frames(node.max_input_frames, decimation, interpolation)
            .and_then(|frames| Some((frames, frames.checked_mul(output.channels)?)));
        let (max_output_frames, capacity) = match sized {
            Some(sized) => sized,
            None => {
                warn!(node = %id, name = %node.name, format = %output, "output buffer size overflows");
                return Err(rejected(&*node));
            }
        };
        node.buffer.clear();
        if node.buffer.try_reserve(capacity).is_err() {
            warn!(node = %id, name = %node.name, capacity, "cannot allocate output buffer");
            return Err(rejected(&*node));
        }
        node.output = output;
        node.decimation = decimation;
        node.interpolation = interpolation;
        debug!(
            node = %id,
            name = %node.name,
            input = %offered,
            %output,
            decimation,
            interpolation,
            "negotiated"
        );

        let mut position = 0;
        while let Some(consumer) = self.consumer_at(id, position) {
            let next = self.node_mut(consumer)?;
            if !next.running {
                next.input = output;
                next.max_input_frames = max_output_frames;
            }
            self.try_start(consumer, ledger)?;
            position += 1;
        }

        self.node_mut(id)?.running = true;
        Ok(())
    }

    /// Unwind pass: shut down everything a failed try-start pass initialized.
    pub(crate) fn unwind(&mut self, ledger: &[NodeId]) {
        for &id in ledger.iter().rev() {
            if let Ok(node) = self.node_mut(id) {
                node.block.deinit();
                node.running = false;
                debug!(node = %id, name = %node.name, "rolled back");
            }
        }
    }

    /// Stop `id` and, if it was running, everything below it.
    pub(crate) fn stop_node(&mut self, id: NodeId) {
        let node = match self.node_mut(id) {
            Ok(node) if node.running => node,
            _ => return,
        };
        node.block.deinit();
        node.running = false;
        debug!(node = %id, name = %node.name, "stopped");

        let mut position = 0;
        while let Some(consumer) = self.consumer_at(id, position) {
            self.stop_node(consumer);
            position += 1;
        }
    }

    /// Run one frame through `id` and push its output downstream.
    ///
    /// The caller has checked that `id` is running.
    pub(crate) fn execute(&mut self, id: NodeId, input: &[Sample], report: &mut FrameReport) {
        let node = match self.graph.node_weight_mut(id.index) {
            Some(node) => node,
            None => return,
        };

        let mut output = std::mem::take(&mut node.buffer);
        output.clear();
        let ctx = ProcessContext {
            input: node.input,
            output: node.output,
            input_frames: node.input.frames(input.len()),
        };

        #[cfg(feature = "profile")]
        let started = self.clock.now_ns();
        let ok = node.block.process(&ctx, input, &mut output);
        #[cfg(feature = "profile")]
        let elapsed = self.clock.now_ns().saturating_sub(started);
        #[cfg(not(feature = "profile"))]
        let elapsed = 0;

        let out_frames = if ok { Some(ctx.output.frames(output.len())) } else { None };
        node.stats.record(elapsed, ctx.input_frames, out_frames);
        report.processed += 1;

        if ok {
            let mut position = 0;
            while let Some(consumer) = self.consumer_at(id, position) {
                if self.graph[consumer.index].running {
                    self.execute(consumer, &output, report);
                } else {
                    trace!(node = %consumer, "consumer not running, skipped");
                    report.skipped.push(consumer);
                }
                position += 1;
            }
        } else {
            trace!(node = %id, name = %node.name, "process failed, frame dropped");
            report.failures.push(ProcessingError {
                node: id,
                name: node.name.clone(),
            });
        }

        if let Some(node) = self.graph.node_weight_mut(id.index) {
            node.buffer = output;
        }
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Reduced `(decimation, interpolation)` pair for a rate change.
///
/// `output = input * interpolation / decimation`.
pub(crate) fn rate_ratio(input_rate: u32, output_rate: u32) -> (u32, u32) {
    let divisor = gcd(input_rate, output_rate);
    if divisor == 0 {
        return (1, 1);
    }
    (input_rate / divisor, output_rate / divisor)
}

/// Frames produced from `frames` input frames, rounded up.
///
/// `None` if the result does not fit a `usize`.
pub(crate) fn scale_frames(frames: usize, decimation: u32, interpolation: u32) -> Option<usize> {
    let scaled = u128::try_from(frames).ok()? * u128::from(interpolation);
    let decimation = u128::from(decimation.max(1));
    usize::try_from((scaled + decimation - 1) / decimation).ok()
}
