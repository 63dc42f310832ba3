//! Error types for graph construction, start-up and execution.

use crate::node::{NodeId, StreamFormat};

/// Illegal graph mutations, rejected at `connect` time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("a node cannot consume its own output")]
    SelfLoop,

    #[error("sources have no input and cannot be consumers")]
    SourceAsConsumer,

    #[error("consumer is already fed by {existing}")]
    MultipleProducers { existing: NodeId },

    #[error("connection would create a cycle")]
    Cycle,
}

/// Error type for graph operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("cannot connect {producer} -> {consumer}: {source}")]
    Topology {
        producer: NodeId,
        consumer: NodeId,
        #[source]
        source: TopologyError,
    },

    /// A block rejected the format offered by its producer during start-up.
    #[error("'{name}' ({node}) rejected input format {format}")]
    Negotiation {
        node: NodeId,
        name: String,
        format: StreamFormat,
    },

    #[error("'{name}' ({node}) is not running")]
    NotRunning { node: NodeId, name: String },

    /// The operation is only legal while the node is stopped.
    #[error("'{name}' ({node}) is running")]
    Running { node: NodeId, name: String },

    #[error("{node} has not processed any frames")]
    NoFramesProcessed { node: NodeId },
}

/// A block's `process` call failed for one frame.
///
/// This is not fatal: the frame is dropped at that block and the pipeline keeps running.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{name}' ({node}) failed to process a frame")]
pub struct ProcessingError {
    pub node: NodeId,
    pub name: String,
}

/// Result type for graph operations
pub type Result<T, E = GraphError> = std::result::Result<T, E>;
