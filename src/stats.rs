//! Per-node execution time counters.

/// Lifetime profiling counters of one node.
///
/// Counters only ever grow and survive stop/start cycles. Without the `profile`
/// feature nothing is recorded and every counter stays at zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    total_nanoseconds: u64,
    total_in_frames: u64,
    total_out_frames: u64,
}

impl NodeStats {
    pub fn total_nanoseconds(&self) -> u64 {
        self.total_nanoseconds
    }

    pub fn total_in_frames(&self) -> u64 {
        self.total_in_frames
    }

    pub fn total_out_frames(&self) -> u64 {
        self.total_out_frames
    }

    /// Average cost of this node alone per input frame.
    ///
    /// `None` until at least one frame was processed.
    pub fn ns_per_frame_one(&self) -> Option<u64> {
        self.total_nanoseconds.checked_div(self.total_in_frames)
    }

    /// Account for one `process` call that consumed `in_frames`.
    ///
    /// Output frames are only counted when the call produced a frame.
    #[cfg(feature = "profile")]
    pub(crate) fn record(&mut self, nanoseconds: u64, in_frames: usize, out_frames: Option<usize>) {
        self.total_nanoseconds = self.total_nanoseconds.saturating_add(nanoseconds);
        self.total_in_frames = self.total_in_frames.saturating_add(in_frames as u64);
        if let Some(out) = out_frames {
            self.total_out_frames = self.total_out_frames.saturating_add(out as u64);
        }
    }

    #[cfg(not(feature = "profile"))]
    #[inline]
    pub(crate) fn record(&mut self, _nanoseconds: u64, _in_frames: usize, _out_frames: Option<usize>) {}
}

impl core::ops::Add for NodeStats {
    type Output = NodeStats;

    fn add(self, other: NodeStats) -> NodeStats {
        NodeStats {
            total_nanoseconds: self.total_nanoseconds.saturating_add(other.total_nanoseconds),
            total_in_frames: self.total_in_frames.saturating_add(other.total_in_frames),
            total_out_frames: self.total_out_frames.saturating_add(other.total_out_frames),
        }
    }
}

impl core::iter::Sum for NodeStats {
    fn sum<I: Iterator<Item = NodeStats>>(iter: I) -> NodeStats {
        iter.fold(NodeStats::default(), |acc, s| acc + s)
    }
}
