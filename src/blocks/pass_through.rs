use crate::node::{DspBlock, ProcessContext};
use crate::Sample;

/// Forwards every frame unchanged.
///
/// Useful as the block of a source whose captured buffer needs no conversion,
/// or as a fan-out point.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThrough;

impl DspBlock for PassThrough {
    fn kind(&self) -> &'static str {
        "PassThrough"
    }

    fn process(&mut self, _ctx: &ProcessContext, input: &[Sample], output: &mut Vec<Sample>) -> bool {
        output.extend_from_slice(input);
        true
    }
}
