use crate::node::{DspBlock, ProcessContext};
use crate::Sample;

/// A sink that consumes frames and produces nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct Discard;

impl DspBlock for Discard {
    fn kind(&self) -> &'static str {
        "Discard"
    }

    fn process(&mut self, _ctx: &ProcessContext, _input: &[Sample], _output: &mut Vec<Sample>) -> bool {
        true
    }
}
