use std::sync::{Arc, Mutex};

use dspflow::blocks::{Discard, PassThrough};
use dspflow::{
    DspBlock, DspGraph, GraphError, ManualClock, Negotiation, NodeId, ProcessContext, Sample,
    SourceConfig, SourceId,
};

type Log = Arc<Mutex<Vec<String>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

fn events(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn clear(log: &Log) {
    log.lock().unwrap().clear();
}

/// Pass-through block that records every lifecycle call.
struct Probe {
    name: &'static str,
    log: Log,
    output_rate: Option<u32>,
    output_channels: Option<usize>,
    accept: bool,
    fail_process: bool,
}

impl Probe {
    fn new(name: &'static str, log: &Log) -> Self {
        Self {
            name,
            log: log.clone(),
            output_rate: None,
            output_channels: None,
            accept: true,
            fail_process: false,
        }
    }

    fn with_output_rate(mut self, rate: u32) -> Self {
        self.output_rate = Some(rate);
        self
    }

    fn with_output_channels(mut self, channels: usize) -> Self {
        self.output_channels = Some(channels);
        self
    }

    fn rejecting(mut self) -> Self {
        self.accept = false;
        self
    }

    fn failing(mut self) -> Self {
        self.fail_process = true;
        self
    }

    fn record(&self, event: &str) {
        self.log.lock().unwrap().push(format!("{}:{}", event, self.name));
    }
}

impl DspBlock for Probe {
    fn kind(&self) -> &'static str {
        "Probe"
    }

    fn init(&mut self, negotiation: &mut Negotiation) -> bool {
        self.record("init");
        if !self.accept {
            return false;
        }
        if let Some(rate) = self.output_rate {
            negotiation.set_output_sample_rate(rate);
        }
        if let Some(channels) = self.output_channels {
            negotiation.set_output_channels(channels);
        }
        true
    }

    fn deinit(&mut self) {
        self.record("deinit");
    }

    fn process(&mut self, ctx: &ProcessContext, input: &[Sample], output: &mut Vec<Sample>) -> bool {
        self.record("process");
        if self.fail_process {
            return false;
        }
        if ctx.input.sample_rate == ctx.output.sample_rate {
            output.extend_from_slice(input);
        } else {
            let frames = ctx.input_frames * ctx.output.sample_rate as usize / ctx.input.sample_rate as usize;
            output.resize(frames * ctx.output.channels, 0.0);
        }
        true
    }
}

fn small_source() -> SourceConfig {
    SourceConfig::default().with_block_size(4)
}

#[test]
fn start_and_stop_reach_every_node() {
    init_tracing();
    let log = Log::default();
    let mut graph = DspGraph::new();
    let source = graph.add_source(Probe::new("src", &log), small_source());
    let a = graph.add(Probe::new("a", &log));
    let b = graph.add(Probe::new("b", &log));
    let c = graph.add(Probe::new("c", &log));
    let d = graph.add(Discard);
    graph.connect(source, a).unwrap();
    graph.connect(a, b).unwrap();
    graph.connect(a, c).unwrap();
    graph.connect(c, d).unwrap();

    let all: Vec<NodeId> = vec![source.node(), a, b, c, d];

    graph.start(source).unwrap();
    for id in &all {
        assert!(graph.is_running(*id).unwrap());
    }

    graph.stop(source).unwrap();
    for id in &all {
        assert!(!graph.is_running(*id).unwrap());
    }
    let deinits = events(&log).iter().filter(|e| e.starts_with("deinit")).count();
    assert_eq!(deinits, 4);
}

#[test]
fn rejected_format_rolls_back_whole_graph() {
    init_tracing();
    let log = Log::default();
    let mut graph = DspGraph::new();
    let source = graph.add_source(Probe::new("src", &log), small_source());
    let a = graph.add(Probe::new("a", &log));
    let b = graph.add(Probe::new("b", &log));
    let d = graph.add(Probe::new("d", &log));
    let c = graph.add_named("picky", Probe::new("c", &log).rejecting());
    graph.connect(source, a).unwrap();
    graph.connect(a, b).unwrap();
    graph.connect(b, d).unwrap();
    graph.connect(a, c).unwrap();

    let result = graph.start(source);
    match result {
        Err(GraphError::Negotiation { node, name, format }) => {
            assert_eq!(node, c);
            assert_eq!(name, "picky");
            assert_eq!(format.sample_rate, 48000);
            assert_eq!(format.channels, 2);
        }
        other => panic!("expected a negotiation error, got {:?}", other),
    }

    for id in &[source.node(), a, b, c, d] {
        assert!(!graph.is_running(*id).unwrap(), "{} left running", id);
    }

    // `b` and `d` had already started when `c` refused; they are unwound last-in first-out
    assert_eq!(
        events(&log),
        vec![
            "init:src", "init:a", "init:b", "init:d", "init:c",
            "deinit:d", "deinit:b", "deinit:a", "deinit:src",
        ]
    );

    assert!(matches!(graph.pump(source), Err(GraphError::NotRunning { .. })));
}

#[test]
fn restart_after_fixing_topology() {
    let log = Log::default();
    let mut graph = DspGraph::new();
    let source = graph.add_source(PassThrough, small_source());
    let picky = graph.add(Probe::new("picky", &log).rejecting());
    let sink = graph.add(Probe::new("sink", &log));
    graph.connect(source, picky).unwrap();
    graph.connect(source, sink).unwrap();

    assert!(graph.start(source).is_err());
    assert!(!graph.is_running(sink).unwrap());

    graph.disconnect(source, picky).unwrap();
    graph.start(source).unwrap();
    assert!(graph.is_running(sink).unwrap());
    assert!(!graph.is_running(picky).unwrap());
}

#[test]
fn start_and_stop_are_idempotent() {
    let log = Log::default();
    let mut graph = DspGraph::new();
    let source = graph.add_source(Probe::new("src", &log), small_source());

    graph.stop(source).unwrap();
    assert!(events(&log).is_empty());

    graph.start(source).unwrap();
    graph.start(source).unwrap();
    assert_eq!(events(&log), vec!["init:src"]);

    graph.stop(source).unwrap();
    graph.stop(source).unwrap();
    assert_eq!(events(&log), vec!["init:src", "deinit:src"]);
}

#[test]
fn a_sink_alone_can_start() {
    let mut graph = DspGraph::new();
    let source = graph.add_source(Discard, small_source());
    graph.start(source).unwrap();
    let report = graph.pump(source).unwrap();
    assert_eq!(report.processed, 1);
    assert!(report.is_clean());
}

#[test]
fn empty_source_format_is_rejected() {
    let mut graph = DspGraph::new();
    let source = graph.add_source(PassThrough, small_source().with_channels(0));
    assert!(matches!(graph.start(source), Err(GraphError::Negotiation { .. })));
    assert!(!graph.is_running(source).unwrap());
}

#[test]
fn fan_out_follows_registration_order() {
    let log = Log::default();
    let mut graph = DspGraph::new();
    let source = graph.add_source(PassThrough, small_source());
    let a = graph.add(Probe::new("a", &log));
    let c1 = graph.add(Probe::new("c1", &log));
    let c2 = graph.add(Probe::new("c2", &log));
    let c3 = graph.add(Probe::new("c3", &log));
    let c1_child = graph.add(Probe::new("c1.1", &log));
    graph.connect(source, a).unwrap();
    graph.connect(a, c1).unwrap();
    graph.connect(a, c2).unwrap();
    graph.connect(a, c3).unwrap();
    graph.connect(c1, c1_child).unwrap();

    graph.start(source).unwrap();
    clear(&log);

    for _ in 0..3 {
        graph.pump(source).unwrap();
    }

    let frame = vec!["process:a", "process:c1", "process:c1.1", "process:c2", "process:c3"];
    let expected: Vec<&str> = frame.iter().cycle().take(frame.len() * 3).copied().collect();
    assert_eq!(events(&log), expected);
}

#[test]
fn duplicate_connect_delivers_once() {
    let log = Log::default();
    let mut graph = DspGraph::new();
    let source = graph.add_source(PassThrough, small_source());
    let x = graph.add(Probe::new("x", &log));
    graph.connect(source, x).unwrap();
    graph.connect(source, x).unwrap();

    graph.start(source).unwrap();
    let report = graph.pump(source).unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(events(&log), vec!["init:x", "process:x"]);
}

#[test]
fn decimation_and_interpolation_factors() {
    let log = Log::default();
    let mut graph = DspGraph::new();
    let source = graph.add_source(PassThrough, SourceConfig::default().with_block_size(1024));
    let down = graph.add(Probe::new("down", &log).with_output_rate(8000));
    let up = graph.add(Probe::new("up", &log).with_output_rate(48000));
    graph.connect(source, down).unwrap();
    graph.connect(down, up).unwrap();
    graph.start(source).unwrap();

    let down = graph.node(down).unwrap();
    assert_eq!(down.input_sample_rate(), 48000);
    assert_eq!(down.output_sample_rate(), 8000);
    assert_eq!(down.decimation(), 6);
    assert_eq!(down.interpolation(), 1);
    // ceil(1024 / 6) frames of stereo
    assert!(down.buffer_capacity() >= 171 * 2);

    let up = graph.node(up).unwrap();
    assert_eq!(up.input_sample_rate(), 8000);
    assert_eq!(up.output_sample_rate(), 48000);
    assert_eq!(up.decimation(), 1);
    assert_eq!(up.interpolation(), 6);
    assert_eq!(up.output_channels(), 2);

    let source = graph.node(source).unwrap();
    assert_eq!((source.decimation(), source.interpolation()), (1, 1));
}

#[test]
fn failed_frame_is_not_forwarded() {
    init_tracing();
    let log = Log::default();
    let mut graph = DspGraph::new();
    let source = graph.add_source(PassThrough, small_source());
    let broken = graph.add_named("broken", Probe::new("broken", &log).failing());
    let behind_broken = graph.add(Probe::new("behind", &log));
    let sibling = graph.add(Probe::new("sibling", &log));
    graph.connect(source, broken).unwrap();
    graph.connect(broken, behind_broken).unwrap();
    graph.connect(source, sibling).unwrap();
    graph.start(source).unwrap();
    clear(&log);

    let report = graph.pump(source).unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].node, broken);
    assert_eq!(report.failures[0].name, "broken");
    assert!(!report.is_clean());
    assert_eq!(events(&log), vec!["process:broken", "process:sibling"]);

    // the pipeline keeps running
    assert!(graph.is_running(behind_broken).unwrap());
    graph.pump(source).unwrap();
    assert_eq!(events(&log).len(), 4);
}

#[test]
fn consumer_added_while_running_is_skipped_until_restart() {
    let log = Log::default();
    let mut graph = DspGraph::new();
    let source = graph.add_source(PassThrough, small_source());
    graph.start(source).unwrap();

    let late = graph.add(Probe::new("late", &log));
    graph.connect(source, late).unwrap();
    let report = graph.pump(source).unwrap();
    assert_eq!(report.skipped, vec![late]);
    assert!(events(&log).is_empty());

    graph.stop(source).unwrap();
    graph.start(source).unwrap();
    let report = graph.pump(source).unwrap();
    assert!(report.is_clean());
    assert_eq!(events(&log), vec!["init:late", "process:late"]);
}

#[test]
fn disconnect_while_running_stops_delivery() {
    let log = Log::default();
    let mut graph = DspGraph::new();
    let source = graph.add_source(PassThrough, small_source());
    let a = graph.add(Probe::new("a", &log));
    graph.connect(source, a).unwrap();
    graph.start(source).unwrap();

    graph.pump(source).unwrap();
    assert!(graph.disconnect(source, a).unwrap());
    graph.pump(source).unwrap();

    assert_eq!(events(&log), vec!["init:a", "process:a", "deinit:a"]);
    assert!(!graph.is_running(a).unwrap());

    graph.stop(source).unwrap();
    assert_eq!(events(&log).iter().filter(|e| *e == "deinit:a").count(), 1);
    graph.remove(a).unwrap();
}

#[test]
fn detached_consumer_renegotiates_under_new_source() {
    init_tracing();
    let log = Log::default();
    let mut graph = DspGraph::new();
    let first = graph.add_source(PassThrough, small_source());
    let second = graph.add_source(
        PassThrough,
        small_source().with_sample_rate(8000).with_channels(1),
    );
    let x = graph.add(Probe::new("x", &log));
    graph.connect(first, x).unwrap();
    graph.start(first).unwrap();

    graph.disconnect(first, x).unwrap();
    graph.stop(first).unwrap();
    graph.connect(second, x).unwrap();
    graph.start(second).unwrap();
    let report = graph.pump(second).unwrap();

    assert!(report.is_clean());
    assert_eq!(events(&log), vec!["init:x", "deinit:x", "init:x", "process:x"]);
    let node = graph.node(x).unwrap();
    assert_eq!(node.input_sample_rate(), 8000);
    assert_eq!(node.input_channels(), 1);
    #[cfg(feature = "profile")]
    assert_eq!(node.stats().total_in_frames(), 4);
}

#[test]
fn empty_output_format_rolls_back_the_chooser() {
    init_tracing();
    let log = Log::default();
    let mut graph = DspGraph::new();
    let source = graph.add_source(Probe::new("src", &log), small_source());
    let a = graph.add(Probe::new("a", &log));
    let mute = graph.add_named("mute", Probe::new("mute", &log).with_output_channels(0));
    graph.connect(source, a).unwrap();
    graph.connect(a, mute).unwrap();

    let result = graph.start(source);
    assert!(matches!(result, Err(GraphError::Negotiation { node, .. }) if node == mute));
    for id in [source.node(), a, mute] {
        assert!(!graph.is_running(id).unwrap());
    }
    assert_eq!(
        events(&log),
        vec!["init:src", "init:a", "init:mute", "deinit:mute", "deinit:a", "deinit:src"]
    );
}

#[test]
fn oversized_output_format_is_rejected() {
    let log = Log::default();
    let mut graph = DspGraph::new();
    let source = graph.add_source(PassThrough, small_source());
    let wide = graph.add(Probe::new("wide", &log).with_output_channels(usize::MAX));
    graph.connect(source, wide).unwrap();

    let result = graph.start(source);
    assert!(matches!(result, Err(GraphError::Negotiation { node, .. }) if node == wide));
    assert!(!graph.is_running(source).unwrap());
    assert_eq!(events(&log), vec!["init:wide", "deinit:wide"]);
}

#[test]
fn captured_samples_reach_consumers() {
    struct Capture(Arc<Mutex<Vec<Sample>>>);

    impl DspBlock for Capture {
        fn process(&mut self, _ctx: &ProcessContext, input: &[Sample], _output: &mut Vec<Sample>) -> bool {
            self.0.lock().unwrap().extend_from_slice(input);
            true
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut graph = DspGraph::new();
    let source = graph.add_source(PassThrough, SourceConfig::default().with_block_size(2).with_channels(1));
    let sink = graph.add(Capture(seen.clone()));
    graph.connect(source, sink).unwrap();
    graph.start(source).unwrap();

    graph.source_buffer_mut(source).unwrap().copy_from_slice(&[0.5, -0.5]);
    graph.pump(source).unwrap();
    graph.pump(source).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![0.5, -0.5, 0.0, 0.0]);
    assert_eq!(graph.node(sink).unwrap().kind(), "DspBlock");
}

#[test]
fn stopped_consumer_is_removable() {
    let mut graph = DspGraph::new();
    let source = graph.add_source(PassThrough, small_source());
    let a = graph.add(Discard);
    graph.connect(source, a).unwrap();
    graph.start(source).unwrap();
    assert!(matches!(graph.remove(a), Err(GraphError::Running { .. })));

    graph.stop(source).unwrap();
    graph.remove(a).unwrap();
    assert!(graph.node(source).unwrap().consumers().is_empty());
    assert_eq!(graph.len(), 1);
}

fn pipeline(clock: ManualClock, block_size: usize) -> (DspGraph, SourceId, NodeId, NodeId) {
    let mut graph = DspGraph::with_clock(clock);
    let source = graph.add_source(
        PassThrough,
        SourceConfig::default()
            .with_block_size(block_size)
            .with_sample_rate(48000)
            .with_channels(2),
    );
    let pass = graph.add_named("pass", PassThrough);
    let sink = graph.add_named("sink", Discard);
    graph.connect(source, pass).unwrap();
    graph.connect(pass, sink).unwrap();
    (graph, source, pass, sink)
}

#[cfg(feature = "profile")]
#[test]
fn one_pump_processes_each_node_once() {
    let (mut graph, source, pass, sink) = pipeline(ManualClock::new(), 1024);
    graph.start(source).unwrap();

    let report = graph.pump(source).unwrap();
    assert_eq!(report.processed, 3);
    assert!(report.is_clean());

    for id in &[source.node(), pass, sink] {
        let stats = graph.node(*id).unwrap().stats();
        assert_eq!(stats.total_in_frames(), 1024);
    }
    assert_eq!(graph.node(pass).unwrap().stats().total_out_frames(), 1024);
    assert_eq!(graph.node(sink).unwrap().stats().total_out_frames(), 0);
}

#[cfg(feature = "profile")]
#[test]
fn counters_grow_per_frame() {
    let clock = ManualClock::stepping(1_000);
    let (mut graph, source, _pass, sink) = pipeline(clock, 4);
    graph.start(source).unwrap();

    let mut last = 0;
    for n in 1..=5u64 {
        graph.pump(source).unwrap();
        let stats = *graph.node(sink).unwrap().stats();
        assert_eq!(stats.total_in_frames(), n * 4);
        assert_eq!(stats.total_nanoseconds(), n * 1_000);
        assert!(stats.total_nanoseconds() > last);
        last = stats.total_nanoseconds();
    }

    assert_eq!(graph.ns_per_frame_one(sink).unwrap(), 250);
    assert_eq!(graph.node(sink).unwrap().stats().ns_per_frame_one(), Some(250));
}

#[cfg(feature = "profile")]
#[test]
fn ns_per_frame_all_sums_the_subtree() {
    let clock = ManualClock::stepping(400);
    let (mut graph, source, pass, sink) = pipeline(clock, 4);
    graph.start(source).unwrap();
    graph.pump(source).unwrap();

    // three nodes, 400 ns and 4 frames each
    assert_eq!(graph.ns_per_frame_all(source).unwrap(), 100);
    assert_eq!(graph.subtree_stats(source).unwrap().total_nanoseconds(), 1_200);
    assert_eq!(graph.subtree_stats(source).unwrap().total_in_frames(), 12);
    assert_eq!(graph.subtree_stats(pass).unwrap().total_nanoseconds(), 800);
    assert_eq!(graph.ns_per_frame_all(sink).unwrap(), graph.ns_per_frame_one(sink).unwrap());
}

#[cfg(feature = "profile")]
#[test]
fn stats_survive_restart() {
    let (mut graph, source, _pass, sink) = pipeline(ManualClock::new(), 8);
    graph.start(source).unwrap();
    graph.pump(source).unwrap();
    graph.stop(source).unwrap();

    assert!(matches!(graph.pump(source), Err(GraphError::NotRunning { .. })));

    graph.start(source).unwrap();
    graph.pump(source).unwrap();
    assert_eq!(graph.node(sink).unwrap().stats().total_in_frames(), 16);
}
