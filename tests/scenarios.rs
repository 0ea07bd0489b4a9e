//! End-to-end workload runs against the simulated device.

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use wsim::device::{DeviceCaps, SimConfig, SimDevice};
use wsim::parser::{load_descriptor, parse_steps, BufferSize, DepTarget, StepKind};
use wsim::scheduler::{self, Client, ClientOptions, RunOptions};
use wsim::workload::{working_set::draw_size, Workload};
use wsim::WsimError;

fn sim(engines: &[&str]) -> (Arc<SimDevice>, DeviceCaps) {
    let sim = Arc::new(SimDevice::new(SimConfig::with_engines(engines)).unwrap());
    let caps = DeviceCaps::new(sim.clone());
    (sim, caps)
}

#[test]
fn test_dependent_submission_runs_after_its_producer() {
    let (sim, caps) = sim(&["ENGINE"]);
    let mut workloads = vec![Workload::parse("0.ENGINE.1000,0.ENGINE.1000.-1").unwrap()];

    let steps = workloads[0].steps();
    assert_eq!(steps.len(), 2);
    let second = steps[1].as_submit().unwrap();
    assert_eq!(second.engine.as_str(), "ENGINE");
    assert_eq!(second.data_deps[0].target, DepTarget::Step(0));

    let summary = scheduler::run(&caps, &mut workloads, &RunOptions::default()).unwrap();
    assert_eq!(summary.clients[0].cycles, 1);

    let mut history = sim.history();
    history.sort_by_key(|r| r.request);
    assert_eq!(history.len(), 2);
    assert!(history[1].start >= history[0].end);
}

#[test]
fn test_delay_advances_iteration_time() {
    let (_sim, caps) = sim(&["RCS"]);
    let wrk = Workload::parse("1.d.50").unwrap();
    let mut client = Client::prepare(&wrk, &caps, ClientOptions::default()).unwrap();
    let stats = client.run(&AtomicBool::new(false)).unwrap();
    assert_eq!(stats.cycles, 1);
    assert!(stats.elapsed >= Duration::from_micros(50));
}

#[test]
fn test_delay_scale_applies() {
    let (_sim, caps) = sim(&["RCS"]);
    let wrk = Workload::parse("d.100").unwrap();
    let options = ClientOptions { delay_scale: 20.0, ..Default::default() };
    let mut client = Client::prepare(&wrk, &caps, options).unwrap();
    let stats = client.run(&AtomicBool::new(false)).unwrap();
    assert!(stats.elapsed >= Duration::from_millis(2));
}

#[test]
fn test_shared_working_set_allocated_once() {
    let (sim, caps) = sim(&["RCS"]);
    let mut workloads = vec![Workload::parse("W.1.2n16k,0.RCS.10.r1-0-1.0").unwrap()];
    let options = RunOptions { clients: 4, ..Default::default() };
    scheduler::run(&caps, &mut workloads, &options).unwrap();

    // two shared buffers, plus output and batch buffers for each client's submit
    assert_eq!(sim.stats().buffers_created, 2 + 4 * 2);
    assert_eq!(sim.live_buffers(), 0);
}

#[test]
fn test_private_working_sets_per_client() {
    let (sim, caps) = sim(&["RCS"]);
    let mut workloads = vec![Workload::parse("w.1.2n16k,0.RCS.10.w1-1.0").unwrap()];
    let options = RunOptions { clients: 3, ..Default::default() };
    scheduler::run(&caps, &mut workloads, &options).unwrap();
    assert_eq!(sim.stats().buffers_created, 3 * (2 + 2));
}

#[test]
fn test_queue_depth_bound_across_clients() {
    let (_sim, caps) = sim(&["RCS", "BCS"]);
    let mut workloads = vec![Workload::parse("q.1,0.RCS.100.0.0,0.RCS.100.0.0,0.BCS.100.0.0,0.RCS.100.0.0").unwrap()];
    let options = RunOptions { clients: 2, repeat: 3, ..Default::default() };
    let summary = scheduler::run(&caps, &mut workloads, &options).unwrap();
    for stats in &summary.clients {
        assert!(stats.max_outstanding_on("RCS").unwrap() <= 1);
        assert!(stats.max_outstanding_on("BCS").unwrap() <= 1);
    }
}

#[test]
fn test_unbounded_work_terminated_before_completion() {
    let (sim, caps) = sim(&["RCS", "BCS"]);
    let mut workloads = vec![Workload::parse("0.RCS.*.0.0,1.BCS.300.0.1,T.-2").unwrap()];
    let options = RunOptions { repeat: 2, ..Default::default() };
    let summary = scheduler::run(&caps, &mut workloads, &options).unwrap();
    assert_eq!(summary.clients[0].cycles, 2);

    let stats = sim.stats();
    assert_eq!(stats.submissions, 4);
    assert_eq!(stats.completions, 4);
}

#[test]
fn test_period_reports_timing() {
    let (_sim, caps) = sim(&["RCS"]);
    let mut workloads = vec![Workload::parse("0.RCS.100.0.1,p.5000").unwrap()];
    let options = RunOptions { repeat: 2, ..Default::default() };
    let summary = scheduler::run(&caps, &mut workloads, &options).unwrap();
    let line = summary.clients[0].to_string();
    assert!(line.starts_with("*0: "));
    assert!(line.contains("(2 cycles,"));
    assert!(line.contains("Time avg/min/max="));
    assert!(line.ends_with("0 missed."));
}

#[test]
fn test_balanced_context_runs() {
    let (sim, caps) = sim(&["RCS", "VCS1", "VCS2"]);
    let mut workloads = vec![Workload::parse("M.1.VCS,B.1,1.DEFAULT.200.0.0,1.DEFAULT.200.0.0,1.VCS.50.-1.1").unwrap()];
    scheduler::run(&caps, &mut workloads, &RunOptions::default()).unwrap();

    let engines: Vec<usize> = sim.history().iter().map(|r| r.engine).collect();
    assert_eq!(engines.len(), 3);
    assert!(engines.iter().all(|&e| e == 1 || e == 2));
}

#[test]
fn test_invalid_configuration_creates_nothing() {
    let (sim, caps) = sim(&["RCS", "VCS1", "VCS2"]);
    let mut workloads = vec![Workload::parse("M.1.VCS1|VCS2,1.RCS.10.0.0").unwrap()];
    let err = scheduler::run(&caps, &mut workloads, &RunOptions::default()).unwrap_err();
    assert!(matches!(err, WsimError::Validation(_)));
    assert_eq!(sim.stats().contexts_created, 0);
    assert_eq!(sim.stats().buffers_created, 0);

    let mut workloads = vec![Workload::parse("W.1.2n4k,M.1.VCS1,1.VCS2.10.r1-0.0").unwrap()];
    let err = scheduler::run(&caps, &mut workloads, &RunOptions::default()).unwrap_err();
    assert!(matches!(err, WsimError::Validation(_)));
    assert_eq!(sim.stats().buffers_created, 0);

    assert!(matches!(Workload::parse("B.1"), Err(WsimError::Validation(_))));
}

#[test]
fn test_descriptor_file_with_append() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "0.RCS.10.0.0").unwrap();
    writeln!(file, "d.5").unwrap();
    writeln!(file, "0.RCS.10.-2.0").unwrap();

    let text = load_descriptor(file.path().to_str().unwrap()).unwrap();
    assert_eq!(text, "0.RCS.10.0.0,d.5,0.RCS.10.-2.0");

    let append = parse_steps("s.-1").unwrap_err();
    assert_eq!(append.step, 0);

    let append = parse_steps("0.BCS.10.0.1").unwrap();
    let wrk = Workload::parse_with_append(&text, &append).unwrap();
    assert_eq!(wrk.len(), 4);
    assert_eq!(wrk.steps()[3].index, 3);
}

fn submit_chain(offsets: &[usize]) -> String {
    offsets
        .iter()
        .map(|&back| if back == 0 { "0.RCS.10.0.0".to_string() } else { format!("0.RCS.10.-{}.0", back) })
        .collect::<Vec<_>>()
        .join(",")
}

proptest! {
    #[test]
    fn prop_step_count_and_indices(raw in prop::collection::vec(0usize..8, 1..24)) {
        // clamp every offset into the valid range for its position
        let offsets: Vec<usize> = raw.iter().enumerate().map(|(i, &b)| b.min(i)).collect();
        let text = submit_chain(&offsets);
        let wrk = Workload::parse(&text).unwrap();

        prop_assert_eq!(wrk.len(), offsets.len());
        for (pos, step) in wrk.steps().iter().enumerate() {
            prop_assert_eq!(step.index, pos);
            if let StepKind::Submit(submit) = &step.kind {
                for dep in &submit.data_deps {
                    prop_assert!(matches!(dep.target, DepTarget::Step(target) if target < pos));
                }
            }
        }
    }

    #[test]
    fn prop_offset_before_first_step_rejected(pos in 0usize..10, extra in 1usize..5) {
        let mut offsets = vec![0; pos + 1];
        offsets[pos] = pos + extra;
        let err = parse_steps(&submit_chain(&offsets)).unwrap_err();
        prop_assert_eq!(err.step, pos);
    }

    #[test]
    fn prop_size_draw_in_range(min in 1u64..1 << 20, span in 0u64..1 << 20, seed in any::<u64>()) {
        let spec = BufferSize { min, max: min + span };
        let mut a = StdRng::seed_from_u64(seed);
        let mut b = StdRng::seed_from_u64(seed);
        for _ in 0..8 {
            let size = draw_size(&spec, &mut a);
            prop_assert!(size >= spec.min && size <= spec.max);
            prop_assert_eq!(size, draw_size(&spec, &mut b));
        }
    }
}
