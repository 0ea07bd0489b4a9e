//! Execution scheduler.
//!
//! Runs one OS thread per client. Every client is prepared first, one after
//! another on the calling thread; threads start only once all prepares have
//! succeeded. A master client, when configured, decides the run length of
//! every other (background) client through a shared stop flag.
//!
//! - [`client`] - Prepare phase and step replay of a single client
//! - [`stats`] - Run statistics and report lines

pub mod client;
pub mod stats;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::config::DEFAULT_PREEMPT_US;
use crate::context::ContextLayout;
use crate::device::DeviceCaps;
use crate::error::{Result, WsimError};
use crate::workload::Workload;

pub use client::{draw_duration, Client, ClientOptions, STEP_BUFFER_SIZE};
pub use stats::{ClientStats, PeriodStats, RunSummary};

/// Options shared by every client of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub repeat: u32,
    /// Cloned clients of a single workload.
    pub clients: usize,
    /// Index of the master workload.
    pub master: Option<usize>,
    pub dep_sync: bool,
    /// Give every client the same random streams.
    pub sync_rng: bool,
    pub seed: u64,
    pub duration_scale: f64,
    pub delay_scale: f64,
    pub preempt_us: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            repeat: 1,
            clients: 1,
            master: None,
            dep_sync: false,
            sync_rng: false,
            seed: 0,
            duration_scale: 1.0,
            delay_scale: 1.0,
            preempt_us: DEFAULT_PREEMPT_US,
        }
    }
}

impl RunOptions {
    /// Number of clients and the master client for `workloads` descriptors.
    pub fn layout(&self, workloads: usize) -> Result<(usize, Option<usize>)> {
        if workloads == 0 {
            return Err(WsimError::Options("no workload descriptors".to_string()));
        }
        if self.clients == 0 {
            return Err(WsimError::Options("client count must be at least 1".to_string()));
        }
        if workloads > 1 && self.clients > 1 {
            return Err(WsimError::Options(
                "cloned clients cannot be combined with multiple workloads".to_string(),
            ));
        }
        for (what, scale) in [("duration", self.duration_scale), ("delay", self.delay_scale)] {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(WsimError::Options(format!("invalid {} scale {}", what, scale)));
            }
        }

        let clients = if workloads > 1 { workloads } else { self.clients };
        let master = match self.master {
            Some(m) if m >= workloads => {
                return Err(WsimError::Options(format!("master workload {} does not exist", m)));
            }
            _ if clients == 1 => None,
            m => m,
        };
        Ok((clients, master))
    }
}

/// Prepare every client of the run, in client order.
pub fn prepare_clients(caps: &DeviceCaps, workloads: &mut [Workload], options: &RunOptions) -> Result<Vec<Client>> {
    let (count, master) = options.layout(workloads.len())?;

    // Engine and context checks need only capability queries; run them
    // before the first buffer is created.
    for workload in workloads.iter() {
        ContextLayout::plan(workload.steps(), caps)?;
    }

    for workload in workloads.iter_mut() {
        let mut rng = StdRng::seed_from_u64(options.seed);
        workload.allocate_shared(caps.device().as_ref(), &mut rng)?;
    }

    let mut streams = StdRng::seed_from_u64(options.seed);
    let mut clients = Vec::with_capacity(count);
    for id in 0..count {
        let (duration_seed, buffer_seed) = if options.sync_rng {
            (options.seed, options.seed)
        } else {
            (streams.gen(), streams.gen())
        };
        let client_options = ClientOptions {
            id,
            repeat: options.repeat,
            background: master.is_some_and(|m| m != id),
            dep_sync: options.dep_sync,
            duration_scale: options.duration_scale,
            delay_scale: options.delay_scale,
            preempt_us: options.preempt_us,
            duration_seed,
            buffer_seed,
        };
        let workload = &workloads[if workloads.len() > 1 { id } else { 0 }];
        clients.push(Client::prepare(workload, caps, client_options)?);
    }

    log::info!(
        "{} client{} prepared{}",
        count,
        if count > 1 { "s" } else { "" },
        master.map(|m| format!(", master {}", m)).unwrap_or_default()
    );
    Ok(clients)
}

/// Run prepared clients to completion.
///
/// With a master, the master is joined first and then every background
/// client is told to stop. A failing client stops everyone else.
pub fn run_clients(clients: Vec<Client>, repeat: u32) -> Result<RunSummary> {
    let master = clients.iter().position(|c| !c.options().background).filter(|_| {
        clients.iter().any(|c| c.options().background)
    });
    let stop = Arc::new(AtomicBool::new(false));
    let start = Instant::now();

    let mut handles: Vec<(usize, JoinHandle<Result<ClientStats>>)> = Vec::with_capacity(clients.len());
    let mut spawn_error = None;
    for mut client in clients {
        let id = client.id();
        let thread_stop = Arc::clone(&stop);
        let spawned = thread::Builder::new().name(format!("wsim-client-{}", id)).spawn(move || {
            let result = client.run(&thread_stop);
            if let Err(e) = &result {
                log::warn!("client {} failed: {}", id, e);
                thread_stop.store(true, Ordering::Release);
            }
            result
        });
        match spawned {
            Ok(handle) => handles.push((id, handle)),
            Err(source) => {
                stop.store(true, Ordering::Release);
                spawn_error = Some(WsimError::Spawn { client: id, source });
                break;
            }
        }
    }

    let mut results: Vec<(usize, Result<ClientStats>)> = Vec::with_capacity(handles.len());
    if let Some(pos) = master.and_then(|m| handles.iter().position(|(id, _)| *id == m)) {
        let (id, handle) = handles.remove(pos);
        results.push((id, join(id, handle)));
        stop.store(true, Ordering::Release);
    }
    for (id, handle) in handles {
        results.push((id, join(id, handle)));
    }
    let elapsed = start.elapsed();

    if let Some(e) = spawn_error {
        return Err(e);
    }
    results.sort_by_key(|(id, _)| *id);
    let clients = results.into_iter().map(|(_, r)| r).collect::<Result<Vec<_>>>()?;

    Ok(RunSummary {
        elapsed,
        repeat,
        master,
        clients,
    })
}

fn join(id: usize, handle: JoinHandle<Result<ClientStats>>) -> Result<ClientStats> {
    handle.join().map_err(|_| WsimError::ClientPanic(id))?
}

/// Prepare and run `workloads`, then release their shared working sets.
pub fn run(caps: &DeviceCaps, workloads: &mut [Workload], options: &RunOptions) -> Result<RunSummary> {
    let result = prepare_clients(caps, workloads, options).and_then(|clients| run_clients(clients, options.repeat));
    for workload in workloads.iter_mut() {
        workload.release_shared(caps.device().as_ref());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimConfig, SimDevice};
    use crate::error::ValidationError;

    fn setup(engines: &[&str]) -> (Arc<SimDevice>, DeviceCaps) {
        let sim = Arc::new(SimDevice::new(SimConfig::with_engines(engines)).unwrap());
        let caps = DeviceCaps::new(sim.clone());
        (sim, caps)
    }

    #[test]
    fn test_layout() {
        let options = RunOptions { clients: 4, ..Default::default() };
        assert_eq!(options.layout(1).unwrap(), (4, None));
        assert!(options.layout(2).is_err());
        assert!(options.layout(0).is_err());

        let options = RunOptions { master: Some(1), ..Default::default() };
        assert_eq!(options.layout(3).unwrap(), (3, Some(1)));
        // a master alone is just a client
        let options = RunOptions { master: Some(0), ..Default::default() };
        assert_eq!(options.layout(1).unwrap(), (1, None));

        let options = RunOptions { delay_scale: 0.0, ..Default::default() };
        assert!(options.layout(1).is_err());
    }

    #[test]
    fn test_cloned_clients_run() {
        let (sim, caps) = setup(&["RCS", "BCS"]);
        let mut workloads = vec![Workload::parse("0.RCS.20.0.0,0.BCS.20.-1.1").unwrap()];
        let options = RunOptions { clients: 3, repeat: 2, ..Default::default() };
        let summary = run(&caps, &mut workloads, &options).unwrap();

        assert_eq!(summary.clients.len(), 3);
        assert!(summary.clients.iter().all(|c| c.cycles == 2));
        assert_eq!(sim.stats().submissions, 12);
        assert_eq!(sim.live_buffers(), 0);
        assert_eq!(sim.live_contexts(), 0);
    }

    #[test]
    fn test_master_stops_background_clients() {
        let (_sim, caps) = setup(&["RCS", "BCS"]);
        let mut workloads = vec![
            Workload::parse("0.RCS.100.0.1").unwrap(),
            Workload::parse("0.BCS.100.0.1,d.100").unwrap(),
        ];
        let options = RunOptions { master: Some(0), repeat: 5, ..Default::default() };
        let summary = run(&caps, &mut workloads, &options).unwrap();

        assert_eq!(summary.master, Some(0));
        assert_eq!(summary.clients[0].cycles, 5);
        assert!(!summary.clients[0].background);
        assert!(summary.clients[1].background);
    }

    #[test]
    fn test_prepare_failure_releases_everything() {
        let (sim, caps) = setup(&["RCS"]);
        let mut workloads = vec![Workload::parse("W.1.64k,0.RCS.10.r1-0.0,0.VCS1.10.0.0").unwrap()];
        let err = run(&caps, &mut workloads, &RunOptions::default()).unwrap_err();
        assert!(matches!(err, WsimError::Validation(_)));
        assert_eq!(sim.stats().buffers_created, 0);
        assert_eq!(sim.stats().contexts_created, 0);
    }

    #[test]
    fn test_unknown_engine_rejected_before_shared_sets() {
        let (sim, caps) = setup(&["RCS"]);
        let mut workloads = vec![Workload::parse("W.1.64k,0.XCS.10.r1-0.0").unwrap()];
        let err = run(&caps, &mut workloads, &RunOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            WsimError::Validation(ValidationError::UnknownEngine { step: 1, .. })
        ));
        assert_eq!(sim.stats().buffers_created, 0);
        assert!(workloads[0].shared_set(1).is_none());
    }

    #[test]
    fn test_seeded_streams_differ_per_client() {
        let (_sim, caps) = setup(&["RCS"]);
        let mut workloads = vec![Workload::parse("w.1.1k-64k,0.RCS.10.0.0").unwrap()];
        let options = RunOptions { clients: 2, seed: 42, ..Default::default() };
        let clients = prepare_clients(&caps, &mut workloads, &options).unwrap();
        assert_ne!(clients[0].options().buffer_seed, clients[1].options().buffer_seed);
        drop(clients);

        let options = RunOptions { clients: 2, seed: 42, sync_rng: true, ..Default::default() };
        let clients = prepare_clients(&caps, &mut workloads, &options).unwrap();
        assert_eq!(clients[0].options().duration_seed, 42);
        assert_eq!(clients[1].options().buffer_seed, 42);
    }
}
