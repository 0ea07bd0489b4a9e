//! In-process simulated device.
//!
//! Models just enough of an accelerator for the workload core to run
//! without hardware:
//!
//! - one worker thread per physical engine
//! - a unit starts once its in-fence is signalled, the previous unit of
//!   the same context on the same engine slot has retired, and implicit
//!   buffer hazards are clear (writes wait for earlier readers and
//!   writers, reads wait for the earlier writer)
//! - ready units are picked by context priority, oldest first
//! - load-balanced slots run on whichever sibling goes idle first; bonds
//!   narrow the siblings when a submit fence producer ran on the master
//! - timing programs run against a clock at the configured frequency and
//!   may be preempted at arbitration points

mod engine;
pub mod memory;
mod state;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use engine::Shared;
use state::{Inner, Request, RequestState, SimContext};

pub use state::{ExecRecord, SimStats};

use super::{
    BufferHandle, ContextId, ContextParam, Device, EngineInfo, EngineSet, Fence, ParamKind,
    RequestId, Submission, Submitted, TimelineId, VmId,
};
use crate::config::{self, Config};
use crate::error::DeviceError;
use crate::timing::DeviceClock;

/// Shape of the simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    pub engines: Vec<String>,
    pub timestamp_frequency_hz: u64,
    pub slice_mask: u64,
    pub load_balance: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SimConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            engines: config.engines(),
            timestamp_frequency_hz: config.timestamp_frequency_hz(),
            slice_mask: config.slice_mask(),
            load_balance: config.load_balance(),
        }
    }

    /// Default device with the given engine names.
    pub fn with_engines(engines: &[&str]) -> Self {
        Self {
            engines: engines.iter().map(|e| e.to_string()).collect(),
            timestamp_frequency_hz: config::DEFAULT_TIMESTAMP_HZ,
            slice_mask: config::DEFAULT_SLICE_MASK,
            load_balance: true,
        }
    }
}

pub struct SimDevice {
    engines: Vec<EngineInfo>,
    config: SimConfig,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SimDevice {
    pub fn new(config: SimConfig) -> Result<Self, DeviceError> {
        if config.engines.is_empty() {
            return Err(DeviceError::InvalidParam("no engines configured".to_string()));
        }
        if config.slice_mask == 0 {
            return Err(DeviceError::InvalidParam("empty slice mask".to_string()));
        }

        let engines: Vec<EngineInfo> = config.engines.iter().map(|n| EngineInfo::from_name(n)).collect();
        for (i, engine) in engines.iter().enumerate() {
            if engines[..i].iter().any(|e| e.name == engine.name) {
                return Err(DeviceError::InvalidParam(format!("duplicate engine {}", engine.name)));
            }
        }

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::new(engines.len(), config.slice_mask, config.load_balance)),
            cond: Default::default(),
            clock: DeviceClock::new(config.timestamp_frequency_hz),
            shutdown: Default::default(),
        });

        let mut workers = Vec::with_capacity(engines.len());
        for (index, engine) in engines.iter().enumerate() {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("sim-{}", engine.name.to_lowercase()))
                .spawn(move || engine::run_engine(index, &shared))
                .map_err(|e| DeviceError::Unsupported(format!("engine thread: {}", e)))?;
            workers.push(handle);
        }

        log::info!(
            "Simulated device: {} engines, {} Hz timestamp",
            engines.len(),
            config.timestamp_frequency_hz
        );

        Ok(Self {
            engines,
            config,
            shared,
            workers: Mutex::new(workers),
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn stats(&self) -> SimStats {
        self.shared.lock().stats.clone()
    }

    /// Most recently retired requests, oldest first.
    pub fn history(&self) -> Vec<ExecRecord> {
        self.shared.lock().history.iter().copied().collect()
    }

    pub fn live_buffers(&self) -> usize {
        self.shared.lock().buffers.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.shared.lock().contexts.len()
    }

    /// Current device clock.
    pub fn now_ticks(&self) -> u64 {
        self.shared.clock.now_ticks()
    }

    fn count_query(&self) {
        self.shared.lock().stats.capability_queries += 1;
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        {
            // Under the lock so no worker misses the wakeup.
            let _inner = self.shared.lock();
            self.shared.shutdown.store(true, Ordering::Release);
        }
        self.shared.notify();
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if worker.join().is_err() {
                log::warn!("simulated engine worker panicked");
            }
        }
    }
}

impl Device for SimDevice {
    fn engines(&self) -> Result<Vec<EngineInfo>, DeviceError> {
        self.count_query();
        Ok(self.engines.clone())
    }

    fn timestamp_frequency(&self) -> Result<u64, DeviceError> {
        self.count_query();
        Ok(self.shared.clock.frequency())
    }

    fn default_slice_mask(&self) -> Result<u64, DeviceError> {
        self.count_query();
        Ok(self.config.slice_mask)
    }

    fn supports_load_balance(&self) -> Result<bool, DeviceError> {
        self.count_query();
        Ok(self.config.load_balance)
    }

    fn create_buffer(&self, size: u64) -> Result<BufferHandle, DeviceError> {
        let mut inner = self.shared.lock();
        let handle = inner.buffers.create(size)?;
        inner.stats.buffers_created += 1;
        log::trace!("buffer {} created, {} bytes", handle.0, size);
        Ok(handle)
    }

    fn write_buffer(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.shared.lock().buffers.write(handle, offset, data)
    }

    fn read_buffer(&self, handle: BufferHandle, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.shared.lock().buffers.read(handle, offset, buf)
    }

    fn destroy_buffer(&self, handle: BufferHandle) -> Result<(), DeviceError> {
        let mut inner = self.shared.lock();
        inner.buffers.destroy(handle)?;
        inner.forget_buffer(handle.0);
        inner.stats.buffers_destroyed += 1;
        Ok(())
    }

    fn create_context(&self, vm: Option<VmId>) -> Result<ContextId, DeviceError> {
        let mut inner = self.shared.lock();
        let vm = match vm {
            Some(vm) if vm.0 >= inner.next_vm => return Err(DeviceError::InvalidVm(vm.0)),
            Some(vm) => vm,
            None => {
                inner.next_vm += 1;
                VmId(inner.next_vm)
            }
        };

        inner.next_context += 1;
        let id = inner.next_context;
        let slice_mask = inner.slice_mask;
        inner.contexts.insert(
            id,
            SimContext {
                vm,
                priority: 0,
                persistent: true,
                engines: None,
                slice_mask,
            },
        );
        inner.stats.contexts_created += 1;
        Ok(ContextId(id))
    }

    fn context_vm(&self, ctx: ContextId) -> Result<VmId, DeviceError> {
        Ok(self.shared.lock().context(ctx)?.vm)
    }

    fn set_param(&self, ctx: ContextId, param: ContextParam) -> Result<(), DeviceError> {
        let mut inner = self.shared.lock();
        match param {
            ContextParam::Priority(priority) => inner.context_mut(ctx)?.priority = priority,
            ContextParam::Persistence(persistent) => inner.context_mut(ctx)?.persistent = persistent,
            ContextParam::Engines(set) => {
                inner.context(ctx)?;
                inner.validate_engines(&set)?;
                inner.context_mut(ctx)?.engines = Some(set);
            }
            ContextParam::Sseu { slice_mask } => {
                let device_mask = inner.slice_mask;
                if slice_mask == 0 || slice_mask & !device_mask != 0 {
                    return Err(DeviceError::InvalidParam(format!(
                        "slice mask {:#x} not within {:#x}",
                        slice_mask, device_mask
                    )));
                }
                inner.context_mut(ctx)?.slice_mask = slice_mask;
            }
        }
        self.shared.notify();
        Ok(())
    }

    fn get_param(&self, ctx: ContextId, kind: ParamKind) -> Result<ContextParam, DeviceError> {
        let inner = self.shared.lock();
        let context = inner.context(ctx)?;
        Ok(match kind {
            ParamKind::Priority => ContextParam::Priority(context.priority),
            ParamKind::Persistence => ContextParam::Persistence(context.persistent),
            ParamKind::Engines => ContextParam::Engines(context.engines.clone().unwrap_or_else(|| {
                EngineSet {
                    slots: (0..self.engines.len()).map(super::EngineSlot::Physical).collect(),
                    extensions: Vec::new(),
                }
            })),
            ParamKind::Sseu => ContextParam::Sseu {
                slice_mask: context.slice_mask,
            },
        })
    }

    fn destroy_context(&self, ctx: ContextId) -> Result<(), DeviceError> {
        let mut inner = self.shared.lock();
        let context = inner
            .contexts
            .remove(&ctx.0)
            .ok_or(DeviceError::InvalidContext(ctx.0))?;
        if !context.persistent {
            // Queued work of a non-persistent context is cancelled.
            let cancelled: Vec<u64> = inner
                .requests
                .iter()
                .filter(|(_, r)| r.context == ctx && r.state == RequestState::Queued)
                .map(|(&id, _)| id)
                .collect();
            for id in cancelled {
                inner.requests.remove(&id);
            }
        }
        inner.stats.contexts_destroyed += 1;
        self.shared.notify();
        Ok(())
    }

    fn submit(&self, submission: Submission) -> Result<Submitted, DeviceError> {
        let mut inner = self.shared.lock();

        let context = inner.context(submission.context)?;
        let priority = context.priority;
        let placement = inner.placement(context, submission.engine)?;

        if let Some(fence) = &submission.in_fence {
            inner.check_fence(&fence.fence)?;
        }
        for obj in &submission.objects {
            if !inner.buffers.contains(obj.handle) {
                return Err(DeviceError::InvalidBuffer(obj.handle.0));
            }
        }

        let id = inner.next_request;
        inner.next_request += 1;
        let after = inner.ordering(id, submission.context, submission.engine, &submission.objects);

        let program = submission.program;
        inner.requests.insert(
            id,
            Request {
                context: submission.context,
                priority,
                placement,
                in_fence: submission.in_fence,
                producer_engine: None,
                after,
                target_ticks: program.target_ticks(),
                generation: program.generation(),
                program,
                state: RequestState::Queued,
                resume: None,
                started_at: 0,
            },
        );
        inner.stats.submissions += 1;
        drop(inner);
        self.shared.notify();

        let request = RequestId(id);
        Ok(Submitted {
            request,
            out_fence: submission.want_out_fence.then_some(Fence::Request(request)),
        })
    }

    fn wait(&self, request: RequestId) -> Result<(), DeviceError> {
        let mut inner = self.shared.lock();
        if request.0 >= inner.next_request {
            return Err(DeviceError::InvalidRequest(request.0));
        }
        while inner.is_live(request.0) {
            if self.shared.is_shutdown() {
                return Err(DeviceError::Lost);
            }
            inner = self.shared.wait(inner);
        }
        Ok(())
    }

    fn is_busy(&self, request: RequestId) -> Result<bool, DeviceError> {
        let inner = self.shared.lock();
        if request.0 >= inner.next_request {
            return Err(DeviceError::InvalidRequest(request.0));
        }
        Ok(inner.is_live(request.0))
    }

    fn create_timeline(&self) -> Result<TimelineId, DeviceError> {
        let mut inner = self.shared.lock();
        let id = inner.next_timeline;
        inner.next_timeline += 1;
        inner.timelines.insert(id, 0);
        Ok(TimelineId(id))
    }

    fn timeline_fence(&self, timeline: TimelineId, seqno: u64) -> Result<Fence, DeviceError> {
        let inner = self.shared.lock();
        if !inner.timelines.contains_key(&timeline.0) {
            return Err(DeviceError::InvalidTimeline(timeline.0));
        }
        Ok(Fence::Timeline { timeline, seqno })
    }

    fn advance_timeline(&self, timeline: TimelineId, by: u64) -> Result<u64, DeviceError> {
        let mut inner = self.shared.lock();
        let value = inner
            .timelines
            .get_mut(&timeline.0)
            .ok_or(DeviceError::InvalidTimeline(timeline.0))?;
        *value += by;
        let value = *value;
        drop(inner);
        self.shared.notify();
        Ok(value)
    }

    fn timeline_value(&self, timeline: TimelineId) -> Result<u64, DeviceError> {
        let inner = self.shared.lock();
        inner
            .timelines
            .get(&timeline.0)
            .copied()
            .ok_or(DeviceError::InvalidTimeline(timeline.0))
    }

    fn destroy_timeline(&self, timeline: TimelineId) -> Result<(), DeviceError> {
        let mut inner = self.shared.lock();
        inner
            .timelines
            .remove(&timeline.0)
            .ok_or(DeviceError::InvalidTimeline(timeline.0))?;
        drop(inner);
        self.shared.notify();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BufferAccess, EngineExtension, EngineSlot, InFence};
    use crate::timing::{us_to_ticks, TimingProgram};
    use smallvec::smallvec;

    fn device(engines: &[&str]) -> SimDevice {
        let mut config = SimConfig::with_engines(engines);
        config.timestamp_frequency_hz = 1_000_000;
        SimDevice::new(config).unwrap()
    }

    fn program(us: u64) -> Arc<TimingProgram> {
        let program = Arc::new(TimingProgram::bounded(0));
        program.patch_target(us_to_ticks(us, 1_000_000));
        program.arm();
        program
    }

    fn submission(ctx: ContextId, engine: usize, program: Arc<TimingProgram>) -> Submission {
        Submission {
            context: ctx,
            engine,
            program,
            objects: smallvec![],
            in_fence: None,
            want_out_fence: false,
        }
    }

    #[test]
    fn test_submit_and_wait() {
        let dev = device(&["RCS"]);
        let ctx = dev.create_context(None).unwrap();
        let done = dev.submit(submission(ctx, 0, program(500))).unwrap();
        assert!(done.out_fence.is_none());
        dev.wait(done.request).unwrap();
        assert!(!dev.is_busy(done.request).unwrap());
        assert_eq!(dev.stats().completions, 1);
        assert!(dev.wait(RequestId(99)).is_err());
    }

    #[test]
    fn test_same_context_runs_in_order() {
        let dev = device(&["RCS"]);
        let ctx = dev.create_context(None).unwrap();
        let first = dev.submit(submission(ctx, 0, program(1000))).unwrap();
        let second = dev.submit(submission(ctx, 0, program(100))).unwrap();
        dev.wait(second.request).unwrap();

        let history = dev.history();
        let a = history.iter().find(|r| r.request == first.request).unwrap();
        let b = history.iter().find(|r| r.request == second.request).unwrap();
        assert!(b.start >= a.end);
    }

    #[test]
    fn test_read_waits_for_writer_on_other_engine() {
        let dev = device(&["RCS", "BCS"]);
        let ctx = dev.create_context(None).unwrap();
        let buf = dev.create_buffer(4096).unwrap();

        let mut write = submission(ctx, 0, program(2000));
        write.objects = smallvec![BufferAccess { handle: buf, write: true }];
        let mut read = submission(ctx, 1, program(10));
        read.objects = smallvec![BufferAccess { handle: buf, write: false }];

        let w = dev.submit(write).unwrap();
        let r = dev.submit(read).unwrap();
        dev.wait(r.request).unwrap();
        assert!(!dev.is_busy(w.request).unwrap());
    }

    #[test]
    fn test_timeline_fence_gates_execution() {
        let dev = device(&["RCS"]);
        let ctx = dev.create_context(None).unwrap();
        let tl = dev.create_timeline().unwrap();
        let fence = dev.timeline_fence(tl, 1).unwrap();

        let mut sub = submission(ctx, 0, program(10));
        sub.in_fence = Some(InFence { fence, submit: false });
        let req = dev.submit(sub).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(dev.is_busy(req.request).unwrap());
        assert_eq!(dev.advance_timeline(tl, 1).unwrap(), 1);
        dev.wait(req.request).unwrap();
        dev.destroy_timeline(tl).unwrap();
    }

    #[test]
    fn test_priority_picks_first() {
        let dev = device(&["RCS"]);
        let blocker_ctx = dev.create_context(None).unwrap();
        let low = dev.create_context(None).unwrap();
        let high = dev.create_context(None).unwrap();
        dev.set_param(high, ContextParam::Priority(10)).unwrap();

        // Hold the engine while both contenders queue up.
        let tl = dev.create_timeline().unwrap();
        let mut gate = submission(blocker_ctx, 0, program(10));
        gate.in_fence = Some(InFence { fence: dev.timeline_fence(tl, 1).unwrap(), submit: false });
        let mut low_sub = submission(low, 0, program(10));
        low_sub.in_fence = gate.in_fence;
        let mut high_sub = submission(high, 0, program(10));
        high_sub.in_fence = gate.in_fence;

        dev.submit(gate).unwrap();
        let l = dev.submit(low_sub).unwrap();
        let h = dev.submit(high_sub).unwrap();
        dev.advance_timeline(tl, 1).unwrap();
        dev.wait(l.request).unwrap();
        dev.wait(h.request).unwrap();

        let history = dev.history();
        let lo = history.iter().find(|r| r.request == l.request).unwrap();
        let hi = history.iter().find(|r| r.request == h.request).unwrap();
        assert!(hi.start <= lo.start);
    }

    #[test]
    fn test_load_balanced_slot_uses_siblings() {
        let dev = device(&["RCS", "VCS1", "VCS2"]);
        let ctx = dev.create_context(None).unwrap();
        dev.set_param(
            ctx,
            ContextParam::Engines(EngineSet {
                slots: vec![EngineSlot::Virtual, EngineSlot::Physical(1), EngineSlot::Physical(2)],
                extensions: vec![EngineExtension::LoadBalance { slot: 0, siblings: vec![1, 2] }],
            }),
        )
        .unwrap();

        let reqs: Vec<_> = (0..4)
            .map(|_| dev.submit(submission(ctx, 0, program(200))).unwrap())
            .collect();
        for req in &reqs {
            dev.wait(req.request).unwrap();
        }
        assert!(dev.history().iter().all(|r| r.engine == 1 || r.engine == 2));
    }

    #[test]
    fn test_engine_map_validation() {
        let dev = device(&["RCS", "VCS1"]);
        let ctx = dev.create_context(None).unwrap();
        let virtual_only = EngineSet {
            slots: vec![EngineSlot::Virtual],
            extensions: vec![],
        };
        assert!(dev.set_param(ctx, ContextParam::Engines(virtual_only)).is_err());

        let bond_first = EngineSet {
            slots: vec![EngineSlot::Virtual],
            extensions: vec![EngineExtension::Bond { slot: 0, master: 0, siblings: vec![1] }],
        };
        assert!(dev.set_param(ctx, ContextParam::Engines(bond_first)).is_err());
        assert!(dev.submit(submission(ctx, 5, program(1))).is_err());
    }

    #[test]
    fn test_sseu_mask_must_be_subset() {
        let dev = device(&["RCS"]);
        let ctx = dev.create_context(None).unwrap();
        dev.set_param(ctx, ContextParam::Sseu { slice_mask: 1 }).unwrap();
        assert_eq!(
            dev.get_param(ctx, ParamKind::Sseu).unwrap(),
            ContextParam::Sseu { slice_mask: 1 }
        );
        assert!(dev.set_param(ctx, ContextParam::Sseu { slice_mask: 0b100 }).is_err());
    }

    #[test]
    fn test_shared_vm() {
        let dev = device(&["RCS"]);
        let a = dev.create_context(None).unwrap();
        let vm = dev.context_vm(a).unwrap();
        let b = dev.create_context(Some(vm)).unwrap();
        assert_eq!(dev.context_vm(b).unwrap(), vm);
        assert!(dev.create_context(Some(VmId(vm.0 + 10))).is_err());
        dev.destroy_context(a).unwrap();
        dev.destroy_context(b).unwrap();
        assert_eq!(dev.live_contexts(), 0);
    }

    #[test]
    fn test_unbounded_work_preempted_by_higher_priority() {
        let dev = device(&["RCS"]);
        let low = dev.create_context(None).unwrap();
        let high = dev.create_context(None).unwrap();
        dev.set_param(high, ContextParam::Priority(5)).unwrap();

        let spinner = Arc::new(TimingProgram::unbounded(us_to_ticks(100, 1_000_000)));
        spinner.arm();
        let spin = dev.submit(submission(low, 0, spinner.clone())).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));

        let quick = dev.submit(submission(high, 0, program(50))).unwrap();
        dev.wait(quick.request).unwrap();
        assert!(dev.is_busy(spin.request).unwrap());
        assert!(dev.stats().preemptions >= 1);

        spinner.terminate();
        dev.wait(spin.request).unwrap();
    }
}
