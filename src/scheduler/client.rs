//! One simulated client.
//!
//! [`Client::prepare`] runs single-threaded: it creates the client's
//! contexts, private working sets, per-step buffers and timing programs.
//! [`Client::run`] then replays the step list on the client's own thread.
//! Every device resource is released when the client is dropped.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::stats::{ClientStats, PeriodStats};
use crate::config::DEFAULT_PREEMPT_US;
use crate::context::ContextSet;
use crate::device::{
    BufferAccess, BufferHandle, ContextId, Device, DeviceCaps, Fence, InFence, RequestId, Submission, TimelineId,
};
use crate::error::{DeviceError, Result, WsimError};
use crate::parser::{DepTarget, DurationSpec, FenceDep, Step, StepKind};
use crate::timing::{build_program, us_to_ticks, TimingProgram};
use crate::workload::{apply_preemption, WorkingSet, Workload};

/// Size of the output and batch buffers of every submit-work step.
pub const STEP_BUFFER_SIZE: u64 = 4096;

/// Per-client run parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    pub id: usize,
    pub repeat: u32,
    /// Run until told to stop instead of for `repeat` iterations.
    pub background: bool,
    /// Wait for data dependencies before submitting.
    pub dep_sync: bool,
    pub duration_scale: f64,
    pub delay_scale: f64,
    pub preempt_us: u32,
    /// Seed of the duration stream.
    pub duration_seed: u64,
    /// Seed of the buffer-size stream.
    pub buffer_seed: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            id: 0,
            repeat: 1,
            background: false,
            dep_sync: false,
            duration_scale: 1.0,
            delay_scale: 1.0,
            preempt_us: DEFAULT_PREEMPT_US,
            duration_seed: 0,
            buffer_seed: 0,
        }
    }
}

/// Draw a duration in microseconds; `None` for unbounded work.
pub fn draw_duration<R: Rng + ?Sized>(spec: &DurationSpec, rng: &mut R) -> Option<u32> {
    match *spec {
        DurationSpec::Fixed(us) => Some(us),
        DurationSpec::Range { min, max } if min == max => Some(min),
        DurationSpec::Range { min, max } => Some(rng.gen_range(min..=max)),
        DurationSpec::Unbounded => None,
    }
}

fn scaled_us(us: u32, scale: f64) -> u64 {
    (f64::from(us) * scale).round() as u64
}

/// Submit-work step with its device resources.
#[derive(Debug)]
struct PreparedSubmit {
    context: ContextId,
    slot: usize,
    /// Outstanding-request queue, one per engine name.
    queue: usize,
    duration: DurationSpec,
    program: Arc<TimingProgram>,
    output: BufferHandle,
    objects: SmallVec<[BufferAccess; 4]>,
    fence: Option<FenceDep>,
    emit_fence: bool,
    wait: bool,
    /// Earlier submit-work steps this one consumes output of.
    step_deps: SmallVec<[usize; 4]>,
}

/// Replay state that lives for one run.
#[derive(Debug)]
struct RunState {
    /// Latest request of each step.
    requests: Vec<Option<RequestId>>,
    /// Fences produced this iteration.
    fences: Vec<Option<Fence>>,
    /// Queue a step is currently tracked on.
    queued_on: Vec<Option<usize>>,
    queues: Vec<VecDeque<usize>>,
    max_outstanding: Vec<usize>,
    throttle: Option<usize>,
    qd_throttle: Option<usize>,
    iteration_start: Instant,
    /// Timeline value at the start of the iteration.
    seqno: u64,
    /// Current timeline value.
    timeline_value: u64,
    period: PeriodStats,
}

impl RunState {
    fn new(steps: usize, queues: usize) -> Self {
        Self {
            requests: vec![None; steps],
            fences: vec![None; steps],
            queued_on: vec![None; steps],
            queues: vec![VecDeque::new(); queues],
            max_outstanding: vec![0; queues],
            throttle: None,
            qd_throttle: None,
            iteration_start: Instant::now(),
            seqno: 0,
            timeline_value: 0,
            period: PeriodStats::default(),
        }
    }
}

/// A prepared client instance of a workload.
pub struct Client {
    options: ClientOptions,
    device: Arc<dyn Device>,
    steps: Vec<Step>,
    contexts: ContextSet,
    private_sets: Vec<WorkingSet>,
    shared_sets: Vec<Arc<WorkingSet>>,
    step_buffers: Vec<BufferHandle>,
    submits: Vec<Option<PreparedSubmit>>,
    queue_names: Vec<String>,
    timeline: Option<TimelineId>,
    frequency: u64,
    rng: StdRng,
}

impl Client {
    /// Create every device resource the client needs.
    pub fn prepare(workload: &Workload, caps: &DeviceCaps, options: ClientOptions) -> Result<Self> {
        let device = Arc::clone(caps.device());
        let frequency = caps
            .timestamp_frequency()
            .map_err(|e| WsimError::resource("timestamp frequency", e))?;

        let mut steps = workload.steps().to_vec();
        apply_preemption(&mut steps, options.preempt_us);

        let contexts = ContextSet::configure(&steps, caps, workload.priority, workload.reduced_partition)?;

        let mut client = Self {
            rng: StdRng::seed_from_u64(options.duration_seed),
            options,
            device,
            submits: Vec::with_capacity(steps.len()),
            steps,
            contexts,
            private_sets: Vec::new(),
            shared_sets: Vec::new(),
            step_buffers: Vec::new(),
            queue_names: Vec::new(),
            timeline: None,
            frequency,
        };

        // From here on a failure drops `client`, which releases everything
        // created so far.
        client.allocate_working_sets(workload)?;
        client.build_submits()?;

        if client.steps.iter().any(|s| s.kind == StepKind::FenceCreate) {
            let timeline = client
                .device
                .create_timeline()
                .map_err(|e| WsimError::resource("sw fence timeline", e))?;
            client.timeline = Some(timeline);
        }

        log::debug!(
            "client {}: prepared {} steps, {} contexts, {} private working sets",
            client.options.id,
            client.steps.len(),
            client.contexts.len(),
            client.private_sets.len()
        );
        Ok(client)
    }

    pub fn id(&self) -> usize {
        self.options.id
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn contexts(&self) -> &ContextSet {
        &self.contexts
    }

    fn allocate_working_sets(&mut self, workload: &Workload) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(self.options.buffer_seed);
        for step in &self.steps {
            let StepKind::WorkingSet(decl) = &step.kind else {
                continue;
            };
            if decl.shared {
                let set = workload
                    .shared_set(decl.id)
                    .ok_or_else(|| WsimError::Options(format!("shared working set {} is not allocated", decl.id)))?;
                self.shared_sets.push(Arc::clone(set));
            } else {
                let set = WorkingSet::allocate(decl, self.device.as_ref(), &mut rng)?;
                self.private_sets.push(set);
            }
        }
        Ok(())
    }

    fn set_buffer(&self, id: u32, slot: usize) -> Option<BufferHandle> {
        self.private_sets
            .iter()
            .chain(self.shared_sets.iter().map(|s| s.as_ref()))
            .find(|s| s.id == id)
            .and_then(|s| s.handle(slot))
    }

    fn build_submits(&mut self) -> Result<()> {
        let mut queues: HashMap<String, usize> = HashMap::new();

        for i in 0..self.steps.len() {
            let step = &self.steps[i];
            let Some(submit) = step.as_submit() else {
                self.submits.push(None);
                continue;
            };

            let context = self
                .contexts
                .get(step.context)
                .map(|c| c.handle)
                .ok_or_else(|| WsimError::resource(format!("step {}", i), DeviceError::InvalidContext(step.context)))?;
            let slot = self.contexts.engine_slot(i).ok_or_else(|| {
                WsimError::resource(format!("step {}", i), DeviceError::InvalidEngine(submit.engine.to_string()))
            })?;

            let next = queues.len();
            let queue = *queues.entry(submit.engine.to_string()).or_insert(next);
            if queue == next {
                self.queue_names.push(submit.engine.to_string());
            }

            let output = self
                .device
                .create_buffer(STEP_BUFFER_SIZE)
                .map_err(|e| WsimError::resource(format!("step {} output buffer", i), e))?;
            self.step_buffers.push(output);
            let batch = self
                .device
                .create_buffer(STEP_BUFFER_SIZE)
                .map_err(|e| WsimError::resource(format!("step {} batch buffer", i), e))?;
            self.step_buffers.push(batch);

            let mut objects: SmallVec<[BufferAccess; 4]> = SmallVec::new();
            let mut step_deps = SmallVec::new();
            objects.push(BufferAccess { handle: output, write: true });
            for dep in &submit.data_deps {
                let handle = match dep.target {
                    DepTarget::Step(target) => {
                        step_deps.push(target);
                        self.submits.get(target).and_then(|s| s.as_ref()).map(|s| s.output)
                    }
                    DepTarget::Buffer { set, slot } => self.set_buffer(set, slot),
                };
                let handle = handle.ok_or_else(|| {
                    WsimError::resource(format!("step {} dependency", i), DeviceError::InvalidBuffer(u32::MAX))
                })?;
                objects.push(BufferAccess { handle, write: dep.write });
            }
            objects.push(BufferAccess { handle: batch, write: false });

            let program = build_program(submit.duration.is_unbounded(), submit.preempt_us, self.frequency);

            self.submits.push(Some(PreparedSubmit {
                context,
                slot,
                queue,
                duration: submit.duration,
                program: Arc::new(program),
                output,
                objects,
                fence: submit.fence_dep,
                emit_fence: submit.emit_fence,
                wait: submit.wait,
                step_deps,
            }));
        }
        Ok(())
    }

    /// Live timing program of submit-work step `index`.
    pub fn program(&self, index: usize) -> Option<&Arc<TimingProgram>> {
        self.submits.get(index)?.as_ref().map(|s| &s.program)
    }

    /// Replay the workload until the repeat count is reached or `stop` is
    /// raised, then drain every outstanding request.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<ClientStats> {
        let mut state = RunState::new(self.steps.len(), self.queue_names.len());
        let start = Instant::now();
        let mut cycles = 0u64;

        let mut result = Ok(());
        while !stop.load(Ordering::Acquire) && (self.options.background || cycles < u64::from(self.options.repeat)) {
            result = self.iteration(&mut state, stop);
            if result.is_err() {
                break;
            }
            cycles += 1;
        }

        if result.is_err() {
            // Release work gated on fences of the aborted iteration.
            if let Err(e) = self.reconcile_timeline(&mut state) {
                log::warn!("client {}: failed to release sw fences: {}", self.options.id, e);
            }
        }
        self.terminate_unbounded();
        let drained = self.drain(&state);
        result?;
        drained?;

        let stats = ClientStats {
            id: self.options.id,
            background: self.options.background,
            cycles,
            elapsed: start.elapsed(),
            period: self
                .steps
                .iter()
                .any(|s| matches!(s.kind, StepKind::Period { .. }))
                .then_some(state.period),
            max_outstanding: self.queue_names.iter().cloned().zip(state.max_outstanding).collect(),
        };
        log::debug!("client {}: {} cycles in {:?}", stats.id, stats.cycles, stats.elapsed);
        Ok(stats)
    }

    fn iteration(&mut self, state: &mut RunState, stop: &AtomicBool) -> Result<()> {
        let client = self.options.id;
        state.iteration_start = Instant::now();
        state.throttle = None;
        state.qd_throttle = None;

        for i in 0..self.steps.len() {
            if stop.load(Ordering::Acquire) {
                break;
            }
            self.execute(i, state)
                .map_err(|source| WsimError::RuntimeDevice { client, step: i, source })?;
        }

        self.reconcile_timeline(state).map_err(|source| WsimError::RuntimeDevice {
            client,
            step: self.steps.len(),
            source,
        })
    }

    /// Signal every sw fence of the current iteration and start the next
    /// iteration's sequence numbers past them.
    fn reconcile_timeline(&self, state: &mut RunState) -> Result<(), DeviceError> {
        if let Some(timeline) = self.timeline {
            let end = state.seqno + self.steps.len() as u64 + 1;
            if state.timeline_value < end {
                self.device.advance_timeline(timeline, end - state.timeline_value)?;
            }
            state.seqno = end;
            state.timeline_value = end;
        }
        state.fences.fill(None);
        Ok(())
    }

    fn execute(&mut self, i: usize, state: &mut RunState) -> Result<(), DeviceError> {
        let context = self.steps[i].context;
        match &self.steps[i].kind {
            StepKind::Submit(_) => self.submit(i, state)?,
            StepKind::SyncWait { target } => {
                if let Some(request) = state.requests[*target] {
                    self.device.wait(request)?;
                }
            }
            StepKind::Delay { us } => {
                thread::sleep(Duration::from_micros(scaled_us(*us, self.options.delay_scale)));
            }
            StepKind::Period { us } => {
                let elapsed = state.iteration_start.elapsed().as_micros() as u64;
                let period = scaled_us(*us, self.options.delay_scale);
                state.period.record(elapsed);
                if elapsed > period {
                    state.period.missed += 1;
                    log::debug!("client {}: dropped period at step {} ({}us late)", self.options.id, i, elapsed - period);
                } else {
                    thread::sleep(Duration::from_micros(period - elapsed));
                }
            }
            StepKind::SubmitThrottle { depth } => state.throttle = (*depth > 0).then_some(*depth as usize),
            StepKind::QueueDepthThrottle { depth } => state.qd_throttle = (*depth > 0).then_some(*depth as usize),
            StepKind::FenceCreate => {
                let timeline = self.timeline.ok_or(DeviceError::InvalidTimeline(u32::MAX))?;
                let fence = self.device.timeline_fence(timeline, state.seqno + i as u64 + 1)?;
                state.fences[i] = Some(fence);
            }
            StepKind::FenceSignal { target } => {
                let timeline = self.timeline.ok_or(DeviceError::InvalidTimeline(u32::MAX))?;
                let wanted = state.seqno + *target as u64 + 1;
                if state.timeline_value < wanted {
                    state.timeline_value = self.device.advance_timeline(timeline, wanted - state.timeline_value)?;
                }
            }
            StepKind::Priority { priority } => {
                if self.contexts.set_priority(self.device.as_ref(), context, *priority)? {
                    log::debug!("client {}: context {} priority {}", self.options.id, context, priority);
                }
            }
            StepKind::Partition { mask } => {
                self.contexts.set_partition(self.device.as_ref(), context, *mask)?;
            }
            StepKind::Terminate { target } => {
                if let Some(submit) = self.submits[*target].as_ref() {
                    submit.program.terminate();
                }
            }
            StepKind::Preemption { .. }
            | StepKind::EngineMap { .. }
            | StepKind::LoadBalance
            | StepKind::Bond { .. }
            | StepKind::WorkingSet(_) => {}
        }
        Ok(())
    }

    /// Nearest submit-work step at or before `index - distance`, wrapping.
    fn throttle_target(&self, index: usize, distance: usize) -> Option<usize> {
        let len = self.steps.len() as i64;
        let start = (index as i64 - distance as i64).rem_euclid(len) as usize;
        (0..self.steps.len())
            .map(|back| (start + self.steps.len() - back) % self.steps.len())
            .find(|&idx| self.steps[idx].is_submit())
    }

    fn submit(&mut self, i: usize, state: &mut RunState) -> Result<(), DeviceError> {
        let prepared = self.submits[i]
            .as_ref()
            .ok_or_else(|| DeviceError::InvalidParam(format!("step {} is not submit-work", i)))?;

        if self.options.dep_sync {
            for &dep in &prepared.step_deps {
                if let Some(request) = state.requests[dep] {
                    self.device.wait(request)?;
                }
            }
        }

        if let Some(distance) = state.throttle {
            let request = self.throttle_target(i, distance).and_then(|target| state.requests[target]);
            if let Some(request) = request {
                self.device.wait(request)?;
            }
        }

        match draw_duration(&prepared.duration, &mut self.rng) {
            Some(us) => {
                let ticks = us_to_ticks(scaled_us(us, self.options.duration_scale), self.frequency);
                prepared.program.patch_target(ticks);
            }
            None => {
                prepared.program.arm();
            }
        }

        let in_fence = prepared.fence.and_then(|dep| {
            let fence = state.fences[dep.target];
            if fence.is_none() {
                log::debug!("step {}: fence producer {} has no fence this iteration", i, dep.target);
            }
            fence.map(|fence| InFence { fence, submit: dep.submit })
        });

        let submitted = self.device.submit(Submission {
            context: prepared.context,
            engine: prepared.slot,
            program: Arc::clone(&prepared.program),
            objects: prepared.objects.clone(),
            in_fence,
            want_out_fence: prepared.emit_fence,
        })?;
        state.requests[i] = Some(submitted.request);
        if prepared.emit_fence {
            state.fences[i] = submitted.out_fence;
        }

        let queue = prepared.queue;
        state.max_outstanding[queue] = state.max_outstanding[queue].max(state.queues[queue].len());
        if let Some(previous) = state.queued_on[i].take() {
            if let Some(pos) = state.queues[previous].iter().position(|&s| s == i) {
                state.queues[previous].remove(pos);
            }
        }
        state.queues[queue].push_back(i);
        state.queued_on[i] = Some(queue);

        if prepared.wait {
            self.device.wait(submitted.request)?;
        }

        if let Some(depth) = state.qd_throttle {
            while state.queues[queue].len() > depth {
                let Some(oldest) = state.queues[queue].pop_front() else {
                    break;
                };
                state.queued_on[oldest] = None;
                if let Some(request) = state.requests[oldest] {
                    self.device.wait(request)?;
                }
            }
        }
        Ok(())
    }

    /// Release every unbounded program so draining cannot hang.
    fn terminate_unbounded(&self) {
        for submit in self.submits.iter().flatten() {
            if submit.program.is_unbounded() && !submit.program.is_terminated() {
                log::debug!("client {}: terminating unbounded work at run end", self.options.id);
                submit.program.terminate();
            }
        }
    }

    /// Wait for the newest request on every engine queue.
    fn drain(&self, state: &RunState) -> Result<()> {
        for queue in &state.queues {
            let Some(&step) = queue.back() else {
                continue;
            };
            if let Some(request) = state.requests[step] {
                self.device.wait(request).map_err(|source| WsimError::RuntimeDevice {
                    client: self.options.id,
                    step,
                    source,
                })?;
            }
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let device = self.device.as_ref();
        self.contexts.destroy(device);
        for handle in self.step_buffers.drain(..) {
            if let Err(e) = device.destroy_buffer(handle) {
                log::warn!("client {}: failed to release step buffer: {}", self.options.id, e);
            }
        }
        for set in &mut self.private_sets {
            set.release(device);
        }
        if let Some(timeline) = self.timeline.take() {
            if let Err(e) = device.destroy_timeline(timeline) {
                log::warn!("client {}: failed to destroy timeline: {}", self.options.id, e);
            }
        }
    }
}
