//! Shared state of the simulated device: contexts, requests, timelines.
//!
//! Everything lives behind one mutex. Engine workers and waiters sleep on a
//! single condition variable that is notified on every state change.

use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use super::memory::BufferStore;
use crate::device::{
    BufferAccess, ContextId, EngineExtension, EngineSet, EngineSlot, Fence, InFence, RequestId,
    VmId,
};
use crate::error::DeviceError;
use crate::timing::{Interpreter, TimingProgram};

/// Records kept in the execution history.
pub const HISTORY_LEN: usize = 4096;

/// Counters exposed for tests and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub buffers_created: u64,
    pub buffers_destroyed: u64,
    pub contexts_created: u64,
    pub contexts_destroyed: u64,
    pub submissions: u64,
    pub completions: u64,
    pub preemptions: u64,
    pub capability_queries: u64,
}

/// One executed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecRecord {
    pub request: RequestId,
    pub context: ContextId,
    pub engine: usize,
    /// Device ticks when the request first started.
    pub start: u64,
    /// Device ticks when it retired.
    pub end: u64,
}

pub(super) struct SimContext {
    pub vm: VmId,
    pub priority: i32,
    pub persistent: bool,
    pub engines: Option<EngineSet>,
    pub slice_mask: u64,
}

/// Where a request may execute.
#[derive(Debug, Clone)]
pub(super) enum Placement {
    Physical(usize),
    Balanced {
        siblings: Vec<usize>,
        /// (master, siblings) pairs from bond extensions.
        bonds: Vec<(usize, Vec<usize>)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RequestState {
    Queued,
    Running(usize),
    Preempted(usize),
}

pub(super) struct Request {
    pub context: ContextId,
    pub priority: i32,
    pub placement: Placement,
    pub in_fence: Option<InFence>,
    /// Engine the submit-fence producer started on.
    pub producer_engine: Option<usize>,
    /// Requests that must retire first.
    pub after: SmallVec<[u64; 4]>,
    pub program: Arc<TimingProgram>,
    pub target_ticks: u64,
    pub generation: u64,
    pub state: RequestState,
    pub resume: Option<Interpreter>,
    pub started_at: u64,
}

/// Implicit ordering state of one buffer.
#[derive(Default)]
pub(super) struct Hazard {
    writer: Option<u64>,
    readers: Vec<u64>,
}

pub(super) struct Inner {
    pub engine_count: usize,
    pub slice_mask: u64,
    pub load_balance: bool,
    pub buffers: BufferStore,
    pub contexts: HashMap<u32, SimContext>,
    pub next_context: u32,
    pub next_vm: u32,
    /// Live requests; retired ones are removed.
    pub requests: BTreeMap<u64, Request>,
    pub next_request: u64,
    pub timelines: HashMap<u32, u64>,
    pub next_timeline: u32,
    hazards: HashMap<u32, Hazard>,
    /// Last request per (context, engine slot).
    last_on_slot: HashMap<(u32, usize), u64>,
    pub history: VecDeque<ExecRecord>,
    pub stats: SimStats,
}

impl Inner {
    pub fn new(engine_count: usize, slice_mask: u64, load_balance: bool) -> Self {
        Self {
            engine_count,
            slice_mask,
            load_balance,
            buffers: BufferStore::default(),
            contexts: HashMap::new(),
            next_context: 0,
            next_vm: 0,
            requests: BTreeMap::new(),
            next_request: 0,
            timelines: HashMap::new(),
            next_timeline: 0,
            hazards: HashMap::new(),
            last_on_slot: HashMap::new(),
            history: VecDeque::new(),
            stats: SimStats::default(),
        }
    }

    pub fn context(&self, ctx: ContextId) -> Result<&SimContext, DeviceError> {
        self.contexts.get(&ctx.0).ok_or(DeviceError::InvalidContext(ctx.0))
    }

    pub fn context_mut(&mut self, ctx: ContextId) -> Result<&mut SimContext, DeviceError> {
        self.contexts.get_mut(&ctx.0).ok_or(DeviceError::InvalidContext(ctx.0))
    }

    pub fn is_live(&self, id: u64) -> bool {
        self.requests.contains_key(&id)
    }

    /// Check an engine map against the device before installing it.
    pub fn validate_engines(&self, set: &EngineSet) -> Result<(), DeviceError> {
        let valid = |e: usize| e < self.engine_count;
        let bad = |what: String| Err(DeviceError::InvalidEngine(what));

        if set.slots.is_empty() {
            return bad("empty engine map".to_string());
        }
        for slot in &set.slots {
            if let EngineSlot::Physical(e) = slot {
                if !valid(*e) {
                    return bad(format!("engine index {}", e));
                }
            }
        }

        let mut balanced = Vec::new();
        for ext in &set.extensions {
            match ext {
                EngineExtension::LoadBalance { slot, siblings } => {
                    if !self.load_balance {
                        return Err(DeviceError::Unsupported("load balancing".to_string()));
                    }
                    if set.slots.get(*slot) != Some(&EngineSlot::Virtual) {
                        return bad(format!("load balancing on non-virtual slot {}", slot));
                    }
                    if siblings.is_empty() || !siblings.iter().copied().all(valid) {
                        return bad(format!("load balancing siblings {:?}", siblings));
                    }
                    balanced.push(*slot);
                }
                EngineExtension::Bond { slot, master, siblings } => {
                    if !balanced.contains(slot) {
                        return bad(format!("bond on unbalanced slot {}", slot));
                    }
                    if !valid(*master) || siblings.is_empty() || !siblings.iter().copied().all(valid) {
                        return bad(format!("bond master {} siblings {:?}", master, siblings));
                    }
                }
            }
        }

        for (i, slot) in set.slots.iter().enumerate() {
            if *slot == EngineSlot::Virtual && !balanced.contains(&i) {
                return bad(format!("virtual slot {} without load balancing", i));
            }
        }
        Ok(())
    }

    /// Where work for `slot` of `ctx` runs.
    pub fn placement(&self, ctx: &SimContext, slot: usize) -> Result<Placement, DeviceError> {
        let Some(set) = &ctx.engines else {
            if slot < self.engine_count {
                return Ok(Placement::Physical(slot));
            }
            return Err(DeviceError::InvalidEngine(format!("engine index {}", slot)));
        };

        match set.slots.get(slot) {
            Some(EngineSlot::Physical(e)) => Ok(Placement::Physical(*e)),
            Some(EngineSlot::Virtual) => {
                let mut siblings = Vec::new();
                let mut bonds = Vec::new();
                for ext in &set.extensions {
                    match ext {
                        EngineExtension::LoadBalance { slot: s, siblings: sib } if *s == slot => {
                            siblings = sib.clone();
                        }
                        EngineExtension::Bond { slot: s, master, siblings: sib } if *s == slot => {
                            bonds.push((*master, sib.clone()));
                        }
                        _ => {}
                    }
                }
                Ok(Placement::Balanced { siblings, bonds })
            }
            None => Err(DeviceError::InvalidEngine(format!("slot {} not in engine map", slot))),
        }
    }

    pub fn check_fence(&self, fence: &Fence) -> Result<(), DeviceError> {
        match *fence {
            Fence::Request(RequestId(id)) if id >= self.next_request => {
                Err(DeviceError::InvalidRequest(id))
            }
            Fence::Timeline { timeline, .. } if timeline.0 >= self.next_timeline => {
                Err(DeviceError::InvalidTimeline(timeline.0))
            }
            _ => Ok(()),
        }
    }

    /// Requests the new one must follow: the previous one on the same
    /// context and slot, plus read/write hazards on its buffers.
    pub fn ordering(&mut self, id: u64, ctx: ContextId, slot: usize, objects: &[BufferAccess]) -> SmallVec<[u64; 4]> {
        let mut after = SmallVec::new();

        if let Some(prev) = self.last_on_slot.insert((ctx.0, slot), id) {
            if self.requests.contains_key(&prev) {
                after.push(prev);
            }
        }

        for obj in objects {
            let hazard = self.hazards.entry(obj.handle.0).or_default();
            let requests = &self.requests;
            hazard.readers.retain(|r| requests.contains_key(r));
            if hazard.writer.is_some_and(|w| !requests.contains_key(&w)) {
                hazard.writer = None;
            }

            if let Some(writer) = hazard.writer {
                if writer != id && !after.contains(&writer) {
                    after.push(writer);
                }
            }
            if obj.write {
                for &reader in &hazard.readers {
                    if reader != id && !after.contains(&reader) {
                        after.push(reader);
                    }
                }
                hazard.readers.clear();
                hazard.writer = Some(id);
            } else {
                hazard.readers.push(id);
            }
        }

        after
    }

    pub fn forget_buffer(&mut self, handle: u32) {
        self.hazards.remove(&handle);
    }

    fn fence_signalled(&self, in_fence: &InFence) -> bool {
        match in_fence.fence {
            Fence::Request(RequestId(id)) => match self.requests.get(&id) {
                None => true,
                Some(producer) => in_fence.submit && producer.state != RequestState::Queued,
            },
            Fence::Timeline { timeline, seqno } => self
                .timelines
                .get(&timeline.0)
                .map_or(true, |&value| value >= seqno),
        }
    }

    fn is_ready(&self, request: &Request) -> bool {
        if let Some(fence) = &request.in_fence {
            if !self.fence_signalled(fence) {
                return false;
            }
        }
        request.after.iter().all(|id| !self.requests.contains_key(id))
    }

    fn can_run_on(request: &Request, engine: usize) -> bool {
        match request.state {
            RequestState::Running(_) => false,
            RequestState::Preempted(e) => e == engine,
            RequestState::Queued => match &request.placement {
                Placement::Physical(e) => *e == engine,
                Placement::Balanced { siblings, bonds } => {
                    let bonded = request
                        .producer_engine
                        .and_then(|m| bonds.iter().find(|(master, _)| *master == m));
                    match bonded {
                        Some((_, allowed)) => allowed.contains(&engine),
                        None => siblings.contains(&engine),
                    }
                }
            },
        }
    }

    /// Highest priority ready request for `engine`, oldest first within a priority.
    pub fn pick(&self, engine: usize) -> Option<u64> {
        let mut best: Option<(u64, i32)> = None;
        for (&id, request) in &self.requests {
            if !Self::can_run_on(request, engine) || !self.is_ready(request) {
                continue;
            }
            if best.map_or(true, |(_, prio)| request.priority > prio) {
                best = Some((id, request.priority));
            }
        }
        best.map(|(id, _)| id)
    }

    /// Whether something ready for `engine` outranks `priority`.
    pub fn has_higher_ready(&self, engine: usize, priority: i32) -> bool {
        self.requests.values().any(|r| {
            r.priority > priority && Self::can_run_on(r, engine) && self.is_ready(r)
        })
    }

    /// Mark `id` running on `engine` and hand out its interpreter state.
    pub fn start(&mut self, id: u64, engine: usize, now: u64) -> Option<Interpreter> {
        let request = self.requests.get_mut(&id)?;
        if request.state == RequestState::Queued {
            request.started_at = now;
        }
        request.state = RequestState::Running(engine);
        let interp = request.resume.take().unwrap_or_else(|| {
            Interpreter::new(request.program.clone(), request.target_ticks, request.generation)
        });

        // Submit-fenced dependents learn where their producer runs.
        for other in self.requests.values_mut() {
            if let Some(InFence { fence: Fence::Request(RequestId(p)), submit: true }) = other.in_fence {
                if p == id && other.producer_engine.is_none() {
                    other.producer_engine = Some(engine);
                }
            }
        }

        Some(interp)
    }

    pub fn preempt(&mut self, id: u64, engine: usize, interp: Interpreter) {
        if let Some(request) = self.requests.get_mut(&id) {
            request.state = RequestState::Preempted(engine);
            request.resume = Some(interp);
            self.stats.preemptions += 1;
        }
    }

    pub fn complete(&mut self, id: u64, engine: usize, now: u64) {
        if let Some(request) = self.requests.remove(&id) {
            self.stats.completions += 1;
            if self.history.len() == HISTORY_LEN {
                self.history.pop_front();
            }
            self.history.push_back(ExecRecord {
                request: RequestId(id),
                context: request.context,
                engine,
                start: request.started_at,
                end: now,
            });
        }
    }
}
