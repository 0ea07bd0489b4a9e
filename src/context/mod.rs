//! Context and engine configuration.
//!
//! Every context id named by a context-bearing step becomes one device
//! context per client. The whole plan (engine maps, load balancing, bonds,
//! per-step engine slots) is resolved against the device topology first;
//! only then are contexts created and configured, in this order:
//!
//! 1. create, sharing the address space of the first context created
//! 2. priority, then non-persistence
//! 3. engine map, with the load-balancing extension first and bonds after
//!    it in reverse declaration order
//! 4. single-slice partition when the workload asks for one

use std::collections::{BTreeMap, BTreeSet};

use crate::device::{
    ContextId, ContextParam, Device, DeviceCaps, EngineExtension, EngineSet, EngineSlot,
};
use crate::error::{DeviceError, Result, ValidationError, WsimError};
use crate::parser::{EngineName, PartitionMask, Step, StepKind};

/// Slice mask used for the reduced partition.
pub const REDUCED_SLICE_MASK: u64 = 1;

/// Engine bond resolved to device engine indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondPlan {
    pub master: usize,
    pub siblings: Vec<usize>,
}

/// Resolved configuration of one workload context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextPlan {
    pub id: u32,
    /// Device engine indices of the map entries, class names expanded.
    pub engine_map: Option<Vec<usize>>,
    pub load_balance: bool,
    pub bonds: Vec<BondPlan>,
}

impl ContextPlan {
    /// Engine set as handed to the device.
    pub fn engine_set(&self) -> Option<EngineSet> {
        let map = self.engine_map.as_ref()?;
        let mut slots = Vec::with_capacity(map.len() + 1);
        let mut extensions = Vec::new();

        if self.load_balance {
            slots.push(EngineSlot::Virtual);
            extensions.push(EngineExtension::LoadBalance {
                slot: 0,
                siblings: map.clone(),
            });
            for bond in self.bonds.iter().rev() {
                extensions.push(EngineExtension::Bond {
                    slot: 0,
                    master: bond.master,
                    siblings: bond.siblings.clone(),
                });
            }
        }
        slots.extend(map.iter().map(|&e| EngineSlot::Physical(e)));

        Some(EngineSet { slots, extensions })
    }

    /// Engine slot a submit-work step on this context uses.
    fn slot_for(&self, step: usize, engine: &EngineName, caps: &DeviceCaps) -> Result<usize> {
        let unknown = || ValidationError::UnknownEngine {
            step,
            engine: engine.to_string(),
        };

        let Some(map) = &self.engine_map else {
            if engine.is_default() {
                return Ok(0);
            }
            let resolved = caps.resolve(engine.as_str()).map_err(probe_error)?;
            let first = *resolved.first().ok_or_else(unknown)?;
            if resolved.len() > 1 {
                log::debug!("step {}: {} without engine map runs on instance {}", step, engine, first);
            }
            return Ok(first);
        };

        let base = usize::from(self.load_balance);
        if engine.is_default() {
            return Ok(0);
        }

        let resolved = caps.resolve(engine.as_str()).map_err(probe_error)?;
        if resolved.is_empty() {
            return Err(unknown().into());
        }
        if let [single] = resolved.as_slice() {
            if let Some(pos) = map.iter().position(|e| e == single) {
                return Ok(base + pos);
            }
        }
        if self.load_balance {
            return Ok(0);
        }
        Err(ValidationError::EngineNotInMap {
            step,
            context: self.id,
            engine: engine.to_string(),
        }
        .into())
    }
}

fn probe_error(source: DeviceError) -> WsimError {
    WsimError::resource("engine topology query", source)
}

/// Whether a step configures or uses its context.
fn names_context(step: &Step) -> bool {
    matches!(
        step.kind,
        StepKind::Submit(_)
            | StepKind::Priority { .. }
            | StepKind::Preemption { .. }
            | StepKind::EngineMap { .. }
            | StepKind::LoadBalance
            | StepKind::Bond { .. }
            | StepKind::Partition { .. }
    )
}

/// Resolve engine names into per-context plans.
pub fn plan_contexts(steps: &[Step], caps: &DeviceCaps) -> Result<BTreeMap<u32, ContextPlan>> {
    let ids: BTreeSet<u32> = steps.iter().filter(|s| names_context(s)).map(|s| s.context).collect();
    let mut plans: BTreeMap<u32, ContextPlan> = ids
        .into_iter()
        .map(|id| (id, ContextPlan { id, ..Default::default() }))
        .collect();

    for step in steps {
        let Some(plan) = plans.get_mut(&step.context) else {
            continue;
        };
        match &step.kind {
            StepKind::EngineMap { engines } => {
                let mut map = Vec::new();
                for engine in engines {
                    let resolved = caps.resolve(engine.as_str()).map_err(probe_error)?;
                    if resolved.is_empty() {
                        return Err(ValidationError::UnknownEngine {
                            step: step.index,
                            engine: engine.to_string(),
                        }
                        .into());
                    }
                    for e in resolved {
                        if !map.contains(&e) {
                            map.push(e);
                        }
                    }
                }
                plan.engine_map = Some(map);
            }
            StepKind::LoadBalance => {
                if !caps.supports_load_balance().map_err(probe_error)? {
                    return Err(ValidationError::LoadBalanceUnsupported { context: step.context }.into());
                }
                plan.load_balance = true;
            }
            StepKind::Bond { siblings, master } => {
                let master_idx = match caps.resolve(master.as_str()).map_err(probe_error)?.as_slice() {
                    [single] => *single,
                    _ => {
                        return Err(ValidationError::UnknownEngine {
                            step: step.index,
                            engine: master.to_string(),
                        }
                        .into())
                    }
                };
                let map = plan.engine_map.as_deref().unwrap_or_default();
                let mut resolved = Vec::new();
                for sibling in siblings {
                    let engines = caps.resolve(sibling.as_str()).map_err(probe_error)?;
                    if engines.is_empty() || !engines.iter().all(|e| map.contains(e)) {
                        return Err(ValidationError::EngineNotInMap {
                            step: step.index,
                            context: step.context,
                            engine: sibling.to_string(),
                        }
                        .into());
                    }
                    resolved.extend(engines);
                }
                plan.bonds.push(BondPlan {
                    master: master_idx,
                    siblings: resolved,
                });
            }
            _ => {}
        }
    }

    Ok(plans)
}

/// Context plans of a step list plus the engine slot of every
/// submit-work step. Built from capability queries alone, so a workload
/// can be checked before any device resource exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextLayout {
    pub plans: BTreeMap<u32, ContextPlan>,
    /// Engine slot by step index.
    pub slots: Vec<Option<usize>>,
}

impl ContextLayout {
    pub fn plan(steps: &[Step], caps: &DeviceCaps) -> Result<Self> {
        let plans = plan_contexts(steps, caps)?;

        let mut slots = vec![None; steps.len()];
        for step in steps {
            if let (Some(submit), Some(plan)) = (step.as_submit(), plans.get(&step.context)) {
                slots[step.index] = Some(plan.slot_for(step.index, &submit.engine, caps)?);
            }
        }
        Ok(Self { plans, slots })
    }
}

/// A configured device context with its cached runtime parameters.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub plan: ContextPlan,
    pub handle: ContextId,
    /// Last priority applied.
    pub priority: i32,
    /// Last slice mask applied.
    pub slice_mask: u64,
}

/// All contexts of one client.
#[derive(Debug, Default)]
pub struct ContextSet {
    contexts: BTreeMap<u32, ClientContext>,
    /// Engine slot of every submit-work step, by step index.
    slots: Vec<Option<usize>>,
    /// Device slice mask restored by a default partition change.
    default_mask: u64,
}

impl ContextSet {
    /// Plan, create and configure the contexts `steps` use.
    pub fn configure(
        steps: &[Step],
        caps: &DeviceCaps,
        priority: i32,
        reduced_partition: bool,
    ) -> Result<Self> {
        let ContextLayout { plans, slots } = ContextLayout::plan(steps, caps)?;

        let device = caps.device().clone();
        let default_mask = caps.default_slice_mask().map_err(probe_error)?;
        let mut set = Self {
            contexts: BTreeMap::new(),
            slots,
            default_mask,
        };

        let mut shared_vm = None;
        for (id, plan) in plans {
            match create_context(device.as_ref(), &plan, shared_vm, priority, reduced_partition, default_mask) {
                Ok(ctx) => {
                    if shared_vm.is_none() {
                        shared_vm = Some(
                            device
                                .context_vm(ctx.handle)
                                .map_err(|e| WsimError::resource(format!("context {} vm", id), e))?,
                        );
                    }
                    set.contexts.insert(id, ctx);
                }
                Err(e) => {
                    set.destroy(device.as_ref());
                    return Err(e);
                }
            }
        }

        Ok(set)
    }

    pub fn get(&self, id: u32) -> Option<&ClientContext> {
        self.contexts.get(&id)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientContext> {
        self.contexts.values()
    }

    /// Engine slot resolved for submit-work step `index`.
    pub fn engine_slot(&self, index: usize) -> Option<usize> {
        self.slots.get(index).copied().flatten()
    }

    /// Apply a priority change unless it matches the cached value.
    ///
    /// Returns whether the device was touched.
    pub fn set_priority(&mut self, device: &dyn Device, id: u32, priority: i32) -> Result<bool, DeviceError> {
        let ctx = self.contexts.get_mut(&id).ok_or(DeviceError::InvalidContext(id))?;
        if ctx.priority == priority {
            return Ok(false);
        }
        device.set_param(ctx.handle, ContextParam::Priority(priority))?;
        ctx.priority = priority;
        Ok(true)
    }

    /// Apply a partition change unless it matches the cached mask.
    pub fn set_partition(&mut self, device: &dyn Device, id: u32, mask: PartitionMask) -> Result<bool, DeviceError> {
        let slice_mask = match mask {
            PartitionMask::DeviceDefault => self.default_mask,
            PartitionMask::Slices(mask) => mask,
        };
        let ctx = self.contexts.get_mut(&id).ok_or(DeviceError::InvalidContext(id))?;
        if ctx.slice_mask == slice_mask {
            return Ok(false);
        }
        device.set_param(ctx.handle, ContextParam::Sseu { slice_mask })?;
        ctx.slice_mask = slice_mask;
        Ok(true)
    }

    /// Destroy every context. Failures are logged.
    pub fn destroy(&mut self, device: &dyn Device) {
        for (id, ctx) in std::mem::take(&mut self.contexts) {
            if let Err(e) = device.destroy_context(ctx.handle) {
                log::warn!("failed to destroy context {}: {}", id, e);
            }
        }
    }
}

fn create_context(
    device: &dyn Device,
    plan: &ContextPlan,
    vm: Option<crate::device::VmId>,
    priority: i32,
    reduced_partition: bool,
    default_mask: u64,
) -> Result<ClientContext> {
    let what = |op: &str| format!("context {} {}", plan.id, op);

    let handle = device
        .create_context(vm)
        .map_err(|e| WsimError::resource(what("create"), e))?;

    let mut ctx = ClientContext {
        plan: plan.clone(),
        handle,
        priority,
        slice_mask: default_mask,
    };

    let configured = (|| -> Result<()> {
        device
            .set_param(handle, ContextParam::Priority(priority))
            .map_err(|e| WsimError::resource(what("priority"), e))?;
        device
            .set_param(handle, ContextParam::Persistence(false))
            .map_err(|e| WsimError::resource(what("persistence"), e))?;

        if let Some(engines) = plan.engine_set() {
            log::debug!("context {}: engines {:?}", plan.id, engines);
            device
                .set_param(handle, ContextParam::Engines(engines))
                .map_err(|e| WsimError::resource(what("engine map"), e))?;
        }

        if reduced_partition {
            device
                .set_param(handle, ContextParam::Sseu { slice_mask: REDUCED_SLICE_MASK })
                .map_err(|e| WsimError::resource(what("partition"), e))?;
            ctx.slice_mask = REDUCED_SLICE_MASK;
        }
        Ok(())
    })();

    match configured {
        Ok(()) => Ok(ctx),
        Err(e) => {
            if let Err(destroy) = device.destroy_context(handle) {
                log::warn!("failed to destroy context {}: {}", plan.id, destroy);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ParamKind, SimConfig, SimDevice};
    use crate::workload::Workload;
    use std::sync::Arc;

    fn setup(engines: &[&str]) -> (Arc<SimDevice>, DeviceCaps) {
        let sim = Arc::new(SimDevice::new(SimConfig::with_engines(engines)).unwrap());
        let caps = DeviceCaps::new(sim.clone());
        (sim, caps)
    }

    #[test]
    fn test_contexts_share_vm() {
        let (sim, caps) = setup(&["RCS", "BCS"]);
        let wrk = Workload::parse("1.RCS.10.0.0,2.BCS.10.0.0,1.d.5").unwrap();
        let mut set = ContextSet::configure(wrk.steps(), &caps, 3, false).unwrap();
        assert_eq!(set.len(), 2);

        let a = set.get(1).unwrap().handle;
        let b = set.get(2).unwrap().handle;
        assert_eq!(sim.context_vm(a).unwrap(), sim.context_vm(b).unwrap());
        assert_eq!(sim.get_param(a, ParamKind::Priority).unwrap(), ContextParam::Priority(3));
        assert_eq!(sim.get_param(b, ParamKind::Persistence).unwrap(), ContextParam::Persistence(false));

        set.destroy(sim.as_ref());
        assert_eq!(sim.live_contexts(), 0);
    }

    #[test]
    fn test_engine_slots_without_map() {
        let (_sim, caps) = setup(&["RCS", "BCS", "VCS1", "VCS2"]);
        let wrk = Workload::parse("0.DEFAULT.1.0.0,0.BCS.1.0.0,0.VCS2.1.0.0,0.VCS.1.0.0").unwrap();
        let set = ContextSet::configure(wrk.steps(), &caps, 0, false).unwrap();
        let slots: Vec<_> = (0..4).map(|i| set.engine_slot(i).unwrap()).collect();
        assert_eq!(slots, [0, 1, 3, 2]);
    }

    #[test]
    fn test_layout_touches_no_device_state() {
        let (sim, caps) = setup(&["RCS", "VCS1", "VCS2"]);
        let wrk = Workload::parse("M.1.VCS,B.1,1.VCS2.10.0.0,0.RCS.10.0.0").unwrap();
        let layout = ContextLayout::plan(wrk.steps(), &caps).unwrap();
        assert_eq!(layout.plans.len(), 2);
        assert_eq!(layout.slots, [None, None, Some(2), Some(0)]);
        assert_eq!(sim.stats().contexts_created, 0);
        assert_eq!(sim.stats().buffers_created, 0);
    }

    #[test]
    fn test_unknown_engine_rejected() {
        let (sim, caps) = setup(&["RCS"]);
        let wrk = Workload::parse("0.XCS.1.0.0").unwrap();
        let err = ContextSet::configure(wrk.steps(), &caps, 0, false).unwrap_err();
        assert!(matches!(err, WsimError::Validation(ValidationError::UnknownEngine { step: 0, .. })));
        assert_eq!(sim.stats().contexts_created, 0);
    }

    #[test]
    fn test_balanced_map_with_class_expansion() {
        let (sim, caps) = setup(&["RCS", "VCS1", "VCS2"]);
        let wrk = Workload::parse("M.1.VCS,B.1,b.1.VCS2.RCS,1.DEFAULT.1.0.0,1.VCS2.1.0.0,1.RCS.1.0.0").unwrap();
        let set = ContextSet::configure(wrk.steps(), &caps, 0, false).unwrap();

        let ctx = set.get(1).unwrap();
        assert_eq!(ctx.plan.engine_map, Some(vec![1, 2]));
        assert_eq!(ctx.plan.bonds, vec![BondPlan { master: 0, siblings: vec![2] }]);

        // DEFAULT goes to the virtual slot, VCS2 to its own slot, RCS is
        // outside the map and falls back to the virtual engine.
        assert_eq!(set.engine_slot(3), Some(0));
        assert_eq!(set.engine_slot(4), Some(2));
        assert_eq!(set.engine_slot(5), Some(0));

        match sim.get_param(ctx.handle, ParamKind::Engines).unwrap() {
            ContextParam::Engines(engines) => {
                assert_eq!(engines.slots[0], EngineSlot::Virtual);
                assert!(matches!(engines.extensions[0], EngineExtension::LoadBalance { .. }));
                assert!(matches!(engines.extensions[1], EngineExtension::Bond { master: 0, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bonds_chained_in_reverse() {
        let plan = ContextPlan {
            id: 0,
            engine_map: Some(vec![1, 2]),
            load_balance: true,
            bonds: vec![
                BondPlan { master: 0, siblings: vec![1] },
                BondPlan { master: 3, siblings: vec![2] },
            ],
        };
        let set = plan.engine_set().unwrap();
        assert_eq!(set.slots.len(), 3);
        assert!(matches!(set.extensions[1], EngineExtension::Bond { master: 3, .. }));
        assert!(matches!(set.extensions[2], EngineExtension::Bond { master: 0, .. }));
    }

    #[test]
    fn test_engine_not_in_plain_map() {
        let (_sim, caps) = setup(&["RCS", "BCS"]);
        let wrk = Workload::parse("M.0.RCS,0.BCS.1.0.0").unwrap();
        let err = ContextSet::configure(wrk.steps(), &caps, 0, false).unwrap_err();
        assert!(matches!(err, WsimError::Validation(ValidationError::EngineNotInMap { .. })));
    }

    #[test]
    fn test_bond_sibling_outside_map() {
        let (_sim, caps) = setup(&["RCS", "VCS1", "VCS2"]);
        let wrk = Workload::parse("M.1.VCS1,B.1,b.1.VCS2.RCS").unwrap();
        assert!(ContextSet::configure(wrk.steps(), &caps, 0, false).is_err());
    }

    #[test]
    fn test_partition_cache() {
        let (sim, caps) = setup(&["RCS"]);
        let wrk = Workload::parse("0.RCS.1.0.0").unwrap();
        let mut set = ContextSet::configure(wrk.steps(), &caps, 0, true).unwrap();
        assert_eq!(set.get(0).unwrap().slice_mask, REDUCED_SLICE_MASK);

        assert!(!set.set_partition(sim.as_ref(), 0, PartitionMask::Slices(1)).unwrap());
        assert!(set.set_partition(sim.as_ref(), 0, PartitionMask::DeviceDefault).unwrap());
        assert!(!set.set_partition(sim.as_ref(), 0, PartitionMask::DeviceDefault).unwrap());

        assert!(!set.set_priority(sim.as_ref(), 0, 0).unwrap());
        assert!(set.set_priority(sim.as_ref(), 0, -7).unwrap());
    }

    #[test]
    fn test_load_balance_unsupported() {
        let mut config = SimConfig::with_engines(&["VCS1", "VCS2"]);
        config.load_balance = false;
        let sim = Arc::new(SimDevice::new(config).unwrap());
        let caps = DeviceCaps::new(sim);
        let wrk = Workload::parse("M.1.VCS,B.1").unwrap();
        let err = ContextSet::configure(wrk.steps(), &caps, 0, false).unwrap_err();
        assert!(matches!(
            err,
            WsimError::Validation(ValidationError::LoadBalanceUnsupported { context: 1 })
        ));
    }
}
