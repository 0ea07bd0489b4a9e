//! Workload templates.
//!
//! A [`Workload`] is parsed and resolved once. Shared working sets are
//! allocated on the template, before any client clone exists; every client
//! later prepares its own copy of the steps with private resources.
//!
//! - [`resolve`] - Dependency validation and annotation
//! - [`working_set`] - Buffer groups referenced by steps

pub mod resolve;
pub mod working_set;

use rand::rngs::StdRng;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::device::Device;
use crate::error::Result;
use crate::parser::{parse_steps, Step, StepKind};

pub use resolve::{apply_preemption, resolve};
pub use working_set::{WorkingSet, WorkingSetBuffer};

/// A parsed, validated workload.
#[derive(Debug, Clone)]
pub struct Workload {
    steps: Vec<Step>,
    /// Context priority applied at prepare time.
    pub priority: i32,
    /// Restrict every context to a single slice.
    pub reduced_partition: bool,
    shared_sets: BTreeMap<u32, Arc<WorkingSet>>,
}

impl Workload {
    /// Parse and resolve a descriptor.
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_steps(parse_steps(text)?, &[])
    }

    /// Parse a descriptor and append already parsed steps after it.
    pub fn parse_with_append(text: &str, append: &[Step]) -> Result<Self> {
        Self::from_steps(parse_steps(text)?, append)
    }

    /// Concatenate `append` onto `steps`, renumbered to follow, and resolve.
    pub fn from_steps(mut steps: Vec<Step>, append: &[Step]) -> Result<Self> {
        let base = steps.len();
        steps.extend(append.iter().cloned().map(|mut step| {
            step.shift(base);
            step
        }));

        resolve(&mut steps)?;
        log::debug!("workload: {} steps ({} appended)", steps.len(), append.len());

        Ok(Self {
            steps,
            priority: 0,
            reduced_partition: false,
            shared_sets: BTreeMap::new(),
        })
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_reduced_partition(mut self, reduced: bool) -> Self {
        self.reduced_partition = reduced;
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether any period step exists (enables timing statistics).
    pub fn has_period(&self) -> bool {
        self.steps.iter().any(|s| matches!(s.kind, StepKind::Period { .. }))
    }

    /// Allocate every shared working set once.
    ///
    /// Idempotent: sets already allocated are left alone.
    pub fn allocate_shared(&mut self, device: &dyn Device, rng: &mut StdRng) -> Result<()> {
        for step in &self.steps {
            let StepKind::WorkingSet(decl) = &step.kind else {
                continue;
            };
            if !decl.shared || self.shared_sets.contains_key(&decl.id) {
                continue;
            }
            let set = WorkingSet::allocate(decl, device, rng)?;
            self.shared_sets.insert(decl.id, Arc::new(set));
        }
        Ok(())
    }

    pub fn shared_set(&self, id: u32) -> Option<&Arc<WorkingSet>> {
        self.shared_sets.get(&id)
    }

    /// Release shared working sets once no client holds them any more.
    pub fn release_shared(&mut self, device: &dyn Device) {
        for (id, set) in std::mem::take(&mut self.shared_sets) {
            match Arc::try_unwrap(set) {
                Ok(mut set) => set.release(device),
                Err(_) => log::warn!("shared working set {} still in use, not released", id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimConfig, SimDevice};
    use crate::error::WsimError;
    use rand::SeedableRng;

    #[test]
    fn test_append_renumbers() {
        let append = parse_steps("0.RCS.10.0.0,s.-1").unwrap();
        let wrk = Workload::parse_with_append("0.BCS.10.0.0,d.5", &append).unwrap();
        assert_eq!(wrk.len(), 4);
        for (pos, step) in wrk.steps().iter().enumerate() {
            assert_eq!(step.index, pos);
        }
        assert_eq!(wrk.steps()[3].kind, StepKind::SyncWait { target: 2 });

        let append = parse_steps("0.RCS.10.0.0,0.RCS.10.-1.0").unwrap();
        let wrk = Workload::parse_with_append("d.5", &append).unwrap();
        let dep = wrk.steps()[2].as_submit().unwrap().data_deps[0];
        assert_eq!(dep.target, crate::parser::DepTarget::Step(1));
    }

    #[test]
    fn test_append_dependency_is_validated() {
        let append = parse_steps("d.1,0.RCS.10.-1.0").unwrap();
        let err = Workload::parse_with_append("d.5", &append).unwrap_err();
        assert!(matches!(err, WsimError::Validation(_)));
    }

    #[test]
    fn test_parse_error_propagates() {
        let err = Workload::parse("0.RCS.10.0.0,0.RCS.bad.0.0").unwrap_err();
        match err {
            WsimError::Parse(e) => assert_eq!(e.step, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_shared_sets_allocated_once() {
        let device = SimDevice::new(SimConfig::with_engines(&["RCS"])).unwrap();
        let mut wrk = Workload::parse("W.1.2n4k,w.2.4k,0.RCS.10.r1-0/r2-0.0").unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        wrk.allocate_shared(&device, &mut rng).unwrap();
        wrk.allocate_shared(&device, &mut rng).unwrap();
        assert_eq!(device.stats().buffers_created, 2);
        assert!(wrk.shared_set(1).is_some());
        assert!(wrk.shared_set(2).is_none());

        wrk.release_shared(&device);
        assert_eq!(device.live_buffers(), 0);
    }
}
