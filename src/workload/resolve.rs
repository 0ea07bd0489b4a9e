//! Dependency resolution and validation.
//!
//! Runs once over a freshly parsed (and possibly append-extended) step
//! list, before any device resource exists. It rejects dangling or
//! mistyped targets, annotates fence producers, resolves sync-wait targets
//! to concrete submit-work steps and checks the per-context engine
//! configuration order.

use std::collections::{HashMap, HashSet};

use crate::error::ValidationError;
use crate::parser::{DepTarget, Step, StepKind};

/// Validate `steps` and annotate them in place.
pub fn resolve(steps: &mut [Step]) -> Result<(), ValidationError> {
    let working_sets = collect_working_sets(steps)?;
    let mut fence_producers = Vec::new();

    for i in 0..steps.len() {
        let step = &steps[i];
        match &step.kind {
            StepKind::Submit(submit) => {
                for dep in &submit.data_deps {
                    match dep.target {
                        DepTarget::Step(target) => {
                            if target >= i || !steps[target].is_submit() {
                                return Err(ValidationError::DataTarget { step: i, target });
                            }
                        }
                        DepTarget::Buffer { set, slot } => {
                            let len = working_sets.get(&set).copied().unwrap_or(0);
                            if slot >= len {
                                return Err(ValidationError::WorkingSetSlot { step: i, id: set, slot });
                            }
                        }
                    }
                }

                if let Some(fence) = submit.fence_dep {
                    let target = fence.target;
                    let valid = target < i
                        && matches!(steps[target].kind, StepKind::Submit(_) | StepKind::FenceCreate);
                    if !valid {
                        return Err(ValidationError::FenceTarget { step: i, target });
                    }
                    if steps[target].is_submit() {
                        fence_producers.push(target);
                    }
                }

                if submit.wait && submit.duration.is_unbounded() {
                    log::warn!("step {}: waiting on unbounded work only returns once it is terminated", i);
                }
            }
            StepKind::FenceSignal { target } => {
                let target = *target;
                if target >= i || steps[target].kind != StepKind::FenceCreate {
                    return Err(ValidationError::SignalTarget { step: i, target });
                }
            }
            StepKind::Terminate { target } => {
                let target = *target;
                let unbounded = steps[target]
                    .as_submit()
                    .is_some_and(|s| s.duration.is_unbounded());
                if target >= i || !unbounded {
                    return Err(ValidationError::TerminateTarget { step: i, target });
                }
            }
            StepKind::SyncWait { target } => {
                let target = *target;
                let resolved = sync_target(steps, i, target)
                    .ok_or(ValidationError::SyncTarget { step: i, target })?;
                if resolved != target {
                    log::debug!("step {}: sync target {} resolved to submit step {}", i, target, resolved);
                }
                steps[i].kind = StepKind::SyncWait { target: resolved };
            }
            _ => {}
        }
    }

    for target in fence_producers {
        if let Some(submit) = steps[target].as_submit_mut() {
            submit.emit_fence = true;
        }
    }

    check_unterminated(steps);
    check_context_plans(steps)
}

/// Walk backward from `target` to the nearest submit-work step before
/// step `index`. There is no wrap past step 0.
fn sync_target(steps: &[Step], index: usize, target: usize) -> Option<usize> {
    if target >= index {
        return None;
    }
    (0..=target).rev().find(|&idx| steps[idx].is_submit())
}

/// Working set id -> number of buffers. Ids must be unique.
fn collect_working_sets(steps: &[Step]) -> Result<HashMap<u32, usize>, ValidationError> {
    let mut sets = HashMap::new();
    for step in steps {
        if let StepKind::WorkingSet(decl) = &step.kind {
            if sets.insert(decl.id, decl.sizes.len()).is_some() {
                return Err(ValidationError::DuplicateWorkingSet {
                    step: step.index,
                    id: decl.id,
                });
            }
        }
    }
    Ok(sets)
}

fn check_unterminated(steps: &[Step]) {
    let terminated: HashSet<usize> = steps
        .iter()
        .filter_map(|s| match s.kind {
            StepKind::Terminate { target } => Some(target),
            _ => None,
        })
        .collect();

    for step in steps {
        if step.as_submit().is_some_and(|s| s.duration.is_unbounded()) && !terminated.contains(&step.index) {
            log::warn!("step {}: unbounded work is never terminated", step.index);
        }
    }
}

/// Load balancing needs an earlier engine map for the same context, and
/// bonds need earlier load balancing.
fn check_context_plans(steps: &[Step]) -> Result<(), ValidationError> {
    let mut mapped = HashSet::new();
    let mut balanced = HashSet::new();

    for step in steps {
        let context = step.context;
        match step.kind {
            StepKind::EngineMap { .. } => {
                mapped.insert(context);
            }
            StepKind::LoadBalance => {
                if !mapped.contains(&context) {
                    return Err(ValidationError::LoadBalanceWithoutMap {
                        step: step.index,
                        context,
                    });
                }
                balanced.insert(context);
            }
            StepKind::Bond { .. } => {
                if !balanced.contains(&context) {
                    return Err(ValidationError::BondWithoutLoadBalance {
                        step: step.index,
                        context,
                    });
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Bake the arbitration period into every submit-work step: `default_us`
/// unless an earlier preemption step of the same context overrides it.
pub fn apply_preemption(steps: &mut [Step], default_us: u32) {
    let mut overrides: HashMap<u32, u32> = HashMap::new();
    for step in steps.iter_mut() {
        let context = step.context;
        match &mut step.kind {
            StepKind::Preemption { period_us } => {
                overrides.insert(context, *period_us);
            }
            StepKind::Submit(submit) => {
                submit.preempt_us = overrides.get(&context).copied().unwrap_or(default_us);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_steps;

    fn resolved(text: &str) -> Result<Vec<Step>, ValidationError> {
        let mut steps = parse_steps(text).unwrap();
        resolve(&mut steps).map(|_| steps)
    }

    #[test]
    fn test_fence_producer_marked() {
        let steps = resolved("0.RCS.10.0.0,0.BCS.10.f-1.0,0.VCS1.10.s-2.0").unwrap();
        assert!(steps[0].as_submit().unwrap().emit_fence);
        assert!(!steps[1].as_submit().unwrap().emit_fence);
    }

    #[test]
    fn test_fence_on_non_submit_rejected() {
        let err = resolved("d.10,0.RCS.10.f-1.0").unwrap_err();
        assert_eq!(err, ValidationError::FenceTarget { step: 1, target: 0 });
    }

    #[test]
    fn test_sw_fence_input_accepted() {
        let steps = resolved("f,0.RCS.10.f-1.0,a.-2").unwrap();
        assert_eq!(steps[2].kind, StepKind::FenceSignal { target: 0 });
    }

    #[test]
    fn test_signal_must_target_fence_create() {
        let err = resolved("0.RCS.10.0.0,a.-1").unwrap_err();
        assert_eq!(err, ValidationError::SignalTarget { step: 1, target: 0 });
    }

    #[test]
    fn test_data_dep_must_target_submit() {
        let err = resolved("d.5,0.RCS.10.-1.0").unwrap_err();
        assert_eq!(err, ValidationError::DataTarget { step: 1, target: 0 });
    }

    #[test]
    fn test_terminate_needs_unbounded_target() {
        assert!(resolved("0.RCS.*.0.0,T.-1").is_ok());
        let err = resolved("0.RCS.10.0.0,T.-1").unwrap_err();
        assert_eq!(err, ValidationError::TerminateTarget { step: 1, target: 0 });
    }

    #[test]
    fn test_duplicate_working_set() {
        let err = resolved("w.1.4k,W.1.8k").unwrap_err();
        assert_eq!(err, ValidationError::DuplicateWorkingSet { step: 1, id: 1 });
    }

    #[test]
    fn test_working_set_slots_checked() {
        assert!(resolved("w.1.2n4k,0.RCS.10.r1-0-1.0").is_ok());
        let err = resolved("w.1.2n4k,0.RCS.10.w1-2.0").unwrap_err();
        assert_eq!(err, ValidationError::WorkingSetSlot { step: 1, id: 1, slot: 2 });
        let err = resolved("0.RCS.10.r3-0.0").unwrap_err();
        assert_eq!(err, ValidationError::WorkingSetSlot { step: 0, id: 3, slot: 0 });
    }

    #[test]
    fn test_sync_walks_back_to_submit() {
        let steps = resolved("0.RCS.10.0.0,d.5,p.100,s.-1").unwrap();
        assert_eq!(steps[3].kind, StepKind::SyncWait { target: 0 });
    }

    #[test]
    fn test_sync_needs_earlier_submit() {
        let err = resolved("d.5,s.-1,0.RCS.10.0.0").unwrap_err();
        assert_eq!(err, ValidationError::SyncTarget { step: 1, target: 0 });
        assert!(resolved("d.5,s.-1").is_err());

        let steps = resolved("0.RCS.10.0.0,d.5,s.-1,0.RCS.10.0.0,s.-2").unwrap();
        assert_eq!(steps[2].kind, StepKind::SyncWait { target: 0 });
        assert_eq!(steps[4].kind, StepKind::SyncWait { target: 0 });
    }

    #[test]
    fn test_context_plan_order() {
        assert!(resolved("M.1.VCS1|VCS2,B.1,b.1.VCS2.VCS1").is_ok());
        assert_eq!(
            resolved("B.1").unwrap_err(),
            ValidationError::LoadBalanceWithoutMap { step: 0, context: 1 }
        );
        assert_eq!(
            resolved("M.1.VCS1|VCS2,b.1.VCS2.VCS1").unwrap_err(),
            ValidationError::BondWithoutLoadBalance { step: 1, context: 1 }
        );
        // Engine map on another context does not count
        assert!(resolved("M.2.VCS1,B.1").is_err());
    }

    #[test]
    fn test_preemption_baking() {
        let mut steps = parse_steps("1.RCS.10.0.0,X.1.500,1.RCS.10.0.0,2.RCS.10.0.0,X.1.0,1.RCS.10.0.0").unwrap();
        apply_preemption(&mut steps, 100);
        let periods: Vec<u32> = steps
            .iter()
            .filter_map(|s| s.as_submit().map(|s| s.preempt_us))
            .collect();
        assert_eq!(periods, [100, 500, 100, 0]);
    }
}
