//! Parsed workload representation.
//!
//! A workload compiles to an ordered list of [`Step`]s. Each step carries
//! one [`StepKind`] payload; submit-work steps carry the richest payload
//! ([`SubmitStep`]) with timing, engine and dependency information.
//!
//! All step references are absolute indices into the step list. The parser
//! converts relative offsets (`-2`) as soon as it reads them and rejects any
//! that would land before the first step.

use smallvec::SmallVec;
use std::fmt;

/// Engine name as written in a descriptor, normalized to upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineName(String);

impl EngineName {
    /// Reserved name for the context's default engine.
    pub const DEFAULT: &'static str = "DEFAULT";

    /// Parse an engine identifier (`[A-Za-z][A-Za-z0-9_]*`, case-insensitive).
    pub fn parse(text: &str) -> Option<Self> {
        let mut chars = text.chars();
        let first = chars.next()?;
        if !first.is_ascii_alphabetic() {
            return None;
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        Some(Self(text.to_ascii_uppercase()))
    }

    /// The `DEFAULT` engine.
    pub fn default_engine() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    pub fn is_default(&self) -> bool {
        self.0 == Self::DEFAULT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Duration of a submit-work step, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationSpec {
    /// Always the same length.
    Fixed(u32),
    /// Drawn uniformly from `[min, max]` for every submission.
    Range { min: u32, max: u32 },
    /// Runs until a terminate step writes the sentinel.
    Unbounded,
}

impl DurationSpec {
    /// Inclusive bounds, or `None` for unbounded work.
    pub fn bounds(&self) -> Option<(u32, u32)> {
        match *self {
            DurationSpec::Fixed(us) => Some((us, us)),
            DurationSpec::Range { min, max } => Some((min, max)),
            DurationSpec::Unbounded => None,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, DurationSpec::Unbounded)
    }
}

/// What a data dependency points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepTarget {
    /// Output buffer of an earlier submit-work step.
    Step(usize),
    /// One buffer of a working set.
    Buffer { set: u32, slot: usize },
}

/// A data dependency of a submit-work step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDep {
    pub target: DepTarget,
    /// Whether the step writes the buffer (reads otherwise).
    pub write: bool,
}

/// Fence input of a submit-work step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceDep {
    /// Absolute index of the producing step.
    pub target: usize,
    /// Submit fence: wait for the producer to start rather than complete.
    pub submit: bool,
}

/// Payload of a submit-work step.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitStep {
    pub engine: EngineName,
    pub duration: DurationSpec,
    pub data_deps: SmallVec<[DataDep; 4]>,
    pub fence_dep: Option<FenceDep>,
    /// Block on completion right after submitting.
    pub wait: bool,
    /// Set by the resolver when a later step takes this one as fence input.
    pub emit_fence: bool,
    /// Arbitration period baked into the timing program at prepare time.
    pub preempt_us: u32,
}

/// Buffer size bounds in bytes; equal bounds mean a fixed size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSize {
    pub min: u64,
    pub max: u64,
}

/// A `w`/`W` working-set declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingSetDecl {
    pub id: u32,
    pub shared: bool,
    pub sizes: Vec<BufferSize>,
}

/// Partition (slice mask) requested by a partition-change step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionMask {
    /// Restore the device's full default mask.
    DeviceDefault,
    Slices(u64),
}

/// Step payload, one variant per step type.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Submit(SubmitStep),
    SyncWait { target: usize },
    Delay { us: u32 },
    Period { us: u32 },
    SubmitThrottle { depth: u32 },
    QueueDepthThrottle { depth: u32 },
    FenceCreate,
    FenceSignal { target: usize },
    Priority { priority: i32 },
    Preemption { period_us: u32 },
    EngineMap { engines: Vec<EngineName> },
    LoadBalance,
    Bond { siblings: Vec<EngineName>, master: EngineName },
    Terminate { target: usize },
    Partition { mask: PartitionMask },
    WorkingSet(WorkingSetDecl),
}

/// One instruction of a workload.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Position in the final step list.
    pub index: usize,
    /// Context id; 0 for steps that do not name one.
    pub context: u32,
    pub kind: StepKind,
}

impl Step {
    pub fn is_submit(&self) -> bool {
        matches!(self.kind, StepKind::Submit(_))
    }

    pub fn as_submit(&self) -> Option<&SubmitStep> {
        match &self.kind {
            StepKind::Submit(submit) => Some(submit),
            _ => None,
        }
    }

    pub fn as_submit_mut(&mut self) -> Option<&mut SubmitStep> {
        match &mut self.kind {
            StepKind::Submit(submit) => Some(submit),
            _ => None,
        }
    }

    /// Short type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            StepKind::Submit(_) => "submit",
            StepKind::SyncWait { .. } => "sync",
            StepKind::Delay { .. } => "delay",
            StepKind::Period { .. } => "period",
            StepKind::SubmitThrottle { .. } => "throttle",
            StepKind::QueueDepthThrottle { .. } => "qd-throttle",
            StepKind::FenceCreate => "sw-fence",
            StepKind::FenceSignal { .. } => "sw-fence-signal",
            StepKind::Priority { .. } => "priority",
            StepKind::Preemption { .. } => "preemption",
            StepKind::EngineMap { .. } => "engine-map",
            StepKind::LoadBalance => "load-balance",
            StepKind::Bond { .. } => "bond",
            StepKind::Terminate { .. } => "terminate",
            StepKind::Partition { .. } => "partition",
            StepKind::WorkingSet(_) => "working-set",
        }
    }

    /// Move this step `by` positions later, together with every step it references.
    ///
    /// Used when a workload is appended after another one.
    pub(crate) fn shift(&mut self, by: usize) {
        self.index += by;
        match &mut self.kind {
            StepKind::Submit(submit) => {
                for dep in submit.data_deps.iter_mut() {
                    if let DepTarget::Step(target) = &mut dep.target {
                        *target += by;
                    }
                }
                if let Some(fence) = &mut submit.fence_dep {
                    fence.target += by;
                }
            }
            StepKind::SyncWait { target }
            | StepKind::FenceSignal { target }
            | StepKind::Terminate { target } => *target += by,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_name_normalizes_case() {
        let name = EngineName::parse("vcs1").unwrap();
        assert_eq!(name.as_str(), "VCS1");
        assert!(EngineName::parse("default").unwrap().is_default());
    }

    #[test]
    fn test_engine_name_rejects_garbage() {
        assert!(EngineName::parse("").is_none());
        assert!(EngineName::parse("1RCS").is_none());
        assert!(EngineName::parse("RC-S").is_none());
    }

    #[test]
    fn test_duration_bounds() {
        assert_eq!(DurationSpec::Fixed(5).bounds(), Some((5, 5)));
        assert_eq!(DurationSpec::Range { min: 1, max: 9 }.bounds(), Some((1, 9)));
        assert!(DurationSpec::Unbounded.bounds().is_none());
    }

    #[test]
    fn test_shift_moves_references() {
        let mut step = Step {
            index: 1,
            context: 0,
            kind: StepKind::Submit(SubmitStep {
                engine: EngineName::default_engine(),
                duration: DurationSpec::Fixed(10),
                data_deps: smallvec::smallvec![
                    DataDep { target: DepTarget::Step(0), write: false },
                    DataDep { target: DepTarget::Buffer { set: 1, slot: 2 }, write: true },
                ],
                fence_dep: Some(FenceDep { target: 0, submit: false }),
                wait: false,
                emit_fence: false,
                preempt_us: 0,
            }),
        };
        step.shift(3);
        assert_eq!(step.index, 4);
        let submit = step.as_submit().unwrap();
        assert_eq!(submit.data_deps[0].target, DepTarget::Step(3));
        assert_eq!(submit.data_deps[1].target, DepTarget::Buffer { set: 1, slot: 2 });
        assert_eq!(submit.fence_dep.unwrap().target, 3);
    }
}
