//! Workload descriptor parsing
//!
//! - [`grammar`] - Descriptor text to [`Step`] list
//! - [`step`] - Parsed step representation
//! - [`size`] - Buffer size tokens for working sets
//! - [`descriptor`] - Inline or file-sourced descriptor text

pub mod descriptor;
pub mod grammar;
pub mod size;
pub mod step;

pub use descriptor::load_descriptor;
pub use grammar::parse_steps;
pub use step::{
    BufferSize, DataDep, DepTarget, DurationSpec, EngineName, FenceDep, PartitionMask, Step,
    StepKind, SubmitStep, WorkingSetDecl,
};
