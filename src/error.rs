//! Error types for workload loading, validation and execution.
//!
//! Errors fall into four groups that match the lifecycle of a run:
//!
//! - [`ParseError`]: malformed descriptor text. Always names the step index.
//! - [`ValidationError`]: the text parsed, but the step list is inconsistent
//!   (dangling targets, duplicate working sets, unsupported combinations).
//!   Raised before any device resource exists.
//! - [`DeviceError`]: a collaborator call failed. Wrapped as
//!   [`WsimError::Resource`] during prepare and
//!   [`WsimError::RuntimeDevice`] once client threads are running.
//! - [`WsimError`]: umbrella type returned by the public entry points.

use thiserror::Error;

/// Descriptor syntax error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("parse error at step {step}: {kind}")]
pub struct ParseError {
    /// Index of the step being parsed.
    pub step: usize,
    /// What was wrong with it.
    pub kind: ParseErrorKind,
}

impl ParseError {
    pub fn new(step: usize, kind: ParseErrorKind) -> Self {
        Self { step, kind }
    }
}

/// The specific syntax problem behind a [`ParseError`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseErrorKind {
    #[error("empty step")]
    Empty,
    #[error("invalid context id '{0}'")]
    Context(String),
    #[error("invalid engine '{0}'")]
    Engine(String),
    #[error("invalid duration '{0}'")]
    Duration(String),
    #[error("invalid duration range '{0}'")]
    DurationRange(String),
    #[error("invalid dependency '{0}'")]
    Dependency(String),
    #[error("multiple fence inputs are not supported")]
    MultipleFences,
    #[error("invalid wait flag '{0}'")]
    WaitFlag(String),
    #[error("expected 3 to 5 fields for a submit step, found {0}")]
    FieldCount(usize),
    #[error("invalid {what} '{value}'")]
    Field { what: &'static str, value: String },
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("unexpected trailing field '{0}'")]
    Trailing(String),
    #[error("invalid engine map '{0}'")]
    EngineMap(String),
    #[error("invalid bond siblings '{0}'")]
    BondSiblings(String),
    #[error("invalid buffer size '{0}'")]
    BufferSize(String),
    #[error("relative target {offset} points before the first step")]
    TargetUnderflow { offset: i64 },
}

/// Structural problem in an otherwise well-formed workload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Fence input targets a step that is neither submit-work nor fence-create.
    #[error("invalid fence dependency target {target} at step {step}")]
    FenceTarget { step: usize, target: usize },

    /// Data dependency does not point at an earlier submit-work step.
    #[error("invalid data dependency target {target} at step {step}")]
    DataTarget { step: usize, target: usize },

    /// Fence-signal must name an earlier fence-create step.
    #[error("invalid sw fence target {target} at step {step}")]
    SignalTarget { step: usize, target: usize },

    /// Terminate must name an earlier unbounded submit-work step.
    #[error("invalid terminate target {target} at step {step}")]
    TerminateTarget { step: usize, target: usize },

    /// Sync-wait offset does not resolve to an earlier step.
    #[error("invalid sync target {target} at step {step}")]
    SyncTarget { step: usize, target: usize },

    #[error("duplicate working set id {id} at step {step}")]
    DuplicateWorkingSet { step: usize, id: u32 },

    /// A buffer dependency names a working set that is never declared,
    /// or a slot past the end of it.
    #[error("working set {id} slot {slot} referenced at step {step} does not exist")]
    WorkingSetSlot { step: usize, id: u32, slot: usize },

    #[error("load balancing needs an engine map (context {context}, step {step})")]
    LoadBalanceWithoutMap { step: usize, context: u32 },

    #[error("engine bonds need a load balancing engine map (context {context}, step {step})")]
    BondWithoutLoadBalance { step: usize, context: u32 },

    /// Engine name not present in the device topology.
    #[error("unknown engine '{engine}' at step {step}")]
    UnknownEngine { step: usize, engine: String },

    /// Engine not present in the context's engine map and no virtual engine to fall back on.
    #[error("engine '{engine}' at step {step} is not in the engine map of context {context}")]
    EngineNotInMap { step: usize, context: u32, engine: String },

    #[error("device does not support load balancing (context {context})")]
    LoadBalanceUnsupported { context: u32 },
}

/// Failure reported by a device collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("invalid buffer handle {0}")]
    InvalidBuffer(u32),
    #[error("buffer access out of range: handle {handle}, offset {offset}, len {len}")]
    BufferRange { handle: u32, offset: u64, len: usize },
    #[error("invalid context {0}")]
    InvalidContext(u32),
    #[error("invalid address space {0}")]
    InvalidVm(u32),
    #[error("invalid request {0}")]
    InvalidRequest(u64),
    #[error("invalid timeline {0}")]
    InvalidTimeline(u32),
    #[error("invalid engine selection: {0}")]
    InvalidEngine(String),
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(u64),
    #[error("device lost")]
    Lost,
}

/// Top-level error for loading, preparing and running workloads.
#[derive(Debug, Error)]
pub enum WsimError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Device setup failed before any client thread started.
    #[error("resource error: {what}: {source}")]
    Resource {
        what: String,
        #[source]
        source: DeviceError,
    },

    /// A submission or wait failed in a running client.
    #[error("client {client}: device error at step {step}: {source}")]
    RuntimeDevice {
        client: usize,
        step: usize,
        #[source]
        source: DeviceError,
    },

    /// Descriptor file could not be read.
    #[error("failed to load workload descriptor '{path}': {source}")]
    Load {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid combination of run options.
    #[error("{0}")]
    Options(String),

    #[error("failed to start client {client}: {source}")]
    Spawn {
        client: usize,
        #[source]
        source: std::io::Error,
    },

    /// A client thread panicked.
    #[error("client {0} thread panicked")]
    ClientPanic(usize),
}

impl WsimError {
    pub(crate) fn resource(what: impl Into<String>, source: DeviceError) -> Self {
        Self::Resource {
            what: what.into(),
            source,
        }
    }
}

pub type Result<T, E = WsimError> = std::result::Result<T, E>;
