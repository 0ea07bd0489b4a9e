//! Device collaborator interface.
//!
//! The workload core never talks to hardware directly. Everything it needs
//! goes through the [`Device`] trait:
//!
//! - capability queries (engine topology, timestamp frequency, partitions)
//! - buffer allocation and host access
//! - execution contexts with get/set parameters
//! - non-blocking submission with optional in/out fences
//! - blocking completion waits
//! - software timelines for fences signalled from the host
//!
//! [`sim::SimDevice`] implements the trait in-process, with one worker
//! thread per engine executing [`TimingProgram`]s against a device clock.
//!
//! # Example
//!
//! ```
//! use wsim::device::{open_device, Device};
//!
//! let device = open_device("sim").unwrap();
//! let engines = device.engines().unwrap();
//! assert!(!engines.is_empty());
//! ```

pub mod caps;
pub mod sim;

use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::error::DeviceError;
use crate::timing::TimingProgram;

pub use caps::DeviceCaps;
pub use sim::{SimConfig, SimDevice};

/// Buffer object handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u32);

/// Execution context handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

/// Address space shared by one or more contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmId(pub u32);

/// Submitted unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Software timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimelineId(pub u32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// One physical engine of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInfo {
    /// Instance name, e.g. `VCS2`.
    pub name: String,
    /// Class name shared by all instances, e.g. `VCS`.
    pub class: String,
    /// Zero-based instance within the class.
    pub instance: u16,
}

impl EngineInfo {
    /// Derive class and instance from a name: trailing digits are the
    /// one-based instance number.
    pub fn from_name(name: &str) -> Self {
        let name = name.to_ascii_uppercase();
        let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        let (class, number) = name.split_at(name.len() - digits);
        let instance = match number.parse::<u16>() {
            Ok(n) if n > 0 && !class.is_empty() => n - 1,
            _ => 0,
        };
        let class = if class.is_empty() { name.as_str() } else { class };
        Self {
            class: class.to_string(),
            instance,
            name: name.clone(),
        }
    }
}

/// A fence a submission can wait on or produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fence {
    /// Signalled when the request completes (or starts, for submit fences).
    Request(RequestId),
    /// Signalled when the timeline reaches `seqno`.
    Timeline { timeline: TimelineId, seqno: u64 },
}

/// Fence input of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFence {
    pub fence: Fence,
    /// Wait for the producer to start executing rather than complete.
    pub submit: bool,
}

/// Buffer referenced by a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAccess {
    pub handle: BufferHandle,
    pub write: bool,
}

/// Slot of a context engine map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineSlot {
    /// Index into the device engine list.
    Physical(usize),
    /// Placeholder filled by a load-balancing extension.
    Virtual,
}

/// Extension applied to an engine map, in chain order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineExtension {
    /// Turn `slot` into a virtual engine balanced over `siblings`.
    LoadBalance { slot: usize, siblings: Vec<usize> },
    /// Work on `slot` fenced to something that ran on `master` may only use `siblings`.
    Bond {
        slot: usize,
        master: usize,
        siblings: Vec<usize>,
    },
}

/// Engine map of a context.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineSet {
    pub slots: Vec<EngineSlot>,
    pub extensions: Vec<EngineExtension>,
}

/// Context parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextParam {
    Priority(i32),
    /// Whether outstanding work survives closing the context.
    Persistence(bool),
    Engines(EngineSet),
    /// Slice mask the context's work may use.
    Sseu { slice_mask: u64 },
}

/// Selector for [`Device::get_param`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Priority,
    Persistence,
    Engines,
    Sseu,
}

/// Work handed to [`Device::submit`].
#[derive(Debug, Clone)]
pub struct Submission {
    pub context: ContextId,
    /// Engine map slot, or device engine index when the context has no map.
    pub engine: usize,
    pub program: Arc<TimingProgram>,
    pub objects: SmallVec<[BufferAccess; 4]>,
    pub in_fence: Option<InFence>,
    pub want_out_fence: bool,
}

/// Result of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub request: RequestId,
    pub out_fence: Option<Fence>,
}

/// Device collaborator used by the workload core.
///
/// Every call is non-blocking except [`Device::wait`].
pub trait Device: Send + Sync {
    /// Physical engines, in device order.
    fn engines(&self) -> Result<Vec<EngineInfo>, DeviceError>;

    /// Timestamp counter frequency in Hz.
    fn timestamp_frequency(&self) -> Result<u64, DeviceError>;

    /// Full slice mask.
    fn default_slice_mask(&self) -> Result<u64, DeviceError>;

    /// Whether load-balanced virtual engines are available.
    fn supports_load_balance(&self) -> Result<bool, DeviceError>;

    fn create_buffer(&self, size: u64) -> Result<BufferHandle, DeviceError>;
    fn write_buffer(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<(), DeviceError>;
    fn read_buffer(&self, handle: BufferHandle, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError>;
    fn destroy_buffer(&self, handle: BufferHandle) -> Result<(), DeviceError>;

    /// Create a context, in a fresh address space unless `vm` is given.
    fn create_context(&self, vm: Option<VmId>) -> Result<ContextId, DeviceError>;
    fn context_vm(&self, ctx: ContextId) -> Result<VmId, DeviceError>;
    fn set_param(&self, ctx: ContextId, param: ContextParam) -> Result<(), DeviceError>;
    fn get_param(&self, ctx: ContextId, kind: ParamKind) -> Result<ContextParam, DeviceError>;
    fn destroy_context(&self, ctx: ContextId) -> Result<(), DeviceError>;

    /// Queue work. Never blocks on the work itself.
    fn submit(&self, submission: Submission) -> Result<Submitted, DeviceError>;

    /// Block until the request has retired.
    fn wait(&self, request: RequestId) -> Result<(), DeviceError>;

    /// Whether the request is still queued or executing.
    fn is_busy(&self, request: RequestId) -> Result<bool, DeviceError>;

    fn create_timeline(&self) -> Result<TimelineId, DeviceError>;

    /// Fence signalled once the timeline reaches `seqno`.
    fn timeline_fence(&self, timeline: TimelineId, seqno: u64) -> Result<Fence, DeviceError>;

    /// Advance the timeline by `by`, returning the new value.
    fn advance_timeline(&self, timeline: TimelineId, by: u64) -> Result<u64, DeviceError>;

    fn timeline_value(&self, timeline: TimelineId) -> Result<u64, DeviceError>;

    /// Destroy the timeline. Fences still pending on it count as signalled.
    fn destroy_timeline(&self, timeline: TimelineId) -> Result<(), DeviceError>;
}

/// Open a device by name.
///
/// Only the in-process `sim` backend is built in.
pub fn open_device(name: &str) -> Result<Arc<dyn Device>, DeviceError> {
    match name {
        "sim" => {
            let config = SimConfig::from_config(Config::get());
            Ok(Arc::new(SimDevice::new(config)?))
        }
        other => Err(DeviceError::Unsupported(format!("device '{}'", other))),
    }
}
