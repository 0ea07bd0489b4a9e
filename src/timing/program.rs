//! Timed busy-wait programs.
//!
//! Every submit-work step owns one [`TimingProgram`]: a handful of ops that
//! sample the device clock, then poll until the elapsed tick count exceeds a
//! target read from the program's data area.
//!
//! ```text
//! bounded                          unbounded
//! 0: ts    r0                      0: ctl   r3
//! 1: tgt   r2                      1: jterm r3 -> 4
//! 2: ts    r1         <- poll      2: arb
//! 3: sub   r1, r1, r0              3: jmp   0
//! 4: jgt   r1, r2 -> 7             4: end
//! 5: arb
//! 6: jmp   2
//! 7: end
//! ```
//!
//! The target is patched before each submission so randomized durations do
//! not need a rebuilt program. Unbounded programs have no exit test; they
//! leave the loop only once a terminate step has written the sentinel.

use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Register index of the interpreter (four 64-bit registers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg(pub u8);

/// Program operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Sample the device timestamp counter.
    ReadTimestamp { dst: Reg },

    /// Load the target tick count from the data area.
    LoadTarget { dst: Reg },

    /// `dst = a - b`, wrapping.
    Sub { dst: Reg, a: Reg, b: Reg },

    /// Jump if `a > b`.
    JumpIfGreater { a: Reg, b: Reg, target: usize },

    /// Arbitration point; the engine may switch to other work here.
    Arbitrate,

    /// Load the control word from the data area.
    LoadControl { dst: Reg },

    /// Jump if the control word in `src` terminates this submission.
    JumpIfTerminated { src: Reg, target: usize },

    /// Unconditional jump.
    Jump { target: usize },

    /// End of program.
    End,
}

/// Live data area shared between the submitting client and the device.
#[derive(Debug, Default)]
pub struct ProgramData {
    /// Target duration in device ticks.
    target_ticks: AtomicU64,
    /// Generation of the most recent submission.
    armed: AtomicU64,
    /// Terminate sentinel: generation of the last terminated submission.
    terminated: AtomicU64,
}

/// A timed unit of work for one submit-work step.
#[derive(Debug)]
pub struct TimingProgram {
    ops: Vec<Op>,
    unbounded: bool,
    /// Minimum spacing of arbitration points in ticks (0 = never yield).
    arb_period_ticks: u64,
    data: ProgramData,
}

impl TimingProgram {
    /// Build a program that exits once the patched target has elapsed.
    pub fn bounded(arb_period_ticks: u64) -> Self {
        let (r0, r1, r2) = (Reg(0), Reg(1), Reg(2));
        let mut ops = vec![
            Op::ReadTimestamp { dst: r0 },
            Op::LoadTarget { dst: r2 },
            Op::ReadTimestamp { dst: r1 },
            Op::Sub { dst: r1, a: r1, b: r0 },
            Op::JumpIfGreater { a: r1, b: r2, target: 0 },
        ];
        if arb_period_ticks > 0 {
            ops.push(Op::Arbitrate);
        }
        ops.push(Op::Jump { target: 2 });
        let end = ops.len();
        ops.push(Op::End);
        if let Op::JumpIfGreater { target, .. } = &mut ops[4] {
            *target = end;
        }

        Self {
            ops,
            unbounded: false,
            arb_period_ticks,
            data: ProgramData::default(),
        }
    }

    /// Build a program that spins until terminated.
    pub fn unbounded(arb_period_ticks: u64) -> Self {
        let r3 = Reg(3);
        let mut ops = vec![
            Op::LoadControl { dst: r3 },
            Op::JumpIfTerminated { src: r3, target: 0 },
        ];
        if arb_period_ticks > 0 {
            ops.push(Op::Arbitrate);
        }
        ops.push(Op::Jump { target: 0 });
        let end = ops.len();
        ops.push(Op::End);
        if let Op::JumpIfTerminated { target, .. } = &mut ops[1] {
            *target = end;
        }

        Self {
            ops,
            unbounded: true,
            arb_period_ticks,
            data: ProgramData::default(),
        }
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_unbounded(&self) -> bool {
        self.unbounded
    }

    pub fn arb_period_ticks(&self) -> u64 {
        self.arb_period_ticks
    }

    /// Write the target tick count for the next submission.
    pub fn patch_target(&self, ticks: u64) {
        self.data.target_ticks.store(ticks, Ordering::Release);
    }

    pub fn target_ticks(&self) -> u64 {
        self.data.target_ticks.load(Ordering::Acquire)
    }

    /// Re-arm the loop for a new submission and return its generation.
    pub fn arm(&self) -> u64 {
        self.data.armed.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Generation of the most recent submission.
    pub fn generation(&self) -> u64 {
        self.data.armed.load(Ordering::Acquire)
    }

    /// Write the terminate sentinel for every submission armed so far.
    pub fn terminate(&self) {
        let generation = self.data.armed.load(Ordering::Acquire);
        self.data.terminated.store(generation, Ordering::Release);
        fence(Ordering::SeqCst);
    }

    /// Raw control word as seen by the device.
    pub fn control(&self) -> u64 {
        self.data.terminated.load(Ordering::Acquire)
    }

    /// Whether the latest submission has been told to stop.
    pub fn is_terminated(&self) -> bool {
        let armed = self.generation();
        armed > 0 && self.control() >= armed
    }
}
