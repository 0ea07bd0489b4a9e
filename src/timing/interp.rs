//! Timing program interpreter.
//!
//! Executes a [`TimingProgram`] against a [`DeviceClock`]. Poll loops do not
//! spin a host core: on every backward jump the interpreter sleeps for the
//! remaining time seen by the last exit test, capped at [`MAX_POLL_SLEEP`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::program::{Op, Reg, TimingProgram};

/// Sleep used by poll loops with no exit test (unbounded programs).
pub const POLL_INTERVAL: Duration = Duration::from_micros(20);

/// Upper bound on a single poll sleep.
pub const MAX_POLL_SLEEP: Duration = Duration::from_micros(200);

/// Monotonic device timestamp counter.
#[derive(Debug, Clone, Copy)]
pub struct DeviceClock {
    origin: Instant,
    freq_hz: u64,
}

impl DeviceClock {
    pub fn new(freq_hz: u64) -> Self {
        Self {
            origin: Instant::now(),
            freq_hz: freq_hz.max(1),
        }
    }

    pub fn frequency(&self) -> u64 {
        self.freq_hz
    }

    /// Current counter value.
    pub fn now_ticks(&self) -> u64 {
        let ns = self.origin.elapsed().as_nanos();
        (ns * self.freq_hz as u128 / 1_000_000_000) as u64
    }

    /// Wall-clock length of `ticks` counter increments.
    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        let ns = ticks as u128 * 1_000_000_000 / self.freq_hz as u128;
        Duration::from_nanos(ns.min(u64::MAX as u128) as u64)
    }
}

/// Outcome of executing one op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteResult {
    /// Continue with the next op.
    Continue,

    /// Backward jump taken; the caller may sleep up to `hint`.
    Poll { hint: Duration },

    /// Arbitration point reached after a full preemption period.
    Arbitrate,

    /// Program finished.
    Halt,
}

/// Execution state of one submission.
///
/// Kept across preemption so a unit resumes where it stopped.
#[derive(Debug)]
pub struct Interpreter {
    program: Arc<TimingProgram>,
    regs: [u64; 4],
    pc: usize,
    /// Target ticks captured at submission.
    target_ticks: u64,
    generation: u64,
    last_arb: u64,
    started: bool,
    /// Remaining ticks observed at the last exit test.
    poll_hint: Option<u64>,
}

impl Interpreter {
    pub fn new(program: Arc<TimingProgram>, target_ticks: u64, generation: u64) -> Self {
        Self {
            program,
            regs: [0; 4],
            pc: 0,
            target_ticks,
            generation,
            last_arb: 0,
            started: false,
            poll_hint: None,
        }
    }

    pub fn program(&self) -> &Arc<TimingProgram> {
        &self.program
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    fn reg(&self, reg: Reg) -> u64 {
        self.regs[reg.0 as usize]
    }

    fn set(&mut self, reg: Reg, value: u64) {
        self.regs[reg.0 as usize] = value;
    }

    /// Execute a single op.
    pub fn step(&mut self, clock: &DeviceClock) -> ExecuteResult {
        if !self.started {
            self.started = true;
            self.last_arb = clock.now_ticks();
        }

        let Some(&op) = self.program.ops().get(self.pc) else {
            return ExecuteResult::Halt;
        };

        let mut next = self.pc + 1;
        let mut result = ExecuteResult::Continue;

        match op {
            Op::ReadTimestamp { dst } => self.set(dst, clock.now_ticks()),
            Op::LoadTarget { dst } => self.set(dst, self.target_ticks),
            Op::Sub { dst, a, b } => self.set(dst, self.reg(a).wrapping_sub(self.reg(b))),
            Op::JumpIfGreater { a, b, target } => {
                let (a, b) = (self.reg(a), self.reg(b));
                if a > b {
                    next = target;
                } else {
                    self.poll_hint = Some(b - a);
                }
            }
            Op::Arbitrate => {
                let now = clock.now_ticks();
                if now.saturating_sub(self.last_arb) >= self.program.arb_period_ticks() {
                    self.last_arb = now;
                    result = ExecuteResult::Arbitrate;
                }
            }
            Op::LoadControl { dst } => self.set(dst, self.program.control()),
            Op::JumpIfTerminated { src, target } => {
                if self.reg(src) >= self.generation {
                    next = target;
                }
            }
            Op::Jump { target } => {
                if target <= self.pc {
                    let mut hint = self
                        .poll_hint
                        .take()
                        .map(|ticks| clock.ticks_to_duration(ticks))
                        .unwrap_or(POLL_INTERVAL)
                        .min(MAX_POLL_SLEEP);
                    let arb = self.program.arb_period_ticks();
                    if arb > 0 {
                        hint = hint.min(clock.ticks_to_duration(arb));
                    }
                    result = ExecuteResult::Poll { hint };
                }
                next = target;
            }
            Op::End => return ExecuteResult::Halt,
        }

        self.pc = next;
        result
    }

    /// Run until the program halts or reaches an arbitration point.
    ///
    /// Returns [`ExecuteResult::Halt`] early when `abort` is raised.
    pub fn run(&mut self, clock: &DeviceClock, abort: &AtomicBool) -> ExecuteResult {
        loop {
            match self.step(clock) {
                ExecuteResult::Continue => {}
                ExecuteResult::Poll { hint } => {
                    if abort.load(Ordering::Relaxed) {
                        return ExecuteResult::Halt;
                    }
                    if !hint.is_zero() {
                        std::thread::sleep(hint);
                    }
                }
                other => return other,
            }
        }
    }
}
