//! Timing synthesis
//!
//! - [`program`] - Timed busy-wait programs with a patchable data area
//! - [`interp`] - Interpreter and device clock used by the simulated engines

pub mod interp;
pub mod program;

pub use interp::{DeviceClock, ExecuteResult, Interpreter};
pub use program::{Op, TimingProgram};

/// Convert microseconds to device ticks, rounding up.
pub fn us_to_ticks(us: u64, freq_hz: u64) -> u64 {
    let ticks = (us as u128 * freq_hz as u128).div_ceil(1_000_000);
    ticks.min(u64::MAX as u128) as u64
}

/// Build the program for a step: bounded unless `unbounded`, with
/// arbitration points every `preempt_us`.
pub fn build_program(unbounded: bool, preempt_us: u32, freq_hz: u64) -> TimingProgram {
    let arb = us_to_ticks(preempt_us as u64, freq_hz);
    if unbounded {
        TimingProgram::unbounded(arb)
    } else {
        TimingProgram::bounded(arb)
    }
}
