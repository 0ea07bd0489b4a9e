//! Per-client run statistics and report lines.

use std::fmt;
use std::time::Duration;

/// Elapsed-time samples taken at period steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodStats {
    /// Sum of every sample, in microseconds.
    pub total_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub samples: u64,
    /// Period steps reached after their deadline.
    pub missed: u64,
}

impl Default for PeriodStats {
    fn default() -> Self {
        Self {
            total_us: 0,
            min_us: u64::MAX,
            max_us: 0,
            samples: 0,
            missed: 0,
        }
    }
}

impl PeriodStats {
    pub fn record(&mut self, elapsed_us: u64) {
        self.total_us += elapsed_us;
        self.min_us = self.min_us.min(elapsed_us);
        self.max_us = self.max_us.max(elapsed_us);
        self.samples += 1;
    }

    /// Average per iteration.
    pub fn average_us(&self, cycles: u64) -> u64 {
        if cycles == 0 {
            0
        } else {
            self.total_us / cycles
        }
    }
}

/// Outcome of one client's run.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStats {
    pub id: usize,
    pub background: bool,
    /// Completed iterations.
    pub cycles: u64,
    pub elapsed: Duration,
    /// Present when the workload has period steps.
    pub period: Option<PeriodStats>,
    /// Highest number of tracked requests seen on each engine queue right
    /// before a new submission, by engine name.
    pub max_outstanding: Vec<(String, usize)>,
}

impl ClientStats {
    pub fn workloads_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.cycles as f64 / secs
        } else {
            0.0
        }
    }

    pub fn max_outstanding_on(&self, engine: &str) -> Option<usize> {
        self.max_outstanding
            .iter()
            .find(|(name, _)| name == engine)
            .map(|&(_, n)| n)
    }
}

impl fmt::Display for ClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}: {:.3}s elapsed ({} cycles, {:.3} workloads/s).",
            if self.background { ' ' } else { '*' },
            self.id,
            self.elapsed.as_secs_f64(),
            self.cycles,
            self.workloads_per_sec()
        )?;
        if let Some(period) = self.period.filter(|p| p.samples > 0) {
            write!(
                f,
                " Time avg/min/max={}/{}/{}us; {} missed.",
                period.average_us(self.cycles),
                period.min_us,
                period.max_us,
                period.missed
            )?;
        }
        Ok(())
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub elapsed: Duration,
    pub repeat: u32,
    pub master: Option<usize>,
    pub clients: Vec<ClientStats>,
}

impl RunSummary {
    /// Nominal throughput: every client's repeat count over the wall time.
    pub fn workloads_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.clients.len() as f64 * f64::from(self.repeat)) / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3}s elapsed ({:.3} workloads/s)",
            self.elapsed.as_secs_f64(),
            self.workloads_per_sec()
        )
    }
}
