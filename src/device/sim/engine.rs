//! Engine worker threads.
//!
//! Each physical engine runs one worker. A worker picks the best ready
//! request for its engine, runs its timing program until it halts or hits
//! an arbitration point, and at arbitration points gives the engine up to
//! higher priority work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use super::state::Inner;
use crate::timing::{DeviceClock, ExecuteResult};

pub(super) struct Shared {
    pub inner: Mutex<Inner>,
    pub cond: Condvar,
    pub clock: DeviceClock,
    pub shutdown: AtomicBool,
}

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait<'a>(&self, guard: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify(&self) {
        self.cond.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Worker loop for physical engine `engine`.
pub(super) fn run_engine(engine: usize, shared: &Shared) {
    log::debug!("engine {} worker started", engine);

    loop {
        let mut guard = shared.lock();
        let (id, mut interp) = loop {
            if shared.is_shutdown() {
                log::debug!("engine {} worker stopped", engine);
                return;
            }
            if let Some(id) = guard.pick(engine) {
                let now = shared.clock.now_ticks();
                if let Some(interp) = guard.start(id, engine, now) {
                    break (id, interp);
                }
            }
            guard = shared.wait(guard);
        };
        shared.notify();
        drop(guard);

        log::trace!("engine {} running request {}", engine, id);

        loop {
            let result = interp.run(&shared.clock, &shared.shutdown);
            let mut guard = shared.lock();

            if result == ExecuteResult::Arbitrate {
                let priority = guard.requests.get(&id).map_or(i32::MIN, |r| r.priority);
                if !guard.has_higher_ready(engine, priority) {
                    continue;
                }
                log::trace!("engine {} preempting request {}", engine, id);
                guard.preempt(id, engine, interp);
            } else {
                guard.complete(id, engine, shared.clock.now_ticks());
            }
            shared.notify();
            break;
        }
    }
}
