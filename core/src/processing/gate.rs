//! Global single-flight gate for processing runs.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use tokio_util::sync::CancellationToken;

use super::RunId;

#[derive(Debug, Default)]
enum GateState {
    #[default]
    Idle,
    Running {
        run_id: RunId,
        cancel: CancellationToken,
    },
}

/// Holds at most one active run. The Idle to Running transition happens
/// under a single lock so two triggers can never both win.
#[derive(Debug, Default)]
pub struct RunGate {
    state: Mutex<GateState>,
}

impl RunGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the gate for `run_id`, or report the run already holding it.
    pub fn try_acquire(self: &Arc<Self>, run_id: RunId) -> Result<RunPermit, RunId> {
        let mut state = self.state();
        if let GateState::Running { run_id: active, .. } = &*state {
            return Err(active.clone());
        }
        let cancel = CancellationToken::new();
        *state = GateState::Running {
            run_id: run_id.clone(),
            cancel: cancel.clone(),
        };
        Ok(RunPermit {
            gate: Arc::clone(self),
            run_id,
            cancel,
        })
    }

    pub fn active(&self) -> Option<RunId> {
        match &*self.state() {
            GateState::Idle => None,
            GateState::Running { run_id, .. } => Some(run_id.clone()),
        }
    }

    /// Signal the active run to stop. Returns `false` if `run_id` is not the
    /// active run.
    pub fn cancel(&self, run_id: &str) -> bool {
        match &*self.state() {
            GateState::Running {
                run_id: active,
                cancel,
            } if active == run_id => {
                cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

/// Proof of holding the gate. Dropping it returns the gate to idle.
#[derive(Debug)]
pub struct RunPermit {
    gate: Arc<RunGate>,
    run_id: RunId,
    cancel: CancellationToken,
}

impl RunPermit {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        let mut state = self.gate.state();
        if matches!(&*state, GateState::Running { run_id, .. } if *run_id == self.run_id) {
            *state = GateState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn second_acquire_reports_active_run() {
        let gate = RunGate::new();
        let permit = gate.try_acquire("a".to_string()).unwrap();
        assert_eq!(gate.try_acquire("b".to_string()).unwrap_err(), "a");
        assert_eq!(gate.active().as_deref(), Some("a"));
        drop(permit);
        assert_eq!(gate.active(), None);
        assert!(gate.try_acquire("b".to_string()).is_ok());
    }

    #[test]
    fn cancel_targets_only_the_active_run() {
        let gate = RunGate::new();
        let permit = gate.try_acquire("a".to_string()).unwrap();
        assert!(!gate.cancel("b"));
        assert!(!permit.cancellation().is_cancelled());
        assert!(gate.cancel("a"));
        assert!(permit.cancellation().is_cancelled());
    }

    #[test]
    fn concurrent_acquires_admit_one() {
        let gate = RunGate::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || gate.try_acquire(format!("run-{i}")).ok())
            })
            .collect();
        let permits: Vec<RunPermit> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 1);
    }
}
