use std::collections::HashMap;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Outcome of a finished team or worker call.
#[derive(Clone, Debug, PartialEq)]
pub struct CallOutcome {
    pub ok: bool,
    pub output: String,
}

#[derive(Clone, Debug)]
enum CallState {
    InFlight,
    Done(CallOutcome),
}

/// Result of attempting to reserve an execution slot.
#[derive(Clone, Debug, PartialEq)]
pub enum Reservation {
    /// First caller; the slot is now in flight and the caller must
    /// complete it.
    Reserved,
    /// Another caller holds the slot and has not finished yet.
    Pending,
    /// Already executed; the recorded outcome is returned instead of
    /// running again.
    Done(CallOutcome),
}

#[derive(Default)]
struct Inner {
    teams: HashMap<String, CallState>,
    workers: HashMap<String, CallState>,
    /// Successful team outcomes in completion order.
    completed: Vec<(String, String)>,
    /// Executed team calls keyed by team name. A cached repeat does
    /// not count; a re-invokable team counts once per execution.
    team_calls: HashMap<String, u32>,
    total_calls: u32,
    teams_completed: u32,
    teams_failed: u32,
    workers_invoked: u32,
}

/// Per-run execution ledger. Teams are keyed by name; workers by
/// (team, worker, task) so the same worker may run distinct tasks.
/// Every dispatch is recorded here whether or not duplicate
/// suppression is enabled.
#[derive(Default)]
pub struct ExecutionTracker {
    inner: Mutex<Inner>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key for a worker call. The task text is hashed so distinct tasks
    /// to the same worker occupy distinct slots.
    pub fn worker_key(team: &str, worker: &str, task: &str) -> String {
        let digest = Sha256::digest(task.as_bytes());
        let mut hash = String::with_capacity(16);
        for byte in &digest[..8] {
            hash.push_str(&format!("{byte:02x}"));
        }
        format!("{team}::{worker}::{hash}")
    }

    pub fn reserve_team(&self, team: &str) -> Reservation {
        let mut inner = self.inner.lock();
        match inner.teams.get(team) {
            Some(CallState::InFlight) => Reservation::Pending,
            Some(CallState::Done(outcome)) => Reservation::Done(outcome.clone()),
            None => {
                inner.teams.insert(team.to_string(), CallState::InFlight);
                Reservation::Reserved
            }
        }
    }

    pub fn complete_team(&self, team: &str, ok: bool, output: impl Into<String>) {
        let output = output.into();
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        *inner.team_calls.entry(team.to_string()).or_insert(0) += 1;
        if ok {
            inner.teams_completed += 1;
            inner.completed.push((team.to_string(), output.clone()));
        } else {
            inner.teams_failed += 1;
        }
        inner
            .teams
            .insert(team.to_string(), CallState::Done(CallOutcome { ok, output }));
    }

    pub fn reserve_worker(&self, key: &str) -> Reservation {
        let mut inner = self.inner.lock();
        match inner.workers.get(key) {
            Some(CallState::InFlight) => Reservation::Pending,
            Some(CallState::Done(outcome)) => Reservation::Done(outcome.clone()),
            None => {
                inner.workers.insert(key.to_string(), CallState::InFlight);
                inner.workers_invoked += 1;
                Reservation::Reserved
            }
        }
    }

    pub fn complete_worker(&self, key: &str, ok: bool, output: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.workers.insert(
            key.to_string(),
            CallState::Done(CallOutcome { ok, output: output.into() }),
        );
    }

    /// Successful team results in the order they finished. Feeds the
    /// shared-context block for later dispatches.
    pub fn completed_team_results(&self) -> Vec<(String, String)> {
        self.inner.lock().completed.clone()
    }

    /// Names of teams that have finished, with their success flag.
    pub fn executed_teams(&self) -> Vec<(String, bool)> {
        let inner = self.inner.lock();
        inner
            .teams
            .iter()
            .filter_map(|(name, state)| match state {
                CallState::Done(outcome) => Some((name.clone(), outcome.ok)),
                CallState::InFlight => None,
            })
            .collect()
    }

    pub fn counts(&self) -> (u32, u32, u32) {
        let inner = self.inner.lock();
        (inner.teams_completed, inner.teams_failed, inner.workers_invoked)
    }

    /// Total executed team calls and the per-team tally.
    pub fn call_stats(&self) -> (u32, HashMap<String, u32>) {
        let inner = self.inner.lock();
        (inner.total_calls, inner.team_calls.clone())
    }
}
