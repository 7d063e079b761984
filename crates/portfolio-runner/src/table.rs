use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::process::Child;
use std::time::{Duration, Instant};

use serde::Serialize;

pub type SlotId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Launching,
    Running,
    Completed,
    Killed,
    Failed,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerState::Completed | WorkerState::Killed | WorkerState::Failed
        )
    }

    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    fn can_become(self, next: WorkerState) -> bool {
        match (self, next) {
            (WorkerState::Launching, WorkerState::Running) => true,
            (WorkerState::Launching | WorkerState::Running, to) => to.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Launching => "launching",
            WorkerState::Running => "running",
            WorkerState::Completed => "completed",
            WorkerState::Killed => "killed",
            WorkerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Worker {
    pub slot: SlotId,
    pub generation: u32,
    pub pid: u32,
    pub configuration: String,
    pub feature_file: PathBuf,
    pub launched_at: Instant,
    pub acked_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub exit_code: Option<i32>,
    pub state: WorkerState,
    pub(crate) supervisor: Option<Child>,
}

impl Worker {
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.finished_at
            .unwrap_or(now)
            .saturating_duration_since(self.launched_at)
    }

    pub fn view(&self) -> WorkerView {
        WorkerView {
            slot: self.slot,
            generation: self.generation,
            pid: self.pid,
            configuration: self.configuration.clone(),
            feature_file: self.feature_file.clone(),
            launched_at: self.launched_at,
            state: self.state,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerView {
    pub slot: SlotId,
    pub generation: u32,
    pub pid: u32,
    pub configuration: String,
    pub feature_file: PathBuf,
    pub launched_at: Instant,
    pub state: WorkerState,
}

#[derive(Debug, Clone, Default)]
pub struct TableSnapshot {
    pub taken_at: Option<Instant>,
    pub workers: Vec<WorkerView>,
}

impl TableSnapshot {
    pub fn live_count(&self) -> usize {
        self.workers.iter().filter(|w| w.state.is_live()).count()
    }

    pub fn running(&self) -> impl Iterator<Item = &WorkerView> {
        self.workers
            .iter()
            .filter(|w| w.state == WorkerState::Running)
    }
}

/// A state change applied to a slot. `None` stands for an empty slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub slot: SlotId,
    pub generation: u32,
    pub from: Option<WorkerState>,
    pub to: Option<WorkerState>,
}

#[derive(Debug)]
pub struct GlobalCounters {
    pub active_workers: usize,
    pub total_launches: u64,
    pub launch_attempts: u64,
    pub kills: u64,
    pub pool_started: Instant,
}

impl GlobalCounters {
    pub fn new() -> Self {
        Self {
            active_workers: 0,
            total_launches: 0,
            launch_attempts: 0,
            kills: 0,
            pool_started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.pool_started.elapsed()
    }
}

impl Default for GlobalCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct WorkerTable {
    size: u32,
    workers: BTreeMap<SlotId, Worker>,
    retired: BTreeSet<SlotId>,
}

impl WorkerTable {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            workers: BTreeMap::new(),
            retired: BTreeSet::new(),
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn get(&self, slot: SlotId) -> Option<&Worker> {
        self.workers.get(&slot)
    }

    pub(crate) fn get_mut(&mut self, slot: SlotId) -> Option<&mut Worker> {
        self.workers.get_mut(&slot)
    }

    pub fn state(&self, slot: SlotId) -> Option<WorkerState> {
        self.workers.get(&slot).map(|w| w.state)
    }

    pub fn insert(&mut self, worker: Worker) -> Result<Transition, Worker> {
        if worker.slot >= self.size || self.retired.contains(&worker.slot) {
            return Err(worker);
        }
        let from = self.state(worker.slot);
        if from.is_some_and(WorkerState::is_live) {
            return Err(worker);
        }
        let transition = Transition {
            slot: worker.slot,
            generation: worker.generation,
            from,
            to: Some(worker.state),
        };
        self.workers.insert(worker.slot, worker);
        Ok(transition)
    }

    pub fn transition(&mut self, slot: SlotId, to: WorkerState) -> Option<Transition> {
        let worker = self.workers.get_mut(&slot)?;
        if !worker.state.can_become(to) {
            return None;
        }
        let from = worker.state;
        worker.state = to;
        if to.is_terminal() {
            worker.finished_at.get_or_insert_with(Instant::now);
        }
        Some(Transition {
            slot,
            generation: worker.generation,
            from: Some(from),
            to: Some(to),
        })
    }

    pub fn vacate(&mut self, slot: SlotId) -> Option<(Worker, Transition)> {
        if self.state(slot).is_some_and(WorkerState::is_live) {
            return None;
        }
        let worker = self.workers.remove(&slot)?;
        let transition = Transition {
            slot,
            generation: worker.generation,
            from: Some(worker.state),
            to: None,
        };
        Some((worker, transition))
    }

    pub fn retire(&mut self, slot: SlotId) {
        self.retired.insert(slot);
    }

    pub fn is_retired(&self, slot: SlotId) -> bool {
        self.retired.contains(&slot)
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    pub fn slots_needing_launch(&self) -> Vec<SlotId> {
        (0..self.size)
            .filter(|slot| !self.retired.contains(slot))
            .filter(|slot| match self.workers.get(slot) {
                Some(w) => w.state.is_terminal(),
                None => true,
            })
            .collect()
    }

    pub fn slots_in(&self, state: WorkerState) -> Vec<SlotId> {
        self.workers
            .values()
            .filter(|w| w.state == state)
            .map(|w| w.slot)
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.workers.values().filter(|w| w.state.is_live()).count()
    }

    pub fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            taken_at: Some(Instant::now()),
            workers: self.workers.values().map(Worker::view).collect(),
        }
    }

    pub(crate) fn live_workers_mut(&mut self) -> impl Iterator<Item = &mut Worker> {
        self.workers.values_mut().filter(|w| w.state.is_live())
    }
}

#[cfg(test)]
pub(crate) fn test_worker(slot: SlotId, generation: u32) -> Worker {
    Worker {
        slot,
        generation,
        pid: 0,
        configuration: format!("cfg-{slot}-{generation}"),
        feature_file: PathBuf::from(format!("train.csv.{slot}.{generation}")),
        launched_at: Instant::now(),
        acked_at: Some(Instant::now()),
        finished_at: None,
        exit_code: None,
        state: WorkerState::Launching,
        supervisor: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_refuses_second_live_worker_in_slot() {
        let mut table = WorkerTable::new(4);
        table.insert(test_worker(1, 0)).expect("first insert");
        let rejected = table.insert(test_worker(1, 1)).expect_err("slot is occupied");
        assert_eq!(rejected.generation, 1);
        assert_eq!(table.get(1).map(|w| w.generation), Some(0));
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn terminal_worker_is_replaced_by_relaunch() {
        let mut table = WorkerTable::new(2);
        table.insert(test_worker(0, 0)).expect("insert");
        table.transition(0, WorkerState::Running).expect("promote");
        table.transition(0, WorkerState::Killed).expect("kill");
        assert_eq!(table.slots_needing_launch(), vec![0, 1]);

        let t = table.insert(test_worker(0, 5)).expect("relaunch");
        assert_eq!(t.from, Some(WorkerState::Killed));
        assert_eq!(t.to, Some(WorkerState::Launching));
        assert_eq!(table.slots_needing_launch(), vec![1]);
    }

    #[test]
    fn illegal_transitions_are_ignored() {
        let mut table = WorkerTable::new(1);
        table.insert(test_worker(0, 0)).expect("insert");
        table.transition(0, WorkerState::Completed).expect("complete");
        assert!(table.transition(0, WorkerState::Running).is_none());
        assert!(table.transition(0, WorkerState::Killed).is_none());
        assert_eq!(table.state(0), Some(WorkerState::Completed));
        assert!(table.get(0).and_then(|w| w.finished_at).is_some());
    }

    #[test]
    fn vacate_only_frees_finished_slots() {
        let mut table = WorkerTable::new(1);
        table.insert(test_worker(0, 0)).expect("insert");
        assert!(table.vacate(0).is_none());
        table.transition(0, WorkerState::Failed).expect("fail");
        let (_, t) = table.vacate(0).expect("vacate");
        assert_eq!(t.to, None);
        assert!(table.get(0).is_none());
    }

    #[test]
    fn retired_slots_are_never_relaunched() {
        let mut table = WorkerTable::new(3);
        table.retire(2);
        assert_eq!(table.slots_needing_launch(), vec![0, 1]);
        assert!(table.insert(test_worker(2, 0)).is_err());
        assert!(table.insert(test_worker(7, 0)).is_err());
    }

    #[test]
    fn snapshot_is_detached_from_table() {
        let mut table = WorkerTable::new(2);
        table.insert(test_worker(0, 0)).expect("insert");
        table.transition(0, WorkerState::Running).expect("promote");
        let snapshot = table.snapshot();
        table.transition(0, WorkerState::Killed).expect("kill");
        assert_eq!(snapshot.running().count(), 1);
        assert_eq!(snapshot.live_count(), 1);
        assert_eq!(table.live_count(), 0);
    }
}
