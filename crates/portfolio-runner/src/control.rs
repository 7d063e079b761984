use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::channel::HandshakeChannels;
use crate::error::{PoolError, PoolResult, SamplerError};
use crate::launcher::Launcher;
use crate::prune::PruningPolicy;
use crate::sampler::ConfigSampler;
use crate::supervisor::restore_sigchld;
use crate::table::{GlobalCounters, SlotId, Transition, WorkerState, WorkerTable};

const WAIT_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub size: u32,
    pub epoch: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Epoch,
    Completion,
    Interrupt,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub completed: Vec<SlotId>,
    pub failed: Vec<SlotId>,
    pub killed: Vec<SlotId>,
    pub relaunched: Vec<SlotId>,
    pub launch_errors: Vec<SlotId>,
    pub retired: Vec<SlotId>,
    pub transitions: Vec<Transition>,
    pub first_success: Option<SlotId>,
    pub active_after: usize,
}

impl TickReport {
    fn new(tick: u64) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    pub fn path_of(&self, slot: SlotId) -> Vec<Option<WorkerState>> {
        let mut path = Vec::new();
        for t in self.transitions.iter().filter(|t| t.slot == slot) {
            if path.is_empty() {
                path.push(t.from);
            }
            path.push(t.to);
        }
        path
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Solved {
        slot: SlotId,
        generation: u32,
        configuration: String,
        exit_code: i32,
        solver_secs: f64,
    },
    Interrupted,
    /// Every slot ran out of replayed configurations.
    Exhausted,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolReport {
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub ticks: u64,
    pub total_launches: u64,
    pub launch_attempts: u64,
    pub kills: u64,
}

pub struct Orchestrator {
    options: PoolOptions,
    launcher: Launcher,
    sampler: ConfigSampler,
    policy: Option<PruningPolicy>,
    channels: Option<HandshakeChannels>,
    table: WorkerTable,
    counters: GlobalCounters,
    shutdown: Arc<AtomicBool>,
    /// Configurations whose launch failed, reused on the retry.
    unlaunched: BTreeMap<SlotId, String>,
    ticks: u64,
    outcome: Option<Outcome>,
    started_at: DateTime<Utc>,
}

impl Orchestrator {
    pub fn new(
        options: PoolOptions,
        launcher: Launcher,
        sampler: ConfigSampler,
        policy: Option<PruningPolicy>,
        shutdown: Arc<AtomicBool>,
    ) -> PoolResult<Self> {
        if options.size == 0 {
            return Err(PoolError::Options("pool size must be at least 1".into()));
        }
        if options.epoch.is_zero() {
            return Err(PoolError::Options("epoch must be positive".into()));
        }
        if let Err(e) = restore_sigchld() {
            warn!("could not restore SIGCHLD disposition: {e}");
        }
        let channels = HandshakeChannels::open()?;
        Ok(Self {
            table: WorkerTable::new(options.size),
            options,
            launcher,
            sampler,
            policy,
            channels: Some(channels),
            counters: GlobalCounters::new(),
            shutdown,
            unlaunched: BTreeMap::new(),
            ticks: 0,
            outcome: None,
            started_at: Utc::now(),
        })
    }

    pub fn table(&self) -> &WorkerTable {
        &self.table
    }

    pub fn counters(&self) -> &GlobalCounters {
        &self.counters
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn populate(&mut self) -> TickReport {
        self.counters.pool_started = Instant::now();
        self.started_at = Utc::now();
        let mut report = TickReport::new(0);
        self.relaunch(&mut report);
        report.active_after = self.counters.active_workers;
        info!(
            launched = report.relaunched.len(),
            failed = report.launch_errors.len(),
            size = self.options.size,
            "initial population done"
        );
        report
    }

    pub fn run(mut self) -> PoolReport {
        self.populate();
        let mut deadline = Instant::now() + self.options.epoch;
        while self.outcome.is_none() {
            let wake = self.wait_for_wake(deadline);
            if wake == Wake::Interrupt {
                break;
            }
            self.tick(wake);
            if wake == Wake::Epoch {
                deadline += self.options.epoch;
                let now = Instant::now();
                if deadline <= now {
                    deadline = now + self.options.epoch;
                }
            }
        }
        self.finish()
    }

    pub fn wait_for_wake(&self, deadline: Instant) -> Wake {
        loop {
            if self.shutdown_requested() {
                return Wake::Interrupt;
            }
            let now = Instant::now();
            if now >= deadline {
                return Wake::Epoch;
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            let Some(channels) = self.channels.as_ref() else {
                thread::sleep(slice);
                continue;
            };
            match channels.completion.wait(slice) {
                Ok(true) => return Wake::Completion,
                Ok(false) => {}
                Err(e) => {
                    warn!("waiting on completion channel failed: {e}");
                    thread::sleep(slice);
                }
            }
        }
    }

    pub fn tick(&mut self, wake: Wake) -> TickReport {
        self.ticks += 1;
        let mut report = TickReport::new(self.ticks);

        self.promote_acked(&mut report);
        self.collect_finished(&mut report);
        if self.outcome.is_some() {
            report.active_after = self.counters.active_workers;
            return report;
        }
        if wake == Wake::Epoch {
            self.prune(&mut report);
            if self.outcome.is_some() {
                report.active_after = self.counters.active_workers;
                return report;
            }
        }
        self.relaunch(&mut report);

        if self.table.live_count() == 0 && self.table.retired_count() == self.options.size as usize
        {
            warn!("every slot exhausted its replayed configurations");
            self.outcome = Some(Outcome::Exhausted);
        }
        debug_assert_eq!(self.counters.active_workers, self.table.live_count());
        report.active_after = self.counters.active_workers;
        debug!(
            tick = report.tick,
            completed = report.completed.len(),
            killed = report.killed.len(),
            relaunched = report.relaunched.len(),
            active = report.active_after,
            "tick done"
        );
        report
    }

    fn promote_acked(&mut self, report: &mut TickReport) {
        for slot in self.table.slots_in(WorkerState::Launching) {
            let acked = self
                .table
                .get(slot)
                .is_some_and(|w| w.acked_at.is_some());
            if acked {
                if let Some(t) = self.table.transition(slot, WorkerState::Running) {
                    report.transitions.push(t);
                }
            }
        }
    }

    fn collect_finished(&mut self, report: &mut TickReport) {
        // Checked before draining: anything these wrote is already in the pipe.
        let mut exited = Vec::new();
        for worker in self.table.live_workers_mut() {
            if let Some(child) = worker.supervisor.as_mut() {
                if let Ok(Some(_)) = child.try_wait() {
                    exited.push(worker.slot);
                }
            }
        }

        let tokens = match self.channels.as_mut().map(|c| c.completion.drain()) {
            Some(Ok(tokens)) => tokens,
            Some(Err(e)) => {
                warn!("draining completion channel failed: {e}");
                Vec::new()
            }
            None => Vec::new(),
        };

        for token in tokens {
            let current = self
                .table
                .get(token.slot)
                .filter(|w| w.generation == token.generation && w.state.is_live());
            if current.is_none() {
                debug!(
                    slot = token.slot,
                    generation = token.generation,
                    "ignoring stale completion notice"
                );
                continue;
            }
            self.finish_worker(token.slot, true, report);
        }

        for slot in exited {
            if self.table.state(slot).is_some_and(WorkerState::is_live) {
                warn!(slot, "supervisor exited without a completion notice");
                self.finish_worker(slot, false, report);
            }
        }
    }

    fn finish_worker(&mut self, slot: SlotId, notified: bool, report: &mut TickReport) {
        let Some(worker) = self.table.get_mut(slot) else {
            return;
        };
        let state = match self.launcher.reap(worker) {
            Ok(0) if notified => WorkerState::Completed,
            Ok(code) => {
                warn!(slot, code, "worker failed");
                WorkerState::Failed
            }
            Err(e) => {
                error!("{e}");
                WorkerState::Failed
            }
        };
        let Some(t) = self.table.transition(slot, state) else {
            return;
        };
        report.transitions.push(t);
        self.counters.active_workers = self.counters.active_workers.saturating_sub(1);

        if state != WorkerState::Completed {
            report.failed.push(slot);
            return;
        }
        report.completed.push(slot);
        let Some(worker) = self.table.get(slot) else {
            return;
        };
        let solver_secs = worker.elapsed(Instant::now()).as_secs_f64();
        info!(
            slot,
            generation = worker.generation,
            solver_secs,
            "worker completed"
        );
        if self.outcome.is_none() {
            report.first_success = Some(slot);
            self.outcome = Some(Outcome::Solved {
                slot,
                generation: worker.generation,
                configuration: worker.configuration.clone(),
                exit_code: worker.exit_code.unwrap_or(0),
                solver_secs,
            });
            info!(
                elapsed_secs = self.counters.elapsed().as_secs_f64(),
                "first success, stopping the pool"
            );
            self.shutdown.store(true, Ordering::SeqCst);
        }
    }

    fn prune(&mut self, report: &mut TickReport) {
        let Some(policy) = self.policy.as_mut() else {
            return;
        };
        if self.counters.active_workers <= policy.floor() {
            return;
        }
        let snapshot = self.table.snapshot();
        let kills = match policy.evaluate(&snapshot) {
            Ok(kills) => kills,
            Err(e) => {
                warn!("pruning skipped this tick: {e:#}");
                return;
            }
        };
        for slot in kills {
            if self.outcome.is_some() {
                break;
            }
            self.kill_worker(slot, report);
        }
    }

    fn kill_worker(&mut self, slot: SlotId, report: &mut TickReport) {
        let exited = match self.table.get_mut(slot) {
            Some(worker) if worker.state == WorkerState::Running => worker
                .supervisor
                .as_mut()
                .is_some_and(|child| matches!(child.try_wait(), Ok(Some(_)))),
            _ => return,
        };
        if exited {
            // Finished while the predictor was deciding; its notice is in the pipe.
            self.collect_finished(report);
            if self.table.state(slot) != Some(WorkerState::Running) {
                return;
            }
        }

        let Some(worker) = self.table.get_mut(slot) else {
            return;
        };
        info!(slot, generation = worker.generation, pid = worker.pid, "pruning worker");
        match self.launcher.terminate(worker) {
            Ok(Some(0)) => {
                info!(slot, "worker succeeded before it could be pruned");
                self.finish_worker(slot, true, report);
                return;
            }
            Ok(_) => {}
            Err(e) => error!("{e}"),
        }
        if let Some(t) = self.table.transition(slot, WorkerState::Killed) {
            report.transitions.push(t);
            report.killed.push(slot);
            self.counters.active_workers = self.counters.active_workers.saturating_sub(1);
            self.counters.kills += 1;
        }
    }

    fn relaunch(&mut self, report: &mut TickReport) {
        for slot in self.table.slots_needing_launch() {
            self.launch_slot(slot, report);
        }
    }

    fn launch_slot(&mut self, slot: SlotId, report: &mut TickReport) {
        let configuration = match self.unlaunched.remove(&slot) {
            Some(configuration) => configuration,
            None => match self.sampler.next_for(slot) {
                Ok(configuration) => configuration,
                Err(SamplerError::ExhaustedReplay(_)) => {
                    warn!(slot, "replay exhausted, retiring slot");
                    if let Some((_, t)) = self.table.vacate(slot) {
                        report.transitions.push(t);
                    }
                    self.table.retire(slot);
                    report.retired.push(slot);
                    return;
                }
                Err(e) => {
                    error!(slot, "no configuration for slot: {e}");
                    report.launch_errors.push(slot);
                    return;
                }
            },
        };

        let generation = self.counters.launch_attempts as u32;
        self.counters.launch_attempts += 1;
        let Some(channels) = self.channels.as_mut() else {
            return;
        };
        match self.launcher.launch(channels, slot, generation, &configuration) {
            Ok(worker) => match self.table.insert(worker) {
                Ok(t) => {
                    report.transitions.push(t);
                    report.relaunched.push(slot);
                    self.counters.active_workers += 1;
                    self.counters.total_launches += 1;
                }
                Err(mut stray) => {
                    error!(slot, "slot still occupied, discarding new worker");
                    if let Err(e) = self.launcher.terminate(&mut stray) {
                        error!("{e}");
                    }
                }
            },
            Err(e) => {
                warn!(slot = e.slot(), "launch failed, slot left empty: {e}");
                if let Some((_, t)) = self.table.vacate(slot) {
                    report.transitions.push(t);
                }
                self.unlaunched.insert(slot, configuration);
                report.launch_errors.push(slot);
            }
        }
    }

    pub fn finish(&mut self) -> PoolReport {
        self.stop_all();
        let outcome = self.outcome.clone().unwrap_or(Outcome::Interrupted);
        let report = PoolReport {
            outcome,
            started_at: self.started_at,
            elapsed_secs: self.counters.elapsed().as_secs_f64(),
            ticks: self.ticks,
            total_launches: self.counters.total_launches,
            launch_attempts: self.counters.launch_attempts,
            kills: self.counters.kills,
        };
        info!(
            elapsed_secs = report.elapsed_secs,
            ticks = report.ticks,
            launches = report.total_launches,
            "pool shut down"
        );
        report
    }

    fn stop_all(&mut self) {
        let slots: Vec<SlotId> = self.table.live_workers_mut().map(|w| w.slot).collect();
        for slot in slots {
            if let Some(worker) = self.table.get_mut(slot) {
                if let Err(e) = self.launcher.terminate(worker) {
                    error!("{e}");
                }
            }
            if self.table.transition(slot, WorkerState::Killed).is_some() {
                self.counters.active_workers = self.counters.active_workers.saturating_sub(1);
            }
        }
        // Dropping the channels releases the descriptors; supervisors that are
        // gone no longer hold the write ends.
        self.channels = None;
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.table.live_count() > 0 {
            self.stop_all();
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("options", &self.options)
            .field("active_workers", &self.counters.active_workers)
            .field("ticks", &self.ticks)
            .field("pruning", &self.policy.is_some())
            .field("replay", &self.sampler.is_replay())
            .finish()
    }
}
