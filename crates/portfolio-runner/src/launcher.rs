use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::channel::{set_cloexec, HandshakeChannels, Token};
use crate::error::{LaunchError, ReapError};
use crate::supervisor::log_nproc_limits;
use crate::table::{SlotId, Worker, WorkerState};

pub const SUPERVISE_SUBCOMMAND: &str = "__supervise";

const ACK_POLL_SLICE: Duration = Duration::from_millis(50);
const REAP_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub supervisor_exe: PathBuf,
    pub solver: String,
    pub filetype: String,
    pub input: PathBuf,
    pub train_file: PathBuf,
    pub record: bool,
    pub pin_cpus: Option<usize>,
    pub handshake_timeout: Duration,
    pub kill_grace: Duration,
}

#[derive(Debug)]
pub struct Launcher {
    spec: LaunchSpec,
}

impl Launcher {
    pub fn new(spec: LaunchSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn solver_argv(&self, slot: SlotId, configuration: &str) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(cpus) = self.spec.pin_cpus.filter(|c| *c > 0) {
            argv.push("taskset".to_string());
            argv.push("-c".to_string());
            argv.push((slot as usize % cpus).to_string());
        }
        argv.push(self.spec.solver.clone());
        if !self.spec.filetype.is_empty() {
            argv.push(format!("-{}", self.spec.filetype));
        }
        argv.push(self.spec.input.to_string_lossy().to_string());
        argv.extend(configuration.split_whitespace().map(str::to_string));
        argv
    }

    pub fn feature_file(&self, slot: SlotId, generation: u32) -> PathBuf {
        tagged_path(&self.spec.train_file, slot, generation)
    }

    /// Spawns a supervisor for `slot` and blocks until its start ack arrives.
    /// On any failure the supervisor tree is killed and reaped before
    /// returning, leaving the slot empty.
    pub fn launch(
        &self,
        channels: &mut HandshakeChannels,
        slot: SlotId,
        generation: u32,
        configuration: &str,
    ) -> Result<Worker, LaunchError> {
        let (start_fd, done_fd) = channels.writer_fds();
        let feature_file = self.feature_file(slot, generation);

        let mut cmd = Command::new(&self.spec.supervisor_exe);
        cmd.arg(SUPERVISE_SUBCOMMAND)
            .args(["--slot", &slot.to_string()])
            .args(["--generation", &generation.to_string()])
            .args(["--start-fd", &start_fd.to_string()])
            .args(["--done-fd", &done_fd.to_string()])
            .arg("--")
            .args(self.solver_argv(slot, configuration));
        cmd.env("PROCNUM", slot.to_string());
        cmd.env("FILENAME", &feature_file);
        cmd.env("TRAIN", if self.spec.record { "1" } else { "0" });
        cmd.stdin(Stdio::null());
        cmd.process_group(0);
        // Safety: only fcntl(2) runs between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                set_cloexec(start_fd, false)?;
                set_cloexec(done_fd, false)
            });
        }

        let launched_at = Instant::now();
        let mut child = cmd.spawn().map_err(|source| {
            if source.raw_os_error() == Some(Errno::EAGAIN as i32) {
                log_nproc_limits();
            }
            LaunchError::Spawn { slot, source }
        })?;
        let pid = child.id();

        let expected = Token::new(slot, generation);
        let deadline = launched_at + self.spec.handshake_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                abandon(&mut child);
                return Err(LaunchError::AckTimeout {
                    slot,
                    timeout_ms: self.spec.handshake_timeout.as_millis() as u64,
                });
            }
            let tokens = match channels.start.recv_timeout(remaining.min(ACK_POLL_SLICE)) {
                Ok(tokens) => tokens,
                Err(source) => {
                    abandon(&mut child);
                    return Err(LaunchError::Channel { slot, source });
                }
            };
            if acked(&tokens, expected) {
                break;
            }
            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    // An ack written just before a very short solver exited.
                    let late = channels.start.recv_timeout(Duration::ZERO).unwrap_or_default();
                    if acked(&late, expected) {
                        break;
                    }
                    return Err(LaunchError::SupervisorExited {
                        slot,
                        status: describe_status(status),
                    });
                }
                Err(source) => {
                    abandon(&mut child);
                    return Err(LaunchError::Channel { slot, source });
                }
            }
        }

        let acked_at = Instant::now();
        info!(
            slot,
            generation,
            pid,
            ack_ms = acked_at.duration_since(launched_at).as_millis() as u64,
            "worker launched"
        );
        Ok(Worker {
            slot,
            generation,
            pid,
            configuration: configuration.to_string(),
            feature_file,
            launched_at,
            acked_at: Some(acked_at),
            finished_at: None,
            exit_code: None,
            state: WorkerState::Launching,
            supervisor: Some(child),
        })
    }

    pub fn terminate(&self, worker: &mut Worker) -> Result<Option<i32>, ReapError> {
        let Some(child) = worker.supervisor.as_mut() else {
            return Ok(worker.exit_code);
        };
        signal_group(child.id(), Signal::SIGTERM);
        let deadline = Instant::now() + self.spec.kill_grace;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() < deadline => thread::sleep(REAP_POLL),
                Ok(None) => {
                    warn!(slot = worker.slot, pid = worker.pid, "grace period over, sending SIGKILL");
                    signal_group(child.id(), Signal::SIGKILL);
                    break child.wait().map_err(|source| reap_error(worker.slot, worker.pid, source))?;
                }
                Err(source) => return Err(reap_error(worker.slot, worker.pid, source)),
            }
        };
        let code = exit_code(status);
        worker.exit_code = Some(code);
        worker.supervisor = None;
        Ok(Some(code))
    }

    pub fn reap(&self, worker: &mut Worker) -> Result<i32, ReapError> {
        let Some(child) = worker.supervisor.as_mut() else {
            return worker.exit_code.ok_or_else(|| {
                reap_error(
                    worker.slot,
                    worker.pid,
                    io::Error::new(io::ErrorKind::NotFound, "supervisor already released"),
                )
            });
        };
        let status = child
            .wait()
            .map_err(|source| reap_error(worker.slot, worker.pid, source))?;
        let code = exit_code(status);
        debug!(slot = worker.slot, pid = worker.pid, code, "supervisor reaped");
        worker.exit_code = Some(code);
        worker.supervisor = None;
        Ok(code)
    }
}

fn acked(tokens: &[Token], expected: Token) -> bool {
    let mut found = false;
    for token in tokens {
        if *token == expected {
            found = true;
        } else {
            warn!(
                slot = token.slot,
                generation = token.generation,
                "discarding stale start ack"
            );
        }
    }
    found
}

fn abandon(child: &mut Child) {
    signal_group(child.id(), Signal::SIGKILL);
    if let Err(e) = child.wait() {
        warn!(pid = child.id(), "could not reap abandoned supervisor: {e}");
    }
}

fn signal_group(pgid: u32, sig: Signal) {
    match killpg(Pid::from_raw(pgid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, signal = sig.as_str(), "killpg failed: {e}"),
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn describe_status(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(sig)) => format!("signal {sig}"),
        _ => "unknown status".to_string(),
    }
}

fn reap_error(slot: SlotId, pid: u32, source: io::Error) -> ReapError {
    ReapError { slot, pid, source }
}

fn tagged_path(base: &Path, slot: SlotId, generation: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{slot}.{generation}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            supervisor_exe: PathBuf::from("/nonexistent/portfolio"),
            solver: "z3".to_string(),
            filetype: "smt2".to_string(),
            input: PathBuf::from("/data/problem.smt2"),
            train_file: PathBuf::from("/tmp/train.csv"),
            record: true,
            pin_cpus: None,
            handshake_timeout: Duration::from_millis(200),
            kill_grace: Duration::from_millis(200),
        }
    }

    #[test]
    fn solver_argv_is_prefix_then_tokens() {
        let launcher = Launcher::new(spec());
        assert_eq!(
            launcher.solver_argv(2, "sat.phase=random  sat.restart=luby"),
            vec![
                "z3",
                "-smt2",
                "/data/problem.smt2",
                "sat.phase=random",
                "sat.restart=luby"
            ]
        );
    }

    #[test]
    fn pinned_argv_wraps_solver_in_taskset() {
        let launcher = Launcher::new(LaunchSpec {
            pin_cpus: Some(4),
            filetype: String::new(),
            ..spec()
        });
        assert_eq!(
            launcher.solver_argv(6, "a=1"),
            vec!["taskset", "-c", "2", "z3", "/data/problem.smt2", "a=1"]
        );
    }

    #[test]
    fn feature_file_is_tagged_with_slot_and_generation() {
        let launcher = Launcher::new(spec());
        assert_eq!(
            launcher.feature_file(3, 11),
            PathBuf::from("/tmp/train.csv.3.11")
        );
    }

    #[test]
    fn missing_supervisor_binary_is_a_spawn_error() {
        let launcher = Launcher::new(spec());
        let mut channels = HandshakeChannels::open().expect("channels");
        let err = launcher
            .launch(&mut channels, 1, 0, "a=1")
            .expect_err("binary does not exist");
        assert!(matches!(err, LaunchError::Spawn { slot: 1, .. }), "{err}");
    }

    #[test]
    fn supervisor_that_never_acks_times_out() {
        let launcher = Launcher::new(LaunchSpec {
            supervisor_exe: PathBuf::from("/bin/sleep"),
            ..spec()
        });
        let mut channels = HandshakeChannels::open().expect("channels");
        let err = launcher
            .launch(&mut channels, 0, 0, "")
            .expect_err("no ack");
        assert!(
            matches!(
                err,
                LaunchError::AckTimeout { slot: 0, .. } | LaunchError::SupervisorExited { slot: 0, .. }
            ),
            "{err}"
        );
    }
}
