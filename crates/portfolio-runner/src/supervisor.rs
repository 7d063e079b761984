use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::Command;

use nix::errno::Errno;
use nix::sys::resource::{getrlimit, Resource};
use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::{debug, error, info, warn};

use crate::channel::{Token, TokenWriter};
use crate::table::SlotId;

pub const SPAWN_FAILED_EXIT: i32 = 127;

#[derive(Debug, Clone)]
pub struct SupervisorArgs {
    pub slot: SlotId,
    pub generation: u32,
    pub start_fd: RawFd,
    pub done_fd: RawFd,
    pub command: Vec<String>,
}

pub fn run(args: SupervisorArgs) -> i32 {
    if let Err(e) = reset_dispositions() {
        warn!(slot = args.slot, "could not reset signal dispositions: {e}");
    }

    // Safety: both descriptors were handed to this process by the
    // orchestrator and nothing else here refers to them.
    let writers = unsafe {
        TokenWriter::from_raw_fd(args.start_fd)
            .and_then(|start| Ok((start, TokenWriter::from_raw_fd(args.done_fd)?)))
    };
    let (mut start, mut done) = match writers {
        Ok(w) => w,
        Err(e) => {
            error!(slot = args.slot, "handshake descriptors unusable: {e}");
            return SPAWN_FAILED_EXIT;
        }
    };

    let Some((program, rest)) = args.command.split_first() else {
        error!(slot = args.slot, "empty solver command");
        return SPAWN_FAILED_EXIT;
    };
    let mut cmd = Command::new(program);
    cmd.args(rest);
    // Safety: the hook only calls signal(2), which is async-signal-safe.
    unsafe {
        cmd.pre_exec(|| {
            for sig in [Signal::SIGINT, Signal::SIGQUIT] {
                signal(sig, SigHandler::SigDfl).map_err(io::Error::from)?;
            }
            Ok(())
        });
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(slot = args.slot, program = %program, "solver spawn failed: {e}");
            if e.raw_os_error() == Some(Errno::EAGAIN as i32) {
                log_nproc_limits();
            }
            return SPAWN_FAILED_EXIT;
        }
    };

    let token = Token::new(args.slot, args.generation);
    if let Err(e) = start.send(token) {
        // The orchestrator will time out on this launch and kill our group.
        error!(slot = args.slot, "start ack failed: {e}");
    }
    drop(start);
    debug!(slot = args.slot, pid = child.id(), "solver started");

    let code = match child.wait() {
        Ok(status) => status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
        Err(e) => {
            error!(slot = args.slot, "wait on solver failed: {e}");
            -1
        }
    };
    info!(slot = args.slot, generation = args.generation, code, "solver exited");

    if let Err(e) = done.send(token) {
        error!(slot = args.slot, "completion notice failed: {e}");
    }
    code
}

fn reset_dispositions() -> nix::Result<()> {
    restore_sigchld()?;
    // Safety: installs only SIG_IGN, no handler code.
    unsafe {
        signal(Signal::SIGINT, SigHandler::SigIgn)?;
        signal(Signal::SIGQUIT, SigHandler::SigIgn)?;
    }
    Ok(())
}

pub(crate) fn restore_sigchld() -> nix::Result<()> {
    // Safety: installs SIG_DFL only.
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) }.map(drop)
}

pub(crate) fn log_nproc_limits() {
    match getrlimit(Resource::RLIMIT_NPROC) {
        Ok((soft, hard)) => warn!(soft, hard, "RLIMIT_NPROC"),
        Err(e) => warn!("getrlimit(RLIMIT_NPROC) failed: {e}"),
    }
}
