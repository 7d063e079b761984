use std::io;

use thiserror::Error;

use crate::table::SlotId;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn supervisor for slot {slot}: {source}")]
    Spawn {
        slot: SlotId,
        #[source]
        source: io::Error,
    },
    #[error("supervisor for slot {slot} exited before acking ({status})")]
    SupervisorExited { slot: SlotId, status: String },
    #[error("no start ack from slot {slot} within {timeout_ms}ms")]
    AckTimeout { slot: SlotId, timeout_ms: u64 },
    #[error("start channel failed while waiting on slot {slot}: {source}")]
    Channel {
        slot: SlotId,
        #[source]
        source: io::Error,
    },
}

impl LaunchError {
    pub fn slot(&self) -> SlotId {
        match self {
            LaunchError::Spawn { slot, .. }
            | LaunchError::SupervisorExited { slot, .. }
            | LaunchError::AckTimeout { slot, .. }
            | LaunchError::Channel { slot, .. } => *slot,
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to reap supervisor pid {pid} (slot {slot}): {source}")]
pub struct ReapError {
    pub slot: SlotId,
    pub pid: u32,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("replay log has no configuration left for slot {0}")]
    ExhaustedReplay(SlotId),
    #[error("could not draw a fresh configuration after {0} attempts")]
    Saturated(usize),
    #[error("configuration log {path}: {source}")]
    Log {
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
#[error("handshake channel setup failed ({what}): {source}")]
pub struct ChannelSetupError {
    pub what: &'static str,
    #[source]
    pub source: nix::Error,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    ChannelSetup(#[from] ChannelSetupError),
    #[error("invalid pool options: {0}")]
    Options(String),
}

pub type PoolResult<T> = Result<T, PoolError>;
