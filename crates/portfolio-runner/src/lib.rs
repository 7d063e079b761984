//! Portfolio search over a pool of supervised solver processes.

pub mod channel;
pub mod control;
pub mod error;
pub mod launcher;
pub mod prune;
pub mod sampler;
pub mod supervisor;
pub mod table;

pub use control::{Orchestrator, Outcome, PoolOptions, PoolReport, TickReport, Wake};
pub use error::{ChannelSetupError, LaunchError, PoolError, PoolResult, ReapError, SamplerError};
pub use launcher::{LaunchSpec, Launcher, SUPERVISE_SUBCOMMAND};
pub use prune::{CommandPredictor, Decision, FeatureRow, Predictor, PruningPolicy};
pub use sampler::{ConfigSampler, SearchSpace};
pub use supervisor::SupervisorArgs;
pub use table::{SlotId, WorkerState, WorkerTable};
