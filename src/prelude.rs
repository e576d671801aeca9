//! Prelude module for convenient imports.
//!
//! # Example
//!
//! ```rust,ignore
//! use campaign_director::prelude::*;
//! ```

pub use crate::command::{CommandSpec, CommandStages};
pub use crate::config::{CampaignConfig, FilterSet, FuzzerConfig};
pub use crate::context::{Cancelled, Canceller, Context};
pub use crate::cycle::{Cycle, CycleError, CycleExecutor, StageKind};
pub use crate::director::{Director, DirectorError, Options};
pub use crate::env::{
    BoxError, CorpusPlanner, CycleEnv, Environment, Planner, Stage, StageFactory, StageSet, Stages,
};
pub use crate::forward::{Forwarder, InstanceForwarder, Registrar};
pub use crate::instance::{BACKOFF, Instance, InstanceError};
pub use crate::logger::LogHandler;
pub use crate::machine::{Machine, MachineConfig, MachineId, Pathset, QuantitySet};
pub use crate::mutation::{Analysis, Automator, KillObserver, Mutant, Range};
pub use crate::observer::{
    CycleMessage, CycleObserver, DirectorObserver, Event, Forward, Handler, InstanceMessage, Kind,
    Observer, Progress,
};
pub use crate::plan::{Plan, Status};
pub use crate::stats::{CampaignStats, StatsPersister};
