//! Mutation testing: mutant ranges, per-cycle kill analysis, and the mutant scheduler.

pub mod analysis;
pub mod automator;
pub mod config;

pub use analysis::{Analysis, MutantAnalysis, SelectionRecord};
pub use automator::{Automator, AutomatorHandles, KillObserver, MutationError};
pub use config::{AutoConfig, Config, Mutant, Range};
