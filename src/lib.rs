//! # campaign-director
//!
//! `campaign-director` runs multi-machine concurrency-testing campaigns. It is organised around:
//! - `director`: validates a campaign, plans every machine and runs one instance per machine
//! - `instance`: the per-machine loop (launch, retry with backoff, apply mutant changes)
//! - `cycle`: one pass through the perturb, fuzz, lift, invoke and analyse stages
//! - `mutation`: mutant ranges, kill analysis and the mutant scheduler
//! - `forward`: fan-in of concurrent instance events into serial handler sinks
//! - `env` / `command`: the collaborator traits and external-program stage runners
//!
//! Stage internals (how subjects are fuzzed, compiled and run) live in the stage programs, not
//! in this crate.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod command;
pub mod config;
pub mod context;
pub mod cycle;
pub mod director;
pub mod env;
pub mod forward;
pub mod instance;
pub mod logger;
pub mod machine;
pub mod mutation;
pub mod observer;
pub mod plan;
pub mod prelude;
pub mod stats;
