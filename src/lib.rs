//! # Scout
//!
//! A checkpointed orchestration engine for multi-step research runs: a
//! planner proposes steps, an executor gathers evidence through tools
//! (fanning searches out across themes), an evaluator judges each step,
//! and a reporter synthesizes the result. Every phase transition is
//! durably checkpointed so runs pause, resume, and survive restarts.
//!
//! ## Modules
//!
//! - `approval` - Fingerprint-keyed human approval gate for risky actions
//! - `checkpoint` - Durable per-run snapshots with stale-writer fencing
//! - `config` - Runtime knobs, loadable from TOML
//! - `controller` - The phase loop driving one run
//! - `decision` - Validated boundary to the opaque decision function
//! - `error` - Engine error taxonomy
//! - `events` - Progress notifications for an external transport
//! - `fanout` - Bounded-concurrency search fan-out and deterministic fan-in
//! - `orchestrator` - Management facade over live and checkpointed runs
//! - `state` - Shared run state, reducers, and the keyed store
//! - `tools` - Uniform adapters for search, terminal, file, and knowledge
//! - `testing` - Scripted doubles for hermetic engine tests

pub mod approval;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod decision;
pub mod error;
pub mod events;
pub mod fanout;
pub mod orchestrator;
pub mod state;
pub mod tools;

pub mod testing;
