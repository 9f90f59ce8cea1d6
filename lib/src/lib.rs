//! # fuzzgrid
//! fuzzgrid runs fuzzing campaigns against network protocol implementations and spreads the
//! executions over a pool of agents, local or remote.
//! We use [tokio](https://tokio.rs/) for async networking.
//! ## How a campaign runs
//! - A [`campaign::Campaign`] owns one worker per target. The worker asks a
//!   [`collaborators::PayloadGenerator`] for the next payload, opens a protocol session if the
//!   protocol needs one and submits the request.
//! - The [`scheduler::Scheduler`] hands the request to the least loaded healthy agent that can
//!   reach the target. Requests of one session go to one agent, in order.
//! - An agent runs the request through its [`harness::Harness`]: frame with the protocol plugin,
//!   exchange under a watchdog, classify the response.
//! - Results are deduplicated by crash fingerprint, aggregated into a summary and optionally
//!   judged and fed back to the generator.
//!
//! The built-in generator in [`markov`] mutates protocol seeds with a markov chain.
pub mod agent;
pub mod aggregate;
pub mod campaign;
pub mod collaborators;
pub mod config;
pub mod dedup;
pub mod execution;
pub mod harness;
pub mod markov;
pub mod network;
pub mod process_monitor;
pub mod protocol;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod target;
