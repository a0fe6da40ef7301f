//! ACME Load Generator
//!
//! A library and CLI tool for driving an ACME certificate issuance service
//! with a population of simulated accounts at a controlled request rate.
//!
//! # Modules
//!
//! - [`actors`]: Simulated accounts (Actor, ActorStore) and snapshot/restore
//! - [`nonce`]: Replay-nonce pool
//! - [`client`]: ACME client and JWS signing
//! - [`workloads`]: Protocol actions and weighted action selection
//! - [`runner`]: Rate control, warmup, and the dispatch loop
//! - [`process`]: Challenge responder subprocess management
//! - [`challsrv`]: The challenge responder itself
//! - [`config`]: Configuration types
//! - [`latency`]: Per-call latency recording

pub mod actors;
pub mod challsrv;
pub mod client;
pub mod config;
pub mod latency;
pub mod nonce;
pub mod process;
pub mod runner;
pub mod workloads;

pub use actors::{Actor, ActorStore, RestoreSummary, SnapshotError};
pub use client::{AcmeClient, ClientError};
pub use config::{ActionWeights, LoadgenConfig, RatePeriod};
pub use latency::LatencyRecorder;
pub use nonce::NoncePool;
pub use runner::{EngineError, LoadGenerator, RunReport, RunState};
pub use workloads::{AcmeWorkload, ActionKind, ActionSelector, Workload};
